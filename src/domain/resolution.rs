use super::accrual::{Points, TerminalStatus};
use std::fmt;

/// Why an order went back to the claimable pool instead of being finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    /// The service answered 200 with a non-terminal status (e.g. `REGISTERED`).
    Pending(String),
    /// 429: the worker that saw it cools down before taking more work.
    RateLimited,
    /// 500.
    ServerError,
    /// Any other HTTP status.
    UnexpectedStatus(u16),
    /// The request outlived its deadline.
    TimedOut,
    /// The answer was cut off mid-body or redirected in a loop.
    Transport(String),
    /// The engine stopped before a worker picked the order up.
    Shutdown,
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::Pending(status) => write!(f, "pending ({status})"),
            DeferReason::RateLimited => f.write_str("rate limited"),
            DeferReason::ServerError => f.write_str("server error"),
            DeferReason::UnexpectedStatus(code) => write!(f, "unexpected status {code}"),
            DeferReason::TimedOut => f.write_str("timed out"),
            DeferReason::Transport(cause) => write!(f, "transport error ({cause})"),
            DeferReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Outcome of one accrual poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Finalize {
        status: TerminalStatus,
        accrual: Points,
    },
    Defer(DeferReason),
}

impl Resolution {
    /// True when the worker must pause before accepting more orders.
    pub fn requires_cooldown(&self) -> bool {
        matches!(self, Resolution::Defer(DeferReason::RateLimited))
    }
}
