use crate::error::{AccrualError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A user-submitted order identifier.
///
/// Order numbers are strings of ASCII digits that pass the Luhn checksum.
/// Construction through [`OrderNumber::parse`] enforces both rules; stores
/// trust the numbers they hand back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderNumber(String);

impl OrderNumber {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) || !luhn_valid(raw) {
            return Err(AccrualError::InvalidOrderNumber(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Wraps a number read back from a store without re-validating it.
    pub(crate) fn trusted(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for OrderNumber {
    type Error = AccrualError;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

fn luhn_valid(digits: &str) -> bool {
    let sum: u32 = digits
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Proof of holding the lease on one queue entry.
///
/// `token` changes on every claim, so a lease that expired and was claimed
/// again cannot be used to release or finalize the newer claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lease {
    pub order: OrderNumber,
    pub token: u64,
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.order, self.token)
    }
}

/// One row per order awaiting accrual resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub order: OrderNumber,
    pub user_id: i64,
    /// Insertion sequence; breaks ties between equal `last_checked_at` values.
    pub seq: u64,
    pub last_checked_at: DateTime<Utc>,
    /// The lease flag.
    pub in_handling: bool,
    /// Bumped by every claim.
    #[serde(default)]
    pub lease_token: u64,
}

impl QueueEntry {
    pub fn new(order: OrderNumber, user_id: i64, seq: u64, now: DateTime<Utc>) -> Self {
        Self {
            order,
            user_id,
            seq,
            last_checked_at: now,
            in_handling: false,
            lease_token: 0,
        }
    }

    /// Staleness key: oldest check first, insertion order among equals.
    pub fn priority(&self) -> (DateTime<Utc>, u64) {
        (self.last_checked_at, self.seq)
    }

    pub fn lease(&mut self, now: DateTime<Utc>) -> Lease {
        self.in_handling = true;
        self.last_checked_at = now;
        self.lease_token += 1;
        Lease {
            order: self.order.clone(),
            token: self.lease_token,
        }
    }

    /// True while `lease` is the current, unexpired claim on this entry.
    pub fn is_held_by(&self, lease: &Lease) -> bool {
        self.in_handling && self.lease_token == lease.token && self.order == lease.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_luhn_valid_numbers() {
        assert!(OrderNumber::parse("79927398713").is_ok());
        assert!(OrderNumber::parse("12345678903").is_ok());
        assert_eq!(OrderNumber::parse(" 0 ").unwrap().as_str(), "0");
    }

    #[test]
    fn test_parse_rejects_bad_checksum_and_non_digits() {
        assert!(matches!(
            OrderNumber::parse("79927398710"),
            Err(AccrualError::InvalidOrderNumber(_))
        ));
        assert!(OrderNumber::parse("").is_err());
        assert!(OrderNumber::parse("7992-7398713").is_err());
        assert!(OrderNumber::parse("abc").is_err());
    }

    #[test]
    fn test_queue_entry_lease_refreshes_priority() {
        let t0 = Utc::now();
        let mut entry = QueueEntry::new(OrderNumber::parse("79927398713").unwrap(), 1, 7, t0);
        assert!(!entry.in_handling);

        let t1 = t0 + chrono::Duration::seconds(5);
        let lease = entry.lease(t1);
        assert!(entry.in_handling);
        assert_eq!(entry.priority(), (t1, 7));
        assert!(entry.is_held_by(&lease));
    }

    #[test]
    fn test_expired_lease_does_not_match_a_new_claim() {
        let now = Utc::now();
        let mut entry = QueueEntry::new(OrderNumber::parse("79927398713").unwrap(), 1, 0, now);

        let first = entry.lease(now);
        entry.in_handling = false;
        assert!(!entry.is_held_by(&first));

        let second = entry.lease(now);
        assert_ne!(first.token, second.token);
        assert!(!entry.is_held_by(&first));
        assert!(entry.is_held_by(&second));
    }
}
