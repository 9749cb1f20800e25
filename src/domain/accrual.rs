use super::order::OrderNumber;
use crate::error::{AccrualError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Loyalty points awarded for an order. Never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Points(Decimal);

impl Points {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self> {
        if value >= Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(AccrualError::Contract(format!(
                "accrual must not be negative, got {value}"
            )))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Points {
    type Error = AccrualError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Points> for Decimal {
    fn from(points: Points) -> Self {
        points.0
    }
}

/// Persisted accrual status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccrualStatus {
    New,
    Processing,
    Invalid,
    Processed,
}

impl AccrualStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccrualStatus::New => "NEW",
            AccrualStatus::Processing => "PROCESSING",
            AccrualStatus::Invalid => "INVALID",
            AccrualStatus::Processed => "PROCESSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AccrualStatus::Invalid | AccrualStatus::Processed)
    }
}

impl fmt::Display for AccrualStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccrualStatus {
    type Err = AccrualError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(AccrualStatus::New),
            "PROCESSING" => Ok(AccrualStatus::Processing),
            "INVALID" => Ok(AccrualStatus::Invalid),
            "PROCESSED" => Ok(AccrualStatus::Processed),
            other => Err(AccrualError::Contract(format!(
                "unknown accrual status {other:?}"
            ))),
        }
    }
}

/// The two outcomes that end an order's stay in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Invalid,
    Processed,
}

impl From<TerminalStatus> for AccrualStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Invalid => AccrualStatus::Invalid,
            TerminalStatus::Processed => AccrualStatus::Processed,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        AccrualStatus::from(*self).fmt(f)
    }
}

/// Status and amount recorded for one order. Created on submission, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccrualRecord {
    pub order: OrderNumber,
    pub status: AccrualStatus,
    pub accrual: Points,
}

impl AccrualRecord {
    pub fn new(order: OrderNumber) -> Self {
        Self {
            order,
            status: AccrualStatus::New,
            accrual: Points::ZERO,
        }
    }

    pub fn finalize(&mut self, status: TerminalStatus, accrual: Points) {
        self.status = status.into();
        self.accrual = accrual;
    }
}
