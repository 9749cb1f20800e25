use super::accrual::Points;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// A loyalty balance amount.
///
/// Wraps `rust_decimal::Decimal` so balances and accrual amounts cannot be
/// mixed up with arbitrary numbers.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Balance(pub Decimal);

impl Balance {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }
}

impl From<Points> for Balance {
    fn from(points: Points) -> Self {
        Self(points.value())
    }
}

impl Add for Balance {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Balance {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

/// A user's loyalty account.
///
/// `available` is credited by finalized orders; `withdrawn` is owned by the
/// withdrawal flow and only read here.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct UserBalance {
    pub user_id: i64,
    pub available: Balance,
    pub withdrawn: Balance,
}

impl UserBalance {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            available: Balance::ZERO,
            withdrawn: Balance::ZERO,
        }
    }

    /// Credits accrued points. `Points` is non-negative, so `available` can only grow.
    pub fn credit(&mut self, points: Points) {
        self.available += points.into();
    }
}
