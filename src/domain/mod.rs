//! Domain types and the storage capabilities the engine depends on.

pub mod account;
pub mod accrual;
pub mod order;
pub mod ports;
pub mod resolution;
