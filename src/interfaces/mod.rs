//! Adapters to the outside world: the accrual service over HTTP and CSV files.

pub mod csv;
pub mod http;
