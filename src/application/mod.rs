//! The accrual polling engine.
//!
//! A single [`scheduler::LeaseScheduler`] leases the stalest queued order and
//! hands it through a one-slot channel to a fixed pool of
//! [`worker::Worker`]s. Each worker polls the accrual service once and lets the
//! [`reconciler::Reconciler`] either finalize the order or give its lease back.
//! [`engine::AccrualEngine`] supervises all of it as one unit.

pub mod engine;
pub mod reconciler;
pub mod scheduler;
pub mod sweeper;
pub mod worker;
