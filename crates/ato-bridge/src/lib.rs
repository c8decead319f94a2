//! Event fan-out between the task orchestrator and its observers.
//!
//! - [`protocol`] -- the tagged [`protocol::TaskEvent`] notifications
//! - [`event_bus`] -- publish/subscribe bus delivering them to any number of receivers

pub mod event_bus;
pub mod protocol;
