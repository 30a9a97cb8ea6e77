//! Distributed execution
//!
//! A coordinator owns the unit queue and the fleet-wide build registry;
//! workers connect with a shared passkey and pull units until none remain.

mod coordinator;
mod protocol;
mod worker;

pub use coordinator::{plan_units, BuildRegistry, Coordinator, CoordinatorOptions, WorkQueue};
pub use protocol::{Envelope, ProtocolError, Reply, Request};
pub use worker::{Connection, RemoteAuthority, RemoteSink, Worker};
