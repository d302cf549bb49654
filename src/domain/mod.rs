//! Domain layer
//!
//! Port traits separating the control loop from the cluster, the event
//! stream and the metrics sink.

pub mod ports;

pub use ports::*;
