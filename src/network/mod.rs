//! Network state for shopsync
//!
//! Connectivity is an external collaborator boundary: the platform
//! supplies the actual reachability signal, this module only models it.

pub mod monitor;

pub use monitor::{NetworkMonitor, SharedNetwork};
