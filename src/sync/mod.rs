//! Synchronization primitives for shopsync
//!
//! This module provides the FIFO-fair mutual exclusion guard that
//! serializes cart mutations, and the deadline wrapper every network
//! call goes through.

pub mod mutex;
pub mod timeout;

pub use mutex::{FairMutex, FairMutexGuard};
pub use timeout::{with_timeout, TimeoutError, TimeoutOptions};
