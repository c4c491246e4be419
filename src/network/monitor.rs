//! Network connectivity observation
//!
//! The offline queue checks connectivity before every drain attempt and
//! reacts to the offline→online transition. The platform layer (or a
//! test) drives a [`SharedNetwork`] instance; everything else consumes
//! the [`NetworkMonitor`] trait.

use std::sync::Arc;
use tokio::sync::watch;

/// Point-in-time connectivity query plus transition notification
pub trait NetworkMonitor: Send + Sync {
    /// Whether the device is currently online
    fn is_online(&self) -> bool;

    /// Subscribe to connectivity transitions
    ///
    /// The receiver yields the current state on change; dropping it
    /// unsubscribes.
    fn watch(&self) -> watch::Receiver<bool>;
}

/// An in-process connectivity monitor driven by the platform layer
pub struct SharedNetwork {
    tx: watch::Sender<bool>,
}

impl SharedNetwork {
    /// Create a monitor with the given initial state
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Report a connectivity change
    pub fn set_online(&self, online: bool) {
        // send_replace so the value updates even with no subscribers
        self.tx.send_replace(online);
    }
}

impl NetworkMonitor for SharedNetwork {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl NetworkMonitor for Arc<SharedNetwork> {
    fn is_online(&self) -> bool {
        self.as_ref().is_online()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.as_ref().watch()
    }
}
