//! # Connectivity Signal
//!
//! Thin wrapper over a watch channel carrying the current reachability
//! flag. The host application flips it from its own network probe; the
//! offline queue reacts to the transitions.

use tokio::sync::watch;
use tracing::info;

/// Publisher half of the connectivity signal.
///
/// Keep this alive for as long as any subscriber is listening; dropping
/// it ends the subscribers' streams.
#[derive(Debug)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(initial_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initial_online);
        Self { tx }
    }

    /// Current reachability flag.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe to transitions. The receiver also exposes the current
    /// value, so subscribers never start from an unknown state.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn set_online(&self) {
        self.set(true);
    }

    pub fn set_offline(&self) {
        self.set(false);
    }

    /// Subscribers are only woken on a genuine transition.
    fn set(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(target: "connectivity", online, "Connectivity changed");
        }
    }
}
