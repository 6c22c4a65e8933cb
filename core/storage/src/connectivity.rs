//! Online/offline state shared between the remote client and the sync engine.

use tokio::sync::watch;
use tracing::{debug, info};

/// Observable connectivity flag.
///
/// Clones share the same underlying state, so the handle can be injected into
/// every component that needs it. Platform code feeds transitions through
/// [`ConnectivityMonitor::set_online`].
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    /// Create a monitor seeded from the platform's current connectivity signal.
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self { state }
    }

    /// Current connectivity.
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record a connectivity change reported by the platform.
    ///
    /// Only actual changes notify subscribers.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            if online {
                info!("Connectivity restored");
            } else {
                info!("Connectivity lost");
            }
        }
    }

    /// Subscribe to offline->online transitions.
    ///
    /// Dropping the returned subscription unsubscribes.
    pub fn subscribe(&self) -> ConnectivitySubscription {
        let rx = self.state.subscribe();
        let last = *rx.borrow();
        ConnectivitySubscription { rx, last }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.state.receiver_count()
    }
}

/// A single subscriber's view of connectivity transitions.
#[derive(Debug)]
pub struct ConnectivitySubscription {
    rx: watch::Receiver<bool>,
    /// Last state delivered to or observed by this subscriber.
    last: bool,
}

impl ConnectivitySubscription {
    /// Wait for the next offline->online transition.
    ///
    /// Each transition is delivered to this subscriber once. Returns `None`
    /// when the monitor has been dropped.
    pub async fn next_online(&mut self) -> Option<()> {
        loop {
            // The sender only notifies on real changes, so an unseen change
            // that leaves the flag `true` means we went offline and back.
            let unseen = self.rx.has_changed().unwrap_or(false);
            let online = *self.rx.borrow_and_update();
            let reconnected = online && (!self.last || unseen);
            self.last = online;

            if reconnected {
                debug!("Delivering online transition");
                return Some(());
            }

            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Current connectivity as seen by this subscriber.
    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }
}
