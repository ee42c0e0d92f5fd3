//! Network reachability
//!
//! The executor asks a [`Connectivity`] source whether the network is usable
//! before sending a request and again once the response size is known. The
//! host translates its own network notifications into a [`ConnectivityMonitor`].

use std::sync::atomic::{AtomicBool, Ordering};

/// Source of network reachability
pub trait Connectivity: Send + Sync {
    fn is_network_available(&self) -> bool;
}

/// Settable online flag
#[derive(Debug)]
pub struct ConnectivityMonitor {
    online: AtomicBool,
}

impl ConnectivityMonitor {
    /// A monitor that starts online
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
        }
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::AcqRel);
        if was != online {
            tracing::info!("Network is now {}", if online { "available" } else { "unavailable" });
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_network_available(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}
