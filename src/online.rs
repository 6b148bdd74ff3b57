//! Online/offline presence tracking: a single boolean the host
//! updates from its own network-reachability signal. A transition to
//! online is the scheduler's cue to sync immediately rather than wait for
//! the next tick; while offline, scheduled ticks are suppressed entirely.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

pub struct OnlineManager {
    online: AtomicBool,
    listeners: std::sync::Mutex<Vec<Arc<dyn Fn(bool) + Send + Sync>>>,
}

impl OnlineManager {
    pub fn new(initial_online: bool) -> Self {
        Self {
            online: AtomicBool::new(initial_online),
            listeners: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Update presence. Returns `true` if this call actually changed state
    /// (a same-state call is a no-op and fires no listeners).
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return false;
        }
        let listeners = self.listeners.lock().expect("listeners mutex poisoned").clone();
        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(online))).is_err() {
                warn!("online listener panicked; ignoring");
            }
        }
        true
    }

    pub fn on_change(&self, listener: impl Fn(bool) + Send + Sync + 'static) {
        self.listeners.lock().expect("listeners mutex poisoned").push(Arc::new(listener));
    }
}

impl Default for OnlineManager {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_to_online_fires_listener_once() {
        let manager = OnlineManager::new(false);
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        manager.on_change(move |online| sink.lock().unwrap().push(online));

        assert!(manager.set_online(true));
        assert!(!manager.set_online(true), "same-state call is a no-op");
        assert!(manager.set_online(false));

        assert_eq!(calls.lock().unwrap().as_slice(), &[true, false]);
    }

    #[test]
    fn default_is_online() {
        assert!(OnlineManager::default().is_online());
    }
}
