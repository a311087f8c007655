use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

type Callback = Box<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Online/offline state of the device link.
///
/// Constructed once by the application and shared through `Arc`. Whoever
/// owns the network stack calls [`set_online`](Self::set_online); everyone
/// else reads it, subscribes to it, or registers a callback.
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    callbacks: Mutex<HashMap<CallbackId, Callback>>,
    next_id: AtomicU64,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Arc<Self> {
        let (state, _) = watch::channel(online);
        Arc::new(Self {
            state,
            callbacks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Update the link state. Callbacks fire only on an actual transition.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if !changed {
            return;
        }
        info!(online, "Connectivity changed");
        let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        for callback in callbacks.values() {
            callback(online);
        }
    }

    pub fn register_callback(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Box::new(callback));
        id
    }

    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Poll `url` with HEAD requests and mirror reachability into this monitor.
    /// For hosts that have no connectivity service of their own.
    pub fn spawn_probe(self: &Arc<Self>, url: String, interval: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let client = reqwest::Client::builder()
            .connect_timeout(interval.max(Duration::from_secs(1)))
            .timeout(interval.max(Duration::from_secs(1)))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        tokio::spawn(async move {
            loop {
                let online = client.head(&url).send().await.is_ok();
                debug!(online, url = %url, "Connectivity probe");
                monitor.set_online(online);
                tokio::time::sleep(interval).await;
            }
        })
    }
}
