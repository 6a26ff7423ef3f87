// Registry of live interface watchers, keyed by container identity

use super::watcher::{WatchOptions, run_watcher};
use super::LinkMonitor;
use crate::events::EventSender;
use crate::models::{Container, RuntimeEvent, short_id};
use crate::runtime::ContainerRuntime;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct WatcherHandle {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner<R, M> {
    runtime: Arc<R>,
    monitor: Arc<M>,
    sender: EventSender,
    options: Arc<WatchOptions>,
    watchers: Mutex<HashMap<String, WatcherHandle>>,
    next_generation: AtomicU64,
}

/// At most one watcher per container. Owned by one pipeline run; cheap to clone.
pub struct WatcherRegistry<R, M> {
    inner: Arc<Inner<R, M>>,
}

impl<R, M> Clone for WatcherRegistry<R, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: ContainerRuntime, M: LinkMonitor> WatcherRegistry<R, M> {
    /// Watchers send through `sender` and are cancelled with its token.
    pub fn new(runtime: Arc<R>, monitor: Arc<M>, sender: EventSender, options: WatchOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                monitor,
                sender,
                options: Arc::new(options),
                watchers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Starts a watcher unless one is already registered. Returns true if started.
    pub async fn start(&self, container: Container) -> bool {
        let id = container.identity().to_string();
        if id.is_empty() {
            return false;
        }

        let mut watchers = self.inner.watchers.lock().await;
        if watchers.contains_key(&id) {
            return false;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.sender.token().child_token();
        let sender = self.inner.sender.with_token(cancel.clone());
        let registry = self.clone();
        let key = id.clone();
        let task = tokio::spawn(async move {
            run_watcher(
                container,
                registry.inner.runtime.clone(),
                registry.inner.monitor.clone(),
                sender,
                registry.inner.options.clone(),
            )
            .await;
            registry.remove(&key, generation).await;
        });

        debug!(container = %id, "Interface watcher started");
        watchers.insert(
            id,
            WatcherHandle {
                generation,
                cancel,
                task,
            },
        );
        true
    }

    /// Cancels and awaits the watcher for `id`. Returns false if none was registered.
    pub async fn stop(&self, id: &str) -> bool {
        let handle = self.inner.watchers.lock().await.remove(id);
        let Some(handle) = handle else {
            return false;
        };
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            debug!(container = %id, error = %e, "Interface watcher task failed");
        }
        true
    }

    /// Stops every watcher.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.inner.watchers.lock().await.drain().collect();
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (id, handle) in handles {
            if let Err(e) = handle.task.await {
                debug!(container = %id, error = %e, "Interface watcher task failed");
            }
        }
    }

    /// Starts or stops watchers in step with container lifecycle events.
    pub async fn handle(&self, ev: &RuntimeEvent) {
        if !ev.is_container() {
            return;
        }
        match ev.action.to_lowercase().as_str() {
            "start" | "unpause" | "restart" => {
                if let Some(container) = container_from_event(ev, &self.inner.options.lab_label) {
                    self.start(container).await;
                }
            }
            "die" | "stop" | "destroy" | "kill" => {
                self.stop(ev.full_id()).await;
            }
            _ => {}
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.watchers.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.watchers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // Only the watcher that owns the entry may remove it.
    async fn remove(&self, id: &str, generation: u64) {
        let mut watchers = self.inner.watchers.lock().await;
        if watchers.get(id).is_some_and(|h| h.generation == generation) {
            watchers.remove(id);
        }
    }
}

/// Minimal container record built from a lifecycle event.
pub fn container_from_event(ev: &RuntimeEvent, lab_label: &str) -> Option<Container> {
    let id = ev.full_id();
    let name = ev.name();
    if id.is_empty() && name.is_empty() {
        return None;
    }
    let short = if ev.actor_id.is_empty() { id } else { &ev.actor_id };

    let mut labels = HashMap::new();
    if let Some(lab) = ev.attributes.get(lab_label).filter(|v| !v.is_empty()) {
        labels.insert(lab_label.to_string(), lab.clone());
    }
    Some(Container {
        id: id.to_string(),
        short_id: short_id(short).to_string(),
        names: if name.is_empty() { Vec::new() } else { vec![name.to_string()] },
        labels,
        ..Default::default()
    })
}
