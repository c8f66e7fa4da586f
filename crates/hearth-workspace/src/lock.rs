//! Event locks: how block tasks park for signals from devices, variables and
//! other tabs.
//!
//! Locks live in a per-generation [`LockManager`]; the process-wide
//! [`SignalHub`] fans external signals into every attached manager. Signals
//! do not queue: a waiter that wakes up sees only the latest value.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::graph::node::{BlockNode, ExecutionState};
use crate::value::Value;

type SignalListener = Box<dyn Fn(&Value) + Send + Sync>;
type ReleaseHook = Box<dyn FnOnce() + Send>;
type ConditionFn = Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// A poisoned mutex still has to deliver later signals and release cleanly.
fn unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One event lock. Tasks park on it; signal sources wake them with a value.
pub struct Lock {
    key: String,
    expected: Option<Value>,
    latest: ArcSwapOption<Value>,
    notify: Notify,
    // Listeners must not call back into this lock.
    listeners: Mutex<Vec<(String, SignalListener)>>,
    release_hooks: Mutex<Vec<ReleaseHook>>,
}

impl Lock {
    fn new(key: impl Into<String>, expected: Option<Value>) -> Arc<Lock> {
        Arc::new(Lock {
            key: key.into(),
            expected,
            latest: ArcSwapOption::new(None),
            notify: Notify::new(),
            listeners: Mutex::new(Vec::new()),
            release_hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn expected(&self) -> Option<&Value> {
        self.expected.as_ref()
    }

    /// The value carried by the most recent accepted signal.
    pub fn latest(&self) -> Option<Value> {
        self.latest.load_full().map(|v| (*v).clone())
    }

    /// Deliver `value`: remember it, run the listeners in registration order,
    /// wake every current waiter. A value that misses the expected filter is
    /// dropped entirely. Returns whether the signal was accepted.
    pub fn signal(&self, value: Value) -> bool {
        if let Some(expected) = &self.expected {
            if *expected != value {
                return false;
            }
        }
        self.latest.store(Some(Arc::new(value.clone())));
        for (_, listener) in unpoisoned(&self.listeners).iter() {
            listener(&value);
        }
        self.notify.notify_waiters();
        true
    }

    /// Park until the next accepted signal. `Duration::ZERO` waits
    /// indefinitely. Returns `true` on a signal, `false` on timeout or
    /// cancellation; teardown is the only thing that unparks without one.
    pub async fn wait(&self, node: &BlockNode, cancel: &CancelToken, timeout: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        node.set_execution_state(ExecutionState::Waiting);
        node.set_state_text(format!("waiting for <{}>", self.key));

        let signaled = if timeout.is_zero() {
            tokio::select! {
                _ = &mut notified => true,
                _ = cancel.cancelled() => false,
            }
        } else {
            tokio::select! {
                _ = &mut notified => true,
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(timeout) => false,
            }
        };

        node.set_execution_state(ExecutionState::Running);
        node.clear_state_text();
        signaled
    }

    /// Run `listener` for every accepted signal. One listener per id; later
    /// registrations under the same id are dropped.
    pub fn add_signal_listener(
        &self,
        listener_id: impl Into<String>,
        listener: impl Fn(&Value) + Send + Sync + 'static,
    ) {
        let listener_id = listener_id.into();
        let mut listeners = unpoisoned(&self.listeners);
        if listeners.iter().any(|(id, _)| *id == listener_id) {
            return;
        }
        listeners.push((listener_id, Box::new(listener)));
    }

    /// Push every accepted signal into the node's `last_value`.
    pub(crate) fn subscribe_node(&self, node: &Arc<BlockNode>) {
        let target = Arc::clone(node);
        self.add_signal_listener(node.id.clone(), move |value| {
            target.set_last_value(value.clone());
        });
    }

    /// Run `hook` once when the owning generation is torn down.
    pub fn on_release(&self, hook: impl FnOnce() + Send + 'static) {
        unpoisoned(&self.release_hooks).push(Box::new(hook));
    }

    fn release(&self) {
        let hooks: Vec<ReleaseHook> = unpoisoned(&self.release_hooks).drain(..).collect();
        for hook in hooks {
            hook();
        }
        unpoisoned(&self.listeners).clear();
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("key", &self.key)
            .field("expected", &self.expected)
            .field("latest", &self.latest())
            .finish()
    }
}

struct PollEntry {
    lock: Arc<Lock>,
    condition: ConditionFn,
    previous: AtomicBool,
}

/// Per-generation lock registry plus the one task polling listened conditions.
pub struct LockManager {
    tab_id: String,
    poll_interval: Duration,
    locks: Mutex<HashMap<String, Vec<Arc<Lock>>>>,
    entries: Arc<Mutex<Vec<Arc<PollEntry>>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl LockManager {
    pub fn new(tab_id: impl Into<String>, poll_interval: Duration) -> LockManager {
        LockManager {
            tab_id: tab_id.into(),
            poll_interval,
            locks: Mutex::new(HashMap::new()),
            entries: Arc::new(Mutex::new(Vec::new())),
            poller: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// Reuse the lock under `key` carrying the same expected filter, else
    /// append a new one. The node's push listener is subscribed either way.
    pub fn get_or_create(
        &self,
        node: &Arc<BlockNode>,
        key: impl Into<String>,
        expected: Option<Value>,
    ) -> Arc<Lock> {
        let key = key.into();
        if self.released.load(Ordering::SeqCst) {
            // Teardown already ran; stragglers get a detached lock that can
            // never keep the registry alive.
            let lock = Lock::new(key, expected);
            lock.subscribe_node(node);
            return lock;
        }
        let mut locks = unpoisoned(&self.locks);
        let bucket = locks.entry(key.clone()).or_default();
        if let Some(existing) = bucket
            .iter()
            .find(|lock| lock.expected() == expected.as_ref())
        {
            existing.subscribe_node(node);
            return Arc::clone(existing);
        }
        let lock = Lock::new(key, expected);
        lock.subscribe_node(node);
        bucket.push(Arc::clone(&lock));
        lock
    }

    /// Deliver `value` to every lock registered under `key`.
    pub fn signal(&self, key: &str, value: Value) {
        let targets: Vec<Arc<Lock>> = unpoisoned(&self.locks)
            .get(key)
            .cloned()
            .unwrap_or_default();
        for lock in targets {
            lock.signal(value.clone());
        }
    }

    /// Sample `condition` once per poll interval; the returned lock fires on
    /// every false to true edge of the samples. A condition that is already
    /// true fires on the first tick. Conditions are keyed by node, so calling
    /// this again for the same node reuses the registered entry.
    pub fn listen_condition<F, Fut>(&self, node: &Arc<BlockNode>, condition: F) -> Arc<Lock>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        if self.released.load(Ordering::SeqCst) {
            return Lock::new(node.id.clone(), None);
        }
        {
            let entries = unpoisoned(&self.entries);
            if let Some(existing) = entries.iter().find(|entry| entry.lock.key() == node.id) {
                return Arc::clone(&existing.lock);
            }
        }
        let lock = Lock::new(node.id.clone(), None);
        unpoisoned(&self.locks)
            .entry(node.id.clone())
            .or_default()
            .push(Arc::clone(&lock));
        unpoisoned(&self.entries).push(Arc::new(PollEntry {
            lock: Arc::clone(&lock),
            condition: Box::new(move || condition().boxed()),
            previous: AtomicBool::new(false),
        }));
        self.ensure_poller();
        lock
    }

    fn ensure_poller(&self) {
        let mut poller = unpoisoned(&self.poller);
        if poller.is_some() {
            return;
        }
        let entries = Arc::clone(&self.entries);
        let interval = self.poll_interval;
        let tab_id = self.tab_id.clone();
        *poller = Some(tokio::spawn(async move {
            tracing::debug!(tab = %tab_id, "condition poller started");
            loop {
                tokio::time::sleep(interval).await;
                let snapshot: Vec<Arc<PollEntry>> = unpoisoned(&entries).iter().cloned().collect();
                for entry in snapshot {
                    let current = (entry.condition)().await;
                    let previous = entry.previous.swap(current, Ordering::SeqCst);
                    if current && !previous {
                        entry.lock.signal(Value::Bool(true));
                    }
                }
            }
        }));
    }

    /// Tear down: run every release hook, drop every lock, stop the poller.
    /// Parked waiters are left for the generation's cancel token.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        if let Some(handle) = unpoisoned(&self.poller).take() {
            handle.abort();
        }
        unpoisoned(&self.entries).clear();
        let drained: Vec<Arc<Lock>> = unpoisoned(&self.locks)
            .drain()
            .flat_map(|(_, bucket)| bucket)
            .collect();
        for lock in &drained {
            lock.release();
        }
        tracing::debug!(tab = %self.tab_id, locks = drained.len(), "lock manager released");
    }

    pub fn lock_count(&self) -> usize {
        unpoisoned(&self.locks).values().map(Vec::len).sum()
    }

    pub fn has_key(&self, key: &str) -> bool {
        unpoisoned(&self.locks).contains_key(key)
    }

    pub fn condition_count(&self) -> usize {
        unpoisoned(&self.entries).len()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        // The poller must not outlive the manager.
        if let Some(handle) = unpoisoned(&self.poller).take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("tab_id", &self.tab_id)
            .field("locks", &self.lock_count())
            .field("conditions", &self.condition_count())
            .finish()
    }
}

/// Process-wide signal router. Generations attach on load, detach on
/// teardown; anything in the process can fan a signal out to every live tab.
#[derive(Debug, Default)]
pub struct SignalHub {
    managers: DashMap<Uuid, Arc<LockManager>>,
}

impl SignalHub {
    pub fn new() -> SignalHub {
        SignalHub { managers: DashMap::new() }
    }

    pub fn attach(&self, generation: Uuid, manager: Arc<LockManager>) {
        self.managers.insert(generation, manager);
    }

    pub fn detach(&self, generation: &Uuid) {
        self.managers.remove(generation);
    }

    pub fn is_attached(&self, generation: &Uuid) -> bool {
        self.managers.contains_key(generation)
    }

    pub fn generation_count(&self) -> usize {
        self.managers.len()
    }

    /// Deliver `value` to `key` in every attached generation.
    pub fn signal_all(&self, key: &str, value: Value) {
        for entry in self.managers.iter() {
            entry.value().signal(key, value.clone());
        }
    }
}
