//! Tab lifecycle: parsing saved content, spawning one task per standing
//! block, and replacing all of it atomically when the tab is saved again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout_at;
use uuid::Uuid;

use crate::cancel::CancelSource;
use crate::engine::{self, TabRuntime};
use crate::graph::node::BlockNode;
use crate::graph::{self, BlockGraph, ParseError};
use crate::lock::{LockManager, SignalHub};
use crate::notification::{Notification, NotificationLevel, Notifier};
use crate::registry::ExtensionRegistry;
use crate::variable::VariableStore;

/// Blocks that run to completion at load time instead of owning a task.
/// They wire variables into blocks and must finish before any standing task
/// can observe the wiring. Qualified by extension id so a foreign extension's
/// opcode of the same name still gets a normal task.
const ONCE_EXECUTION_BLOCKS: [(&str, &str); 2] =
    [("data", "boolean_link"), ("data", "variable_link")];

fn is_once_execution(node: &BlockNode) -> bool {
    ONCE_EXECUTION_BLOCKS.contains(&(node.extension_id.as_str(), node.opcode.as_str()))
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkspaceError {
    #[error("tab <{tab_id}> failed to parse: {source}")]
    Parse {
        tab_id: String,
        #[source]
        source: ParseError,
    },
}

/// Tunables of the engine, normally read from the environment once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// How long teardown waits for a generation's tasks before aborting them.
    pub teardown_grace: Duration,
    /// Sampling interval of condition pollers.
    pub poll_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> EngineSettings {
        EngineSettings {
            teardown_grace: Duration::from_secs(3),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl EngineSettings {
    /// Apply overrides from `HEARTH_TEARDOWN_GRACE_MS` and
    /// `HEARTH_POLL_INTERVAL_MS`. Unusable values are logged and skipped.
    pub fn from_env() -> EngineSettings {
        let mut settings = EngineSettings::default();
        if let Some(grace) = duration_from_env("HEARTH_TEARDOWN_GRACE_MS") {
            settings.teardown_grace = grace;
        }
        if let Some(interval) = duration_from_env("HEARTH_POLL_INTERVAL_MS") {
            settings.poll_interval = interval;
        }
        settings
    }
}

fn duration_from_env(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    let parsed = parse_millis(&raw);
    if parsed.is_none() {
        tracing::warn!(%name, %raw, "ignoring unusable duration override");
    }
    parsed
}

/// Positive millisecond count as a duration.
fn parse_millis(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// One loaded generation of a tab.
struct Tab {
    generation: Uuid,
    runtime: Arc<TabRuntime>,
    cancel: CancelSource,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns every loaded tab and the services they share.
///
/// Loading a tab id that is already loaded is a hot reload: the previous
/// generation is fully stopped before the new one starts, so two generations
/// of the same tab never run at once.
pub struct WorkspaceManager {
    registry: Arc<ExtensionRegistry>,
    notifier: Notifier,
    hub: Arc<SignalHub>,
    variables: Arc<VariableStore>,
    settings: EngineSettings,
    tabs: tokio::sync::Mutex<HashMap<String, Tab>>,
}

impl WorkspaceManager {
    pub fn new(registry: ExtensionRegistry) -> WorkspaceManager {
        WorkspaceManager::with_settings(registry, EngineSettings::default())
    }

    pub fn with_settings(registry: ExtensionRegistry, settings: EngineSettings) -> WorkspaceManager {
        let hub = Arc::new(SignalHub::new());
        WorkspaceManager {
            registry: Arc::new(registry),
            notifier: Notifier::new(),
            variables: Arc::new(VariableStore::new(Arc::clone(&hub))),
            hub,
            settings,
            tabs: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn hub(&self) -> &SignalHub {
        &self.hub
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Load (or reload) saved tab content. Blank or block-free content just
    /// unloads the tab; content that fails to parse is reported and leaves
    /// the tab unloaded.
    pub async fn load_tab(&self, tab_id: &str, content: &str) -> Result<(), WorkspaceError> {
        let mut tabs = self.tabs.lock().await;
        if let Some(previous) = tabs.remove(tab_id) {
            self.teardown(previous).await;
        }
        if graph::is_empty_content(content) {
            tracing::info!(tab = %tab_id, "tab has no blocks, leaving it unloaded");
            return Ok(());
        }
        let graph = match BlockGraph::parse(content) {
            Ok(graph) => graph,
            Err(source) => {
                let err = WorkspaceError::Parse {
                    tab_id: tab_id.to_string(),
                    source,
                };
                self.notifier.publish(Notification::tab(
                    NotificationLevel::Error,
                    tab_id,
                    err.to_string(),
                ));
                return Err(err);
            }
        };

        let generation = Uuid::new_v4();
        let locks = Arc::new(LockManager::new(tab_id, self.settings.poll_interval));
        let cancel = CancelSource::new();
        let runtime = Arc::new(TabRuntime {
            tab_id: tab_id.to_string(),
            generation,
            graph,
            registry: Arc::clone(&self.registry),
            locks: Arc::clone(&locks),
            variables: Arc::clone(&self.variables),
            hub: Arc::clone(&self.hub),
            notifier: self.notifier.clone(),
            cancel: cancel.token(),
            missing_reported: DashSet::new(),
        });
        self.hub.attach(generation, locks);

        let standing = runtime.graph.top_level();
        for node in &standing {
            if is_once_execution(node) {
                runtime.context(Arc::clone(node)).execute_chain().await;
            }
        }
        let mut tasks = Vec::new();
        for node in standing {
            if is_once_execution(&node) {
                continue;
            }
            tasks.push(tokio::spawn(engine::run_top_level(runtime.context(node))));
        }
        tracing::info!(tab = %tab_id, %generation, tasks = tasks.len(), "tab loaded");
        tabs.insert(
            tab_id.to_string(),
            Tab {
                generation,
                runtime,
                cancel,
                tasks,
            },
        );
        Ok(())
    }

    /// Stop and forget a tab. Returns false when it was not loaded.
    pub async fn remove_tab(&self, tab_id: &str) -> bool {
        let removed = self.tabs.lock().await.remove(tab_id);
        match removed {
            Some(tab) => {
                self.teardown(tab).await;
                true
            }
            None => false,
        }
    }

    pub async fn is_loaded(&self, tab_id: &str) -> bool {
        self.tabs.lock().await.contains_key(tab_id)
    }

    pub async fn tab_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tabs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn generation_of(&self, tab_id: &str) -> Option<Uuid> {
        self.tabs.lock().await.get(tab_id).map(|tab| tab.generation)
    }

    pub async fn block_by_id(&self, tab_id: &str, node_id: &str) -> Option<Arc<BlockNode>> {
        let tabs = self.tabs.lock().await;
        tabs.get(tab_id)?.runtime.graph.get(node_id).cloned()
    }

    /// Stop every loaded tab.
    pub async fn shutdown(&self) {
        let drained: Vec<Tab> = self.tabs.lock().await.drain().map(|(_, tab)| tab).collect();
        for tab in drained {
            self.teardown(tab).await;
        }
    }

    /// Confirmed stop of one generation: release locks so hooks run, detach
    /// the generation from cross tab signaling, then cancel and join every
    /// task. Tasks still running past the grace period are aborted.
    async fn teardown(&self, tab: Tab) {
        let Tab {
            generation,
            runtime,
            cancel,
            tasks,
        } = tab;
        runtime.locks.release();
        self.hub.detach(&generation);
        cancel.cancel();
        let deadline = tokio::time::Instant::now() + self.settings.teardown_grace;
        for mut task in tasks {
            match timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    tracing::warn!(tab = %runtime.tab_id, %err, "workspace task ended abnormally");
                }
                Err(_) => {
                    task.abort();
                    tracing::warn!(
                        tab = %runtime.tab_id,
                        "workspace task outlived the teardown grace period, aborted"
                    );
                }
            }
        }
        tracing::info!(tab = %runtime.tab_id, %generation, "tab stopped");
    }
}
