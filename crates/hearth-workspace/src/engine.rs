//! Chain execution: dispatching parsed nodes against registered definitions.
//!
//! Each standing top level block owns one task. Commands run sequentially
//! along `next` references on that task; events park on locks and replay
//! their next chain per signal. A failing block halts its own chain and is
//! reported, never anyone else's.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashSet;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::graph::BlockGraph;
use crate::graph::node::{BlockNode, ExecutionState};
use crate::graph::primitive::InputSlot;
use crate::lock::{Lock, LockManager, SignalHub};
use crate::notification::{Notification, NotificationLevel, Notifier};
use crate::registry::{BlockDefinition, BlockError, BlockKind, ExtensionRegistry};
use crate::value::Value;
use crate::variable::VariableStore;

/// Input key conventionally carrying a block's nested substack.
pub const SUBSTACK: &str = "SUBSTACK";

/// Everything the tasks of one tab generation share.
pub(crate) struct TabRuntime {
    pub(crate) tab_id: String,
    pub(crate) generation: Uuid,
    pub(crate) graph: BlockGraph,
    pub(crate) registry: Arc<ExtensionRegistry>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) variables: Arc<VariableStore>,
    pub(crate) hub: Arc<SignalHub>,
    pub(crate) notifier: Notifier,
    pub(crate) cancel: CancelToken,
    /// Nodes whose missing definition was already reported this generation.
    pub(crate) missing_reported: DashSet<String>,
}

impl TabRuntime {
    /// Root context for one task. Derived contexts share the halt flag.
    pub(crate) fn context(self: &Arc<TabRuntime>, node: Arc<BlockNode>) -> BlockContext {
        BlockContext {
            node,
            runtime: Arc::clone(self),
            halt: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Handler-facing view of one node plus the services of its tab.
#[derive(Clone)]
pub struct BlockContext {
    node: Arc<BlockNode>,
    runtime: Arc<TabRuntime>,
    halt: Arc<AtomicBool>,
}

impl BlockContext {
    pub fn id(&self) -> &str {
        &self.node.id
    }

    pub fn opcode(&self) -> &str {
        &self.node.opcode
    }

    pub fn extension_id(&self) -> &str {
        &self.node.extension_id
    }

    pub fn tab_id(&self) -> &str {
        &self.runtime.tab_id
    }

    pub fn generation(&self) -> Uuid {
        self.runtime.generation
    }

    pub fn node(&self) -> &Arc<BlockNode> {
        &self.node
    }

    pub fn locks(&self) -> &LockManager {
        &self.runtime.locks
    }

    pub fn variables(&self) -> &VariableStore {
        &self.runtime.variables
    }

    pub fn hub(&self) -> &SignalHub {
        &self.runtime.hub
    }

    pub fn notifier(&self) -> &Notifier {
        &self.runtime.notifier
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.runtime.cancel
    }

    /// True once this task was halted by a stop block or the generation was
    /// torn down. Loops and chains check it at every step.
    pub fn is_stopped(&self) -> bool {
        self.halt.load(Ordering::SeqCst) || self.runtime.cancel.is_cancelled()
    }

    /// Halt the task owning this chain after the current block returns.
    pub fn halt_task(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    /// Diagnostic line shown next to the block in the editor.
    pub fn set_state(&self, text: impl Into<String>) {
        self.node.set_state_text(text);
    }

    pub fn set_value(&self, value: Value) {
        self.node.set_last_value(value);
    }

    /// The value visible at this node: own result, cached child result, or
    /// the nearest ancestor's (events leave their signal value there).
    pub fn last_value(&self) -> Option<Value> {
        self.node.last_value_in(&self.runtime.graph)
    }

    /// Cancellable sleep. Returns `false` when the generation went down first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.runtime.cancel.cancelled() => false,
        }
    }

    /// Park on `lock`; see [`Lock::wait`].
    pub async fn wait_on(&self, lock: &Lock, timeout: Duration) -> bool {
        lock.wait(&self.node, &self.runtime.cancel, timeout).await
    }

    /// Event-loop body shared by hat blocks: park on `lock`, replay the next
    /// chain per accepted signal, leave when the generation stops.
    pub async fn subscribe_to_lock(&self, lock: &Arc<Lock>) {
        while !self.is_stopped() {
            if !self.wait_on(lock, Duration::ZERO).await {
                break;
            }
            self.execute_next_chain().await;
        }
    }

    fn with_node(&self, node: Arc<BlockNode>) -> BlockContext {
        BlockContext {
            node,
            runtime: Arc::clone(&self.runtime),
            halt: Arc::clone(&self.halt),
        }
    }

    /// Context for an arbitrary node of the same tab.
    pub fn block(&self, id: &str) -> Result<BlockContext, BlockError> {
        let node = self
            .runtime
            .graph
            .get(id)
            .ok_or_else(|| BlockError::MissingBlock(id.to_string()))?;
        Ok(self.with_node(Arc::clone(node)))
    }

    pub fn next_node(&self) -> Option<BlockContext> {
        let next = self.node.next.as_deref()?;
        let node = self.runtime.graph.get(next)?;
        Some(self.with_node(Arc::clone(node)))
    }

    pub fn parent_node(&self) -> Option<BlockContext> {
        let parent = self.node.parent.as_deref()?;
        let node = self.runtime.graph.get(parent)?;
        Some(self.with_node(Arc::clone(node)))
    }

    /// The nested substack entry, when the block has one.
    pub fn child(&self) -> Option<BlockContext> {
        match self.node.inputs.get(SUBSTACK) {
            Some(InputSlot::BlockRef(id)) => self.block(id).ok(),
            _ => None,
        }
    }

    // ---- saved inputs ----

    pub fn has_input(&self, key: &str) -> bool {
        self.node.inputs.get(key).is_some_and(InputSlot::is_present)
    }

    pub fn input_slot(&self, key: &str) -> Option<&InputSlot> {
        self.node.inputs.get(key)
    }

    /// Resolve one input to a value: literals come from the parse, block
    /// references are evaluated now, variables and lists read the store.
    pub async fn input_value(&self, key: &str) -> Result<Value, BlockError> {
        let slot = self
            .node
            .inputs
            .get(key)
            .ok_or_else(|| BlockError::MissingInput(key.to_string()))?;
        match slot {
            InputSlot::Empty => Ok(Value::Empty),
            InputSlot::Literal(value) => Ok(value.clone()),
            InputSlot::BlockRef(id) => self.evaluate_block(id).await,
            InputSlot::Broadcast { id, .. } => Ok(Value::Text(id.clone())),
            InputSlot::VariableRef(id) | InputSlot::ListRef(id) => {
                Ok(self.runtime.variables.get(id))
            }
            InputSlot::Invalid(err) => Err(BlockError::Decode(err.clone())),
        }
    }

    /// Like [`input_value`](Self::input_value), but an absent or empty slot
    /// yields `default` instead of an error.
    pub async fn input_string(&self, key: &str, default: &str) -> Result<String, BlockError> {
        match self.node.inputs.get(key) {
            None | Some(InputSlot::Empty) => Ok(default.to_string()),
            Some(_) => {
                let value = self.input_value(key).await?;
                if value.is_empty() {
                    Ok(default.to_string())
                } else {
                    Ok(value.to_string())
                }
            }
        }
    }

    pub async fn input_number(&self, key: &str) -> Result<f64, BlockError> {
        let value = self.input_value(key).await?;
        value.as_f64().ok_or_else(|| BlockError::Cast {
            key: key.to_string(),
            target: "number",
        })
    }

    pub async fn input_integer(&self, key: &str) -> Result<i64, BlockError> {
        let value = self.input_value(key).await?;
        value.as_i64().ok_or_else(|| BlockError::Cast {
            key: key.to_string(),
            target: "integer",
        })
    }

    pub async fn input_boolean(&self, key: &str) -> Result<bool, BlockError> {
        let value = self.input_value(key).await?;
        value.as_bool().ok_or_else(|| BlockError::Cast {
            key: key.to_string(),
            target: "boolean",
        })
    }

    /// The block another slot points at, for substacks and menus.
    pub fn input_block(&self, key: &str) -> Result<BlockContext, BlockError> {
        match self.node.inputs.get(key) {
            Some(InputSlot::BlockRef(id)) => self.block(id),
            Some(InputSlot::Invalid(err)) => Err(BlockError::Decode(err.clone())),
            _ => Err(BlockError::MissingInput(key.to_string())),
        }
    }

    /// Dropdown selection: the input references a shadow menu block whose
    /// field carries the chosen value.
    pub fn menu_value(&self, key: &str, field: &str) -> Result<String, BlockError> {
        let menu = self.input_block(key)?;
        menu.field(field)
    }

    // ---- saved fields ----

    pub fn field(&self, name: &str) -> Result<String, BlockError> {
        self.node
            .fields
            .get(name)
            .map(|field| field.text())
            .ok_or_else(|| BlockError::MissingInput(name.to_string()))
    }

    /// The entity id behind a field; falls back to the displayed value for
    /// fields saved without one.
    pub fn field_id(&self, name: &str) -> Result<String, BlockError> {
        let field = self
            .node
            .fields
            .get(name)
            .ok_or_else(|| BlockError::MissingInput(name.to_string()))?;
        Ok(field.ref_id.clone().unwrap_or_else(|| field.text()))
    }

    pub fn field_boolean(&self, name: &str) -> Result<bool, BlockError> {
        self.node
            .fields
            .get(name)
            .and_then(|field| field.as_bool())
            .ok_or_else(|| BlockError::Cast {
                key: name.to_string(),
                target: "boolean",
            })
    }

    // ---- dispatch ----

    /// This node's definition. A missing one is reported once per node per
    /// generation and always returned as an error.
    fn definition(&self) -> Result<BlockDefinition, BlockError> {
        match self
            .runtime
            .registry
            .lookup(&self.node.extension_id, &self.node.opcode)
        {
            Some(definition) => Ok(definition.clone()),
            None => {
                let err = BlockError::DefinitionNotFound {
                    node_id: self.node.id.clone(),
                    extension_id: self.node.extension_id.clone(),
                    opcode: self.node.opcode.clone(),
                };
                if self.runtime.missing_reported.insert(self.node.id.clone()) {
                    self.report_error(&err);
                }
                Err(err)
            }
        }
    }

    /// Invoke the linker of this block's definition, wiring `variable_id`
    /// into it. Used by the once-execution link blocks at load time.
    pub fn link_variable(&self, variable_id: &str) -> Result<(), BlockError> {
        let definition = self.definition()?;
        let linker = definition.linker().ok_or_else(|| {
            BlockError::Failure(format!("block <{}> does not accept variable links", self.id()))
        })?;
        linker(self, variable_id)
    }

    /// Evaluate this node for a value and remember it on the node.
    pub async fn evaluate(&self) -> Result<Value, BlockError> {
        let definition = self.definition()?;
        let evaluator = definition
            .evaluator()
            .ok_or_else(|| BlockError::NotEvaluable(self.node.id.clone()))?;
        self.node.set_execution_state(ExecutionState::Running);
        let result = evaluator(self.clone()).await;
        self.node.set_execution_state(ExecutionState::Finished);
        let value = result?;
        self.node.set_last_value(value.clone());
        Ok(value)
    }

    /// Evaluate another block of the tab and cache its result as this node's
    /// child value.
    pub async fn evaluate_block(&self, id: &str) -> Result<Value, BlockError> {
        let target = self.block(id)?;
        let value = target.evaluate().await?;
        self.node.set_last_child_value(value.clone());
        Ok(value)
    }

    /// Run this node, then follow `next` until the chain ends, a block
    /// fails, or the task stops. Failures are reported here; they never
    /// escape the chain.
    pub async fn execute_chain(&self) {
        let mut current = self.clone();
        loop {
            if current.is_stopped() {
                break;
            }
            match current.run_node().await {
                Ok(proceed) => {
                    current.node.set_execution_state(ExecutionState::Finished);
                    if !proceed {
                        break;
                    }
                }
                Err(err) => {
                    // a missing definition was already reported by lookup
                    if !matches!(err, BlockError::DefinitionNotFound { .. }) {
                        current.report_error(&err);
                    }
                    current.node.set_execution_state(ExecutionState::Finished);
                    break;
                }
            }
            match current.next_node() {
                Some(next) => current = next,
                None => break,
            }
        }
    }

    /// Run the chain hanging off this node's substack input, if any.
    pub async fn execute_child(&self) {
        if let Some(child) = self.child() {
            child.execute_chain().await;
        }
    }

    /// Run the chain starting at this node's `next` reference, if any.
    pub async fn execute_next_chain(&self) {
        if let Some(next) = self.next_node() {
            next.execute_chain().await;
        }
    }

    /// One dispatch step. `Ok(true)` lets the chain continue with `next`;
    /// event handlers own their next chain, so they never do.
    async fn run_node(&self) -> Result<bool, BlockError> {
        let definition = self.definition()?;
        self.node.set_execution_state(ExecutionState::Running);
        match definition.kind() {
            BlockKind::Event => {
                let handler = definition.handler().ok_or_else(|| {
                    BlockError::Failure(format!("event block <{}> has no handler", self.id()))
                })?;
                handler(self.clone()).await?;
                Ok(false)
            }
            BlockKind::Command | BlockKind::Other => match definition.handler() {
                Some(handler) => {
                    handler(self.clone()).await?;
                    Ok(true)
                }
                None => {
                    self.evaluate().await?;
                    Ok(true)
                }
            },
            BlockKind::Expression => {
                self.evaluate().await?;
                Ok(true)
            }
        }
    }

    pub(crate) fn report_error(&self, err: &BlockError) {
        self.runtime.notifier.publish(Notification::block(
            NotificationLevel::Error,
            &self.runtime.tab_id,
            &self.node,
            err.to_string(),
        ));
    }
}

impl std::fmt::Debug for BlockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockContext")
            .field("tab", &self.runtime.tab_id)
            .field("node", &self.node.id)
            .field("opcode", &self.node.opcode)
            .finish()
    }
}

/// Entry point of one standing task.
pub(crate) async fn run_top_level(ctx: BlockContext) {
    tracing::info!(
        tab = %ctx.tab_id(),
        node = %ctx.id(),
        opcode = %ctx.opcode(),
        "workspace task started"
    );
    match ctx.definition() {
        Ok(definition) if definition.handler().is_some() => ctx.execute_chain().await,
        Ok(_) => {
            // a bare expression at top level is evaluated once
            if let Err(err) = ctx.evaluate().await {
                ctx.report_error(&err);
            }
            ctx.node().set_execution_state(ExecutionState::Finished);
        }
        Err(_) => {}
    }
    tracing::info!(tab = %ctx.tab_id(), node = %ctx.id(), "workspace task finished");
}
