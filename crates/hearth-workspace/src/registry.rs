//! Block definitions and the extension registry tabs dispatch against.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::engine::BlockContext;
use crate::graph::primitive::DecodeError;
use crate::value::Value;

/// Errors produced while running blocks. Every variant is reported against
/// the node that surfaced it and halts only that node's chain.
#[derive(Debug, Clone, Error)]
pub enum BlockError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("block <{node_id}>: no definition for <{extension_id}_{opcode}>")]
    DefinitionNotFound {
        node_id: String,
        extension_id: String,
        opcode: String,
    },
    #[error("missing input <{0}>")]
    MissingInput(String),
    #[error("referenced block <{0}> does not exist")]
    MissingBlock(String),
    #[error("input <{key}> does not coerce to {target}")]
    Cast { key: String, target: &'static str },
    #[error("block <{0}> cannot be evaluated for a value")]
    NotEvaluable(String),
    #[error("invalid extension id <{0}>")]
    InvalidExtensionId(String),
    #[error("{0}")]
    Failure(String),
}

/// How a definition participates in chain execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Standing entry point; its handler loops and owns the next chain.
    Event,
    /// Runs once, then the chain continues with `next`.
    Command,
    /// Produces a value when referenced from an input.
    Expression,
    /// Dispatches like a command; kept for extensions with bespoke shapes.
    Other,
}

pub type HandlerFn = Arc<dyn Fn(BlockContext) -> BoxFuture<'static, Result<(), BlockError>> + Send + Sync>;
pub type EvaluatorFn = Arc<dyn Fn(BlockContext) -> BoxFuture<'static, Result<Value, BlockError>> + Send + Sync>;
pub type LinkerFn = Arc<dyn Fn(&BlockContext, &str) -> Result<(), BlockError> + Send + Sync>;

/// One opcode's implementation.
#[derive(Clone)]
pub struct BlockDefinition {
    kind: BlockKind,
    handler: Option<HandlerFn>,
    evaluator: Option<EvaluatorFn>,
    linker: Option<LinkerFn>,
}

impl BlockDefinition {
    pub fn command<F, Fut>(run: F) -> BlockDefinition
    where
        F: Fn(BlockContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BlockError>> + Send + 'static,
    {
        BlockDefinition {
            kind: BlockKind::Command,
            handler: Some(Arc::new(move |ctx| run(ctx).boxed())),
            evaluator: None,
            linker: None,
        }
    }

    pub fn event<F, Fut>(run: F) -> BlockDefinition
    where
        F: Fn(BlockContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BlockError>> + Send + 'static,
    {
        BlockDefinition { kind: BlockKind::Event, ..BlockDefinition::command(run) }
    }

    pub fn expression<F, Fut>(eval: F) -> BlockDefinition
    where
        F: Fn(BlockContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BlockError>> + Send + 'static,
    {
        BlockDefinition {
            kind: BlockKind::Expression,
            handler: None,
            evaluator: Some(Arc::new(move |ctx| eval(ctx).boxed())),
            linker: None,
        }
    }

    /// Attach a linker so `boolean_link`/`variable_link` blocks can wire a
    /// variable id into this block at load time.
    pub fn with_linker<L>(mut self, link: L) -> BlockDefinition
    where
        L: Fn(&BlockContext, &str) -> Result<(), BlockError> + Send + Sync + 'static,
    {
        self.linker = Some(Arc::new(link));
        self
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn handler(&self) -> Option<HandlerFn> {
        self.handler.clone()
    }

    pub fn evaluator(&self) -> Option<EvaluatorFn> {
        self.evaluator.clone()
    }

    pub fn linker(&self) -> Option<LinkerFn> {
        self.linker.clone()
    }
}

impl std::fmt::Debug for BlockDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDefinition")
            .field("kind", &self.kind)
            .field("handler", &self.handler.is_some())
            .field("evaluator", &self.evaluator.is_some())
            .field("linker", &self.linker.is_some())
            .finish()
    }
}

/// A named family of blocks sharing the extension prefix of saved opcodes.
#[derive(Debug)]
pub struct Extension {
    id: String,
    order: Vec<String>,
    blocks: HashMap<String, BlockDefinition>,
}

impl Extension {
    pub fn new(id: impl Into<String>) -> Extension {
        Extension {
            id: id.into(),
            order: Vec::new(),
            blocks: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register `definition` under `opcode`, replacing any earlier one.
    pub fn add(&mut self, opcode: impl Into<String>, definition: BlockDefinition) {
        let opcode = opcode.into();
        if !self.blocks.contains_key(&opcode) {
            self.order.push(opcode.clone());
        }
        self.blocks.insert(opcode, definition);
    }

    pub fn command<F, Fut>(&mut self, opcode: impl Into<String>, run: F)
    where
        F: Fn(BlockContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BlockError>> + Send + 'static,
    {
        self.add(opcode, BlockDefinition::command(run));
    }

    pub fn event<F, Fut>(&mut self, opcode: impl Into<String>, run: F)
    where
        F: Fn(BlockContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BlockError>> + Send + 'static,
    {
        self.add(opcode, BlockDefinition::event(run));
    }

    pub fn expression<F, Fut>(&mut self, opcode: impl Into<String>, eval: F)
    where
        F: Fn(BlockContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BlockError>> + Send + 'static,
    {
        self.add(opcode, BlockDefinition::expression(eval));
    }

    pub fn get(&self, opcode: &str) -> Option<&BlockDefinition> {
        self.blocks.get(opcode)
    }

    /// Opcodes in registration order.
    pub fn opcodes(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

fn valid_extension_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Every extension a workspace can dispatch against. Fully populated before
/// the first tab loads; the engine only reads it.
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    order: Vec<String>,
    extensions: HashMap<String, Extension>,
}

impl ExtensionRegistry {
    pub fn new() -> ExtensionRegistry {
        ExtensionRegistry::default()
    }

    /// Ids are limited to `[A-Za-z0-9_-]` since they prefix saved opcodes.
    /// Re-registering an id replaces the whole extension.
    pub fn register(&mut self, extension: Extension) -> Result<(), BlockError> {
        if !valid_extension_id(extension.id()) {
            return Err(BlockError::InvalidExtensionId(extension.id().to_string()));
        }
        let id = extension.id().to_string();
        if !self.extensions.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.extensions.insert(id, extension);
        Ok(())
    }

    pub fn get(&self, extension_id: &str) -> Option<&Extension> {
        self.extensions.get(extension_id)
    }

    pub fn lookup(&self, extension_id: &str, opcode: &str) -> Option<&BlockDefinition> {
        self.extensions
            .get(extension_id)
            .and_then(|extension| extension.get(opcode))
    }

    /// Extensions in registration order.
    pub fn extensions(&self) -> impl Iterator<Item = &Extension> {
        self.order.iter().filter_map(|id| self.extensions.get(id))
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}
