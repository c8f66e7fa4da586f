pub mod cancel;
pub mod engine;
pub mod graph;
pub mod lock;
pub mod notification;
pub mod observability;
pub mod registry;
pub mod tab;
pub mod value;
pub mod variable;

// Minimal user-facing API: register extensions, load tabs, observe them.
pub use cancel::{CancelSource, CancelToken};
pub use engine::{BlockContext, SUBSTACK};
pub use graph::node::{BlockNode, ExecutionState, Field};
pub use graph::primitive::{DecodeError, InputSlot, PrimitiveKind};
pub use graph::{BlockGraph, ParseError, is_empty_content};
pub use lock::{Lock, LockManager, SignalHub};
pub use notification::{Notification, NotificationLevel, Notifier};
pub use observability::init_observability;
pub use registry::{BlockDefinition, BlockError, BlockKind, Extension, ExtensionRegistry};
pub use tab::{EngineSettings, WorkspaceError, WorkspaceManager};
pub use value::Value;
pub use variable::{VariableStore, variable_key};
