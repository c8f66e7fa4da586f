//! Built-in block extensions for the workspace engine. Use with
//! [`default_registry`], or register the extensions you need one by one.

pub mod control;
pub mod data;
pub mod events;
pub mod operators;

use hearth_workspace::{BlockError, ExtensionRegistry};

pub use control::register_control;
pub use data::register_data;
pub use events::{broadcast_key, register_events};
pub use operators::register_operators;

// Input and field names shared by the built-in extensions.
pub(crate) const BROADCAST_INPUT: &str = "BROADCAST_INPUT";
pub(crate) const CONDITION: &str = "CONDITION";
pub(crate) const CRON: &str = "CRON";
pub(crate) const DAY: &str = "DAY";
pub(crate) const DURATION: &str = "DURATION";
pub(crate) const ELSE: &str = "ELSE";
pub(crate) const FROM: &str = "FROM";
pub(crate) const ITEM: &str = "ITEM";
pub(crate) const NUM: &str = "NUM";
pub(crate) const NUM1: &str = "NUM1";
pub(crate) const NUM2: &str = "NUM2";
pub(crate) const OPERAND: &str = "OPERAND";
pub(crate) const OPERAND1: &str = "OPERAND1";
pub(crate) const OPERAND2: &str = "OPERAND2";
pub(crate) const OPERATOR: &str = "OPERATOR";
pub(crate) const SOURCE: &str = "SOURCE";
pub(crate) const SUBSTACK2: &str = "SUBSTACK2";
pub(crate) const THEN: &str = "THEN";
pub(crate) const TIME: &str = "TIME";
pub(crate) const TIMES: &str = "TIMES";
pub(crate) const TO: &str = "TO";
pub(crate) const UNIT: &str = "UNIT";
pub(crate) const VALUE: &str = "VALUE";
pub(crate) const VARIABLE: &str = "VARIABLE";

/// Register every built-in extension.
pub fn register_all(registry: &mut ExtensionRegistry) -> Result<(), BlockError> {
    control::register_control(registry)?;
    data::register_data(registry)?;
    events::register_events(registry)?;
    operators::register_operators(registry)?;
    Ok(())
}

/// A registry preloaded with the built-in extensions.
pub fn default_registry() -> ExtensionRegistry {
    let mut registry = ExtensionRegistry::new();
    if let Err(err) = register_all(&mut registry) {
        // built-in extension ids are static and valid
        tracing::error!(%err, "failed to register built-in extensions");
    }
    registry
}
