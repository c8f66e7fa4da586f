//! The `events` extension: named broadcasts, delivered across every loaded
//! tab through the signal hub.

use hearth_workspace::{BlockContext, BlockError, Extension, ExtensionRegistry, InputSlot, Value};

use crate::{BROADCAST_INPUT, VALUE};

/// Lock key under which the broadcast `id` is signaled.
pub fn broadcast_key(id: &str) -> String {
    format!("broadcast:{id}")
}

pub fn register_events(registry: &mut ExtensionRegistry) -> Result<(), BlockError> {
    registry.register(extension())
}

fn extension() -> Extension {
    let mut extension = Extension::new("events");

    extension.event("receive_event", |ctx: BlockContext| async move {
        let id = broadcast_id(&ctx)?;
        let lock = ctx
            .locks()
            .get_or_create(ctx.node(), broadcast_key(&id), None);
        ctx.subscribe_to_lock(&lock).await;
        Ok(())
    });

    extension.command("broadcast_event", |ctx: BlockContext| async move {
        let id = broadcast_id(&ctx)?;
        let payload = if ctx.has_input(VALUE) {
            ctx.input_value(VALUE).await?
        } else {
            Value::Bool(true)
        };
        ctx.hub().signal_all(&broadcast_key(&id), payload);
        Ok(())
    });

    extension
}

/// The broadcast a block points at. Saved content carries either the
/// dedicated broadcast primitive or a plain text id.
fn broadcast_id(ctx: &BlockContext) -> Result<String, BlockError> {
    match ctx.input_slot(BROADCAST_INPUT) {
        Some(InputSlot::Broadcast { id, .. }) => Ok(id.clone()),
        Some(InputSlot::Literal(value)) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(BlockError::Failure(format!(
            "block <{}> has no usable broadcast reference",
            ctx.id()
        ))),
    }
}
