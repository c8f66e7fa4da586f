//! The `data` extension: workspace variables and the blocks reading,
//! writing and watching them.

use std::time::Duration;

use hearth_workspace::{
    BlockContext, BlockDefinition, BlockError, Extension, ExtensionRegistry, Value, variable_key,
};

use crate::{ITEM, OPERATOR, SOURCE, VALUE, VARIABLE};

pub fn register_data(registry: &mut ExtensionRegistry) -> Result<(), BlockError> {
    registry.register(extension())
}

fn extension() -> Extension {
    let mut extension = Extension::new("data");

    // Reads the variable named by its field. Linking subscribes the block's
    // node to the variable's lock, so every store write lands on the node.
    extension.add(
        "variable",
        BlockDefinition::expression(|ctx: BlockContext| async move {
            let id = ctx.field_id(VARIABLE)?;
            Ok(ctx.variables().get(&id))
        })
        .with_linker(|ctx, variable_id| {
            ctx.locks()
                .get_or_create(ctx.node(), variable_key(variable_id), None);
            Ok(())
        }),
    );

    extension.command("set_variable", |ctx: BlockContext| async move {
        let id = ctx.field_id(VARIABLE)?;
        let value = ctx.input_value(VALUE).await?;
        ctx.variables().set(&id, value);
        Ok(())
    });

    extension.command("change_variable", |ctx: BlockContext| async move {
        let id = ctx.field_id(VARIABLE)?;
        let delta = ctx.input_number(VALUE).await?;
        let value = ctx.variables().adjust(&id, delta);
        ctx.set_state(format!("now {value}"));
        Ok(())
    });

    extension.command("inverse_boolean", |ctx: BlockContext| async move {
        let id = ctx.field_id(VARIABLE)?;
        let value = ctx.variables().toggle(&id);
        ctx.set_state(format!("now {value}"));
        Ok(())
    });

    extension.event("when_variable_changed", |ctx: BlockContext| async move {
        let id = ctx.field_id(VARIABLE)?;
        let lock = ctx
            .locks()
            .get_or_create(ctx.node(), variable_key(&id), None);
        ctx.subscribe_to_lock(&lock).await;
        Ok(())
    });

    // Like `when_variable_changed`, but gated on the compare operator saved
    // in the OPERATOR field. The `=` case rides the lock's expected filter;
    // the rest screen each written value against the ITEM input.
    extension.event("when_variable_changed_to", |ctx: BlockContext| async move {
        let id = ctx.field_id(VARIABLE)?;
        let filter = ChangeFilter::from_field(&ctx).await?;
        if let ChangeFilter::Equals(expected) = &filter {
            let lock = ctx
                .locks()
                .get_or_create(ctx.node(), variable_key(&id), Some(expected.clone()));
            ctx.subscribe_to_lock(&lock).await;
            return Ok(());
        }
        let lock = ctx
            .locks()
            .get_or_create(ctx.node(), variable_key(&id), None);
        while !ctx.is_stopped() {
            if !ctx.wait_on(&lock, Duration::ZERO).await {
                break;
            }
            let Some(value) = lock.latest() else { continue };
            if filter.accepts(&ctx, &value).await? {
                ctx.execute_next_chain().await;
            }
        }
        Ok(())
    });

    // The value the enclosing hat fired with.
    extension.expression("prev_variable", |ctx: BlockContext| async move {
        Ok(ctx
            .parent_node()
            .and_then(|parent| parent.last_value())
            .unwrap_or(Value::Empty))
    });

    // Load-time wiring of a variable into the block the SOURCE slot points
    // at. Both opcodes run once per load, never as standing tasks.
    for opcode in ["boolean_link", "variable_link"] {
        extension.command(opcode, |ctx: BlockContext| async move {
            let variable_id = ctx.field_id(VARIABLE)?;
            ctx.input_block(SOURCE)?.link_variable(&variable_id)
        });
    }

    extension
}

/// The saved compare operator of `when_variable_changed_to`.
enum ChangeFilter {
    More,
    Less,
    Equals(Value),
    NotEquals,
    Matches(regex::Regex),
    Any,
}

impl ChangeFilter {
    async fn from_field(ctx: &BlockContext) -> Result<ChangeFilter, BlockError> {
        let operator = ctx.field(OPERATOR)?;
        Ok(match operator.as_str() {
            ">" => ChangeFilter::More,
            "<" => ChangeFilter::Less,
            "=" => ChangeFilter::Equals(ctx.input_value(ITEM).await?),
            "!=" => ChangeFilter::NotEquals,
            "regex" => {
                let pattern = ctx.input_string(ITEM, "").await?;
                let compiled = regex::Regex::new(&pattern).map_err(|err| {
                    BlockError::Failure(format!("bad pattern <{pattern}>: {err}"))
                })?;
                ChangeFilter::Matches(compiled)
            }
            "any" => ChangeFilter::Any,
            other => {
                return Err(BlockError::Failure(format!(
                    "unknown compare operator <{other}>"
                )));
            }
        })
    }

    async fn accepts(&self, ctx: &BlockContext, value: &Value) -> Result<bool, BlockError> {
        Ok(match self {
            ChangeFilter::More => {
                let threshold = ctx.input_number(ITEM).await?;
                value.as_f64().is_some_and(|sample| sample > threshold)
            }
            ChangeFilter::Less => {
                let threshold = ctx.input_number(ITEM).await?;
                value.as_f64().is_some_and(|sample| sample < threshold)
            }
            ChangeFilter::NotEquals => {
                value.to_string() != ctx.input_string(ITEM, "").await?
            }
            ChangeFilter::Matches(pattern) => pattern.is_match(&value.to_string()),
            ChangeFilter::Any => true,
            // handled through the lock's expected filter
            ChangeFilter::Equals(expected) => value == expected,
        })
    }
}
