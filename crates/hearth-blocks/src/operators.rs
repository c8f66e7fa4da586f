//! The `operator` extension: arithmetic, comparison and boolean reporters.

use uuid::Uuid;

use hearth_workspace::{BlockContext, BlockError, Extension, ExtensionRegistry, Value};

use crate::{ELSE, FROM, NUM, NUM1, NUM2, OPERAND, OPERAND1, OPERAND2, OPERATOR, THEN, TO};

pub fn register_operators(registry: &mut ExtensionRegistry) -> Result<(), BlockError> {
    registry.register(extension())
}

fn extension() -> Extension {
    let mut extension = Extension::new("operator");

    extension.expression("add", |ctx: BlockContext| async move {
        Ok(Value::Number(
            ctx.input_number(NUM1).await? + ctx.input_number(NUM2).await?,
        ))
    });

    extension.expression("subtract", |ctx: BlockContext| async move {
        Ok(Value::Number(
            ctx.input_number(NUM1).await? - ctx.input_number(NUM2).await?,
        ))
    });

    extension.expression("multiply", |ctx: BlockContext| async move {
        Ok(Value::Number(
            ctx.input_number(NUM1).await? * ctx.input_number(NUM2).await?,
        ))
    });

    extension.expression("divide", |ctx: BlockContext| async move {
        Ok(Value::Number(
            ctx.input_number(NUM1).await? / ctx.input_number(NUM2).await?,
        ))
    });

    extension.expression("random", |ctx: BlockContext| async move {
        let a = ctx.input_integer(FROM).await?;
        let b = ctx.input_integer(TO).await?;
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let span = (high - low + 1) as u128;
        let pick = low + (Uuid::new_v4().as_u128() % span) as i64;
        Ok(Value::Number(pick as f64))
    });

    extension.expression("lt", |ctx: BlockContext| async move {
        Ok(Value::Bool(
            ctx.input_number(OPERAND1).await? < ctx.input_number(OPERAND2).await?,
        ))
    });

    extension.expression("equals", |ctx: BlockContext| async move {
        Ok(Value::Bool(
            ctx.input_number(OPERAND1).await? == ctx.input_number(OPERAND2).await?,
        ))
    });

    extension.expression("gt", |ctx: BlockContext| async move {
        Ok(Value::Bool(
            ctx.input_number(OPERAND1).await? > ctx.input_number(OPERAND2).await?,
        ))
    });

    // Both gates short-circuit, so a broken second operand only matters when
    // the first one does not already settle the answer.
    extension.expression("and", |ctx: BlockContext| async move {
        if !ctx.input_boolean(OPERAND1).await? {
            return Ok(Value::Bool(false));
        }
        Ok(Value::Bool(ctx.input_boolean(OPERAND2).await?))
    });

    extension.expression("or", |ctx: BlockContext| async move {
        if ctx.input_boolean(OPERAND1).await? {
            return Ok(Value::Bool(true));
        }
        Ok(Value::Bool(ctx.input_boolean(OPERAND2).await?))
    });

    extension.expression("not", |ctx: BlockContext| async move {
        Ok(Value::Bool(!ctx.input_boolean(OPERAND).await?))
    });

    extension.expression("mathop", |ctx: BlockContext| async move {
        let operator = ctx.field(OPERATOR)?;
        let value = ctx.input_number(NUM).await?;
        math_op(&operator, value).map(Value::Number)
    });

    extension.expression("bool_to_num", |ctx: BlockContext| async move {
        let state = ctx.input_boolean(OPERAND).await?;
        Ok(Value::Number(if state { 1.0 } else { 0.0 }))
    });

    extension.expression("bool_if_else", |ctx: BlockContext| async move {
        let slot = if ctx.input_boolean(OPERAND).await? { THEN } else { ELSE };
        Ok(Value::Number(ctx.input_number(slot).await?))
    });

    extension
}

fn math_op(operator: &str, value: f64) -> Result<f64, BlockError> {
    Ok(match operator {
        "abs" => value.abs(),
        "round" => value.round(),
        "floor" => value.floor(),
        "ceiling" => value.ceil(),
        "sqrt" => value.sqrt(),
        "sin" => value.sin(),
        "cos" => value.cos(),
        "tan" => value.tan(),
        "asin" => value.asin(),
        "acos" => value.acos(),
        "atan" => value.atan(),
        "log" => value.ln(),
        other => {
            return Err(BlockError::Failure(format!(
                "unknown math operator <{other}>"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_workspace::{EngineSettings, WorkspaceManager};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager_with_grab(observed: &Arc<Mutex<Option<Value>>>) -> WorkspaceManager {
        let mut registry = ExtensionRegistry::new();
        register_operators(&mut registry).unwrap();
        let mut extension = Extension::new("probe");
        let observed = Arc::clone(observed);
        extension.command("grab", move |ctx: BlockContext| {
            let observed = Arc::clone(&observed);
            async move {
                *observed.lock().unwrap() = Some(ctx.input_value("ITEM").await?);
                Ok(())
            }
        });
        registry.register(extension).unwrap();
        WorkspaceManager::with_settings(
            registry,
            EngineSettings {
                teardown_grace: Duration::from_millis(500),
                poll_interval: Duration::from_millis(30),
            },
        )
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Load a tab whose only chain grabs the result of the reporter under
    /// test, then hand the grabbed value back.
    async fn report(reporter: serde_json::Value) -> Value {
        let observed = Arc::new(Mutex::new(None));
        let manager = manager_with_grab(&observed);
        let mut blocks = serde_json::Map::new();
        blocks.insert(
            "main".to_string(),
            json!({"opcode": "probe_grab", "topLevel": true, "inputs": {"ITEM": [2, "r1"]}}),
        );
        let mut reporter = reporter;
        reporter["parent"] = json!("main");
        blocks.insert("r1".to_string(), reporter);
        let content = json!({"target": {"blocks": blocks}}).to_string();
        manager.load_tab("tab1", &content).await.unwrap();

        let probe = Arc::clone(&observed);
        eventually("the reporter result", move || probe.lock().unwrap().is_some()).await;
        let value = observed.lock().unwrap().take().unwrap();
        manager.shutdown().await;
        value
    }

    #[tokio::test]
    async fn arithmetic_reporters_compute_over_floats() {
        let sum = report(json!({"opcode": "operator_add",
            "inputs": {"NUM1": [1, [4, "2.5"]], "NUM2": [1, [4, "4"]]}}))
        .await;
        assert_eq!(sum, Value::Number(6.5));

        let difference = report(json!({"opcode": "operator_subtract",
            "inputs": {"NUM1": [1, [4, "10"]], "NUM2": [1, [4, "4"]]}}))
        .await;
        assert_eq!(difference, Value::Number(6.0));

        let product = report(json!({"opcode": "operator_multiply",
            "inputs": {"NUM1": [1, [4, "3"]], "NUM2": [1, [4, "1.5"]]}}))
        .await;
        assert_eq!(product, Value::Number(4.5));

        let quotient = report(json!({"opcode": "operator_divide",
            "inputs": {"NUM1": [1, [4, "9"]], "NUM2": [1, [4, "2"]]}}))
        .await;
        assert_eq!(quotient, Value::Number(4.5));
    }

    #[tokio::test]
    async fn comparison_reporters_yield_booleans() {
        let below = report(json!({"opcode": "operator_lt",
            "inputs": {"OPERAND1": [1, [4, "3"]], "OPERAND2": [1, [4, "5"]]}}))
        .await;
        assert_eq!(below, Value::Bool(true));

        let equal = report(json!({"opcode": "operator_equals",
            "inputs": {"OPERAND1": [1, [4, "5"]], "OPERAND2": [1, [10, "5"]]}}))
        .await;
        assert_eq!(equal, Value::Bool(true));

        let above = report(json!({"opcode": "operator_gt",
            "inputs": {"OPERAND1": [1, [4, "3"]], "OPERAND2": [1, [4, "5"]]}}))
        .await;
        assert_eq!(above, Value::Bool(false));
    }

    #[tokio::test]
    async fn gates_short_circuit_past_a_broken_operand() {
        // the second operand points at a missing block; a short-circuiting
        // gate never evaluates it
        let gated = report(json!({"opcode": "operator_and",
            "inputs": {"OPERAND1": [1, [8, false]], "OPERAND2": [2, "ghost"]}}))
        .await;
        assert_eq!(gated, Value::Bool(false));

        let settled = report(json!({"opcode": "operator_or",
            "inputs": {"OPERAND1": [1, [8, true]], "OPERAND2": [2, "ghost"]}}))
        .await;
        assert_eq!(settled, Value::Bool(true));

        let negated = report(json!({"opcode": "operator_not",
            "inputs": {"OPERAND": [1, [8, false]]}}))
        .await;
        assert_eq!(negated, Value::Bool(true));
    }

    #[tokio::test]
    async fn bool_reporters_map_to_numbers() {
        let one = report(json!({"opcode": "operator_bool_to_num",
            "inputs": {"OPERAND": [1, [8, true]]}}))
        .await;
        assert_eq!(one, Value::Number(1.0));

        let picked = report(json!({"opcode": "operator_bool_if_else",
            "inputs": {"OPERAND": [1, [8, false]],
                       "THEN": [1, [4, "1"]], "ELSE": [1, [4, "7"]]}}))
        .await;
        assert_eq!(picked, Value::Number(7.0));
    }

    #[tokio::test]
    async fn random_stays_inside_the_inclusive_bounds() {
        for _ in 0..20 {
            let rolled = report(json!({"opcode": "operator_random",
                "inputs": {"FROM": [1, [6, "6"]], "TO": [1, [6, "1"]]}}))
            .await;
            let Value::Number(n) = rolled else {
                panic!("random produced {rolled:?}")
            };
            assert_eq!(n.fract(), 0.0);
            assert!((1.0..=6.0).contains(&n), "rolled {n}");
        }
    }

    #[tokio::test]
    async fn mathop_applies_the_saved_function() {
        let rounded = report(json!({"opcode": "operator_mathop",
            "fields": {"OPERATOR": ["round"]}, "inputs": {"NUM": [1, [4, "2.6"]]}}))
        .await;
        assert_eq!(rounded, Value::Number(3.0));

        let root = report(json!({"opcode": "operator_mathop",
            "fields": {"OPERATOR": ["sqrt"]}, "inputs": {"NUM": [1, [4, "16"]]}}))
        .await;
        assert_eq!(root, Value::Number(4.0));
    }

    #[test]
    fn math_op_rejects_unknown_functions() {
        assert_eq!(math_op("abs", -3.5).unwrap(), 3.5);
        assert_eq!(math_op("log", 1.0).unwrap(), 0.0);
        assert!(math_op("cbrt", 8.0).is_err());
    }

    #[tokio::test]
    async fn a_comparison_gates_a_conditional_chain() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut registry = crate::default_registry();
        let mut extension = Extension::new("probe");
        {
            let fired = Arc::clone(&fired);
            extension.command("mark", move |_ctx| {
                let fired = Arc::clone(&fired);
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        registry.register(extension).unwrap();
        let manager = WorkspaceManager::with_settings(
            registry,
            EngineSettings {
                teardown_grace: Duration::from_millis(500),
                poll_interval: Duration::from_millis(30),
            },
        );

        let tab = json!({"target": {"blocks": {
            "top": {"opcode": "control_if", "topLevel": true,
                    "inputs": {"CONDITION": [2, "cmp"], "SUBSTACK": [2, "c1"]}},
            "cmp": {"opcode": "operator_gt", "parent": "top",
                    "inputs": {"OPERAND1": [2, "v1"], "OPERAND2": [1, [4, "10"]]}},
            "v1": {"opcode": "data_variable", "parent": "cmp",
                   "fields": {"VARIABLE": ["temp", "var-1"]}},
            "c1": {"opcode": "probe_mark", "parent": "top"}
        }}})
        .to_string();

        manager.variables().set("var-1", Value::Number(5.0));
        manager.load_tab("tab1", &tab).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        manager.variables().set("var-1", Value::Number(12.0));
        manager.load_tab("tab1", &tab).await.unwrap();
        let probe = Arc::clone(&fired);
        eventually("the gated chain", move || probe.load(Ordering::SeqCst) == 1).await;
        manager.shutdown().await;
    }
}
