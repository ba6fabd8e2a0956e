// services: the shared fixture services the integration suites run against.

use std::sync::Mutex;
use std::time::Duration;

use river_core::registry::{ProcedureDef, ServiceDef};
use river_core::schema::Schema;
use river_protocol::ErrorPayload;
use serde_json::{Value, json};

/// Counter state for the math service.
#[derive(Debug, Default)]
pub struct MathState {
    pub count: Mutex<i64>,
}

/// `math.add` accumulates into shared state; `math.divide` declares a
/// `DIV_BY_ZERO` error union.
#[must_use]
pub fn math_service() -> ServiceDef {
    ServiceDef::with_state("math", MathState::default())
        .procedure(
            "add",
            ProcedureDef::rpc(
                Schema::object_with_required("add_init", &["n"]),
                Schema::object_with_required("add_output", &["result"]),
                Schema::any("add_error"),
                |ctx, init| {
                    Box::pin(async move {
                        let n = init.get("n").and_then(Value::as_i64).unwrap_or(0);
                        let state = ctx
                            .state::<MathState>()
                            .expect("math state registered with the service");
                        let mut count = state.count.lock().expect("count poisoned");
                        *count += n;
                        Ok(json!({ "result": *count }))
                    })
                },
            ),
        )
        .procedure(
            "divide",
            ProcedureDef::rpc(
                Schema::object_with_required("divide_init", &["a", "b"]),
                Schema::object_with_required("divide_output", &["result"]),
                Schema::object_with_required("divide_error", &["code", "message"]),
                |_ctx, init| {
                    Box::pin(async move {
                        let a = init.get("a").and_then(Value::as_i64).unwrap_or(0);
                        let b = init.get("b").and_then(Value::as_i64).unwrap_or(0);
                        if b == 0 {
                            let mut error =
                                ErrorPayload::new("DIV_BY_ZERO", "Cannot divide by zero");
                            error.extras = Some(json!({ "test": "abc" }));
                            return Err(error);
                        }
                        Ok(json!({ "result": a / b }))
                    })
                },
            ),
        )
}

/// Append-only list service used by the ordering scenarios.
#[derive(Debug, Default)]
pub struct OrderState {
    pub values: Mutex<Vec<i64>>,
}

/// `order.append` pushes a value; `order.get_all` returns everything in
/// arrival order.
#[must_use]
pub fn order_service() -> ServiceDef {
    ServiceDef::with_state("order", OrderState::default())
        .procedure(
            "append",
            ProcedureDef::rpc(
                Schema::object_with_required("append_init", &["n"]),
                Schema::object_with_required("append_output", &["count"]),
                Schema::any("append_error"),
                |ctx, init| {
                    Box::pin(async move {
                        let n = init.get("n").and_then(Value::as_i64).unwrap_or(0);
                        let state = ctx
                            .state::<OrderState>()
                            .expect("order state registered with the service");
                        let mut values = state.values.lock().expect("values poisoned");
                        values.push(n);
                        Ok(json!({ "count": values.len() }))
                    })
                },
            ),
        )
        .procedure(
            "get_all",
            ProcedureDef::rpc(
                Schema::any("get_all_init"),
                Schema::object_with_required("get_all_output", &["values"]),
                Schema::any("get_all_error"),
                |ctx, _init| {
                    Box::pin(async move {
                        let state = ctx
                            .state::<OrderState>()
                            .expect("order state registered with the service");
                        let values = state.values.lock().expect("values poisoned").clone();
                        Ok(json!({ "values": values }))
                    })
                },
            ),
        )
}

/// `echo.echo` is a bidirectional stream echoing non-ignored messages;
/// `echo.echo_prefix` prepends the init-supplied prefix.
#[must_use]
pub fn echo_service() -> ServiceDef {
    ServiceDef::new("echo")
        .procedure(
            "echo",
            ProcedureDef::stream(
                Schema::any("echo_init"),
                Schema::object_with_required("echo_input", &["msg", "ignore"]),
                Schema::object_with_required("echo_output", &["response"]),
                Schema::any("echo_error"),
                |_ctx, _init, mut readable, writable| {
                    Box::pin(async move {
                        while let Some(item) = readable.next().await {
                            let Ok(value) = item else { break };
                            let ignore =
                                value.get("ignore").and_then(Value::as_bool).unwrap_or(false);
                            if ignore {
                                continue;
                            }
                            let msg = value.get("msg").cloned().unwrap_or(Value::Null);
                            if writable.write(json!({ "response": msg })).is_err() {
                                break;
                            }
                        }
                        writable.close();
                        Ok(())
                    })
                },
            ),
        )
        .procedure(
            "echo_prefix",
            ProcedureDef::stream(
                Schema::object_with_required("echo_prefix_init", &["prefix"]),
                Schema::object_with_required("echo_input", &["msg", "ignore"]),
                Schema::object_with_required("echo_output", &["response"]),
                Schema::any("echo_error"),
                |_ctx, init, mut readable, writable| {
                    Box::pin(async move {
                        let prefix = init
                            .get("prefix")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned();
                        while let Some(item) = readable.next().await {
                            let Ok(value) = item else { break };
                            let ignore =
                                value.get("ignore").and_then(Value::as_bool).unwrap_or(false);
                            if ignore {
                                continue;
                            }
                            let msg = value.get("msg").and_then(Value::as_str).unwrap_or_default();
                            let line = format!("{prefix}{msg}");
                            if writable.write(json!({ "response": line })).is_err() {
                                break;
                            }
                        }
                        writable.close();
                        Ok(())
                    })
                },
            ),
        )
}

/// `upload.add_all` sums every uploaded `n` and responds once the client
/// half-closes.
#[must_use]
pub fn upload_service() -> ServiceDef {
    ServiceDef::new("upload").procedure(
        "add_all",
        ProcedureDef::upload(
            Schema::any("add_all_init"),
            Schema::object_with_required("add_all_input", &["n"]),
            Schema::object_with_required("add_all_output", &["result"]),
            Schema::any("add_all_error"),
            |_ctx, _init, mut readable| {
                Box::pin(async move {
                    let mut sum = 0i64;
                    while let Some(item) = readable.next().await {
                        match item {
                            Ok(value) => {
                                sum += value.get("n").and_then(Value::as_i64).unwrap_or(0);
                            }
                            Err(error) => return Err(error),
                        }
                    }
                    Ok(json!({ "result": sum }))
                })
            },
        ),
    )
}

/// `subscribable.count_up` emits `0..to` then closes; `subscribable.ticker`
/// emits forever until cancelled or the reader requests close.
#[must_use]
pub fn subscribable_service() -> ServiceDef {
    ServiceDef::new("subscribable")
        .procedure(
            "count_up",
            ProcedureDef::subscription(
                Schema::object_with_required("count_up_init", &["to"]),
                Schema::object_with_required("count_up_output", &["n"]),
                Schema::any("count_up_error"),
                |_ctx, init, writable| {
                    Box::pin(async move {
                        let to = init.get("to").and_then(Value::as_i64).unwrap_or(0);
                        for n in 0..to {
                            if writable.write(json!({ "n": n })).is_err() {
                                break;
                            }
                        }
                        writable.close();
                        Ok(())
                    })
                },
            ),
        )
        .procedure(
            "silent",
            ProcedureDef::subscription(
                Schema::any("silent_init"),
                Schema::any("silent_output"),
                Schema::any("silent_error"),
                |ctx, _init, writable| {
                    Box::pin(async move {
                        // Holds the stream open without traffic until the
                        // stream is torn down around it.
                        let _ = ctx.cancellation().fired().await;
                        writable.close();
                        Ok(())
                    })
                },
            ),
        )
        .procedure(
            "ticker",
            ProcedureDef::subscription(
                Schema::any("ticker_init"),
                Schema::object_with_required("ticker_output", &["tick"]),
                Schema::any("ticker_error"),
                |ctx, _init, writable| {
                    Box::pin(async move {
                        let token = ctx.cancellation();
                        let mut tick = tokio::time::interval(Duration::from_millis(100));
                        let mut n = 0i64;
                        loop {
                            tokio::select! {
                                _ = tick.tick() => {
                                    if token.is_fired()
                                        || writable.is_close_requested()
                                        || !writable.is_writable()
                                    {
                                        break;
                                    }
                                    if writable.write(json!({ "tick": n })).is_err() {
                                        break;
                                    }
                                    n += 1;
                                }
                                _ = token.fired() => break,
                            }
                        }
                        writable.close();
                        Ok(())
                    })
                },
            ),
        )
}
