//! Demo RPC methods.
//!
//! | method  | argument                                   | result                                   |
//! |---------|--------------------------------------------|------------------------------------------|
//! | `echo`  | any values                                 | `{"value": arg}` for each argument       |
//! | `fail`  | `{name, message, info?, context?, data?}`  | `{"value": x}` per `data` entry, then the error |
//! | `sleep` | `{ms}`                                     | nothing, after `ms` milliseconds         |
//! | `yes`   | `{count, value}`                           | `{"value": value}`, `count` times        |

use fastrpc_common::RpcError;
use fastrpc_server::{FastServer, RpcContext, ServerError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct FailArgs {
    name: String,
    message: String,
    #[serde(default)]
    info: Option<Value>,
    #[serde(default)]
    context: Option<Value>,
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SleepArgs {
    ms: u64,
}

#[derive(Debug, Deserialize)]
struct YesArgs {
    count: u64,
    value: Value,
}

/// Registers `echo`, `fail`, `sleep` and `yes` on `server`.
pub fn register_demo_methods(server: &mut FastServer) -> Result<(), ServerError> {
    server.register_rpc_method("echo", echo)?;
    server.register_rpc_method("fail", fail)?;
    server.register_rpc_method("sleep", sleep)?;
    server.register_rpc_method("yes", yes)?;
    Ok(())
}

/// Decodes the single object argument the non-echo methods take.
fn single_arg<T: DeserializeOwned>(ctx: &RpcContext) -> Result<T, RpcError> {
    let [arg]: [Value; 1] = ctx.argv().try_into().map_err(|_| {
        RpcError::new(
            "InvalidArgumentsError",
            format!("{} expects exactly one argument", ctx.method_name()),
        )
    })?;
    serde_json::from_value(arg).map_err(|e| {
        RpcError::new(
            "InvalidArgumentsError",
            format!("bad argument for {}: {}", ctx.method_name(), e),
        )
    })
}

async fn echo(mut ctx: RpcContext) {
    for value in ctx.argv() {
        ctx.write(json!({ "value": value })).await;
    }
    ctx.end().await;
}

async fn fail(mut ctx: RpcContext) {
    let args: FailArgs = match single_arg(&ctx) {
        Ok(args) => args,
        Err(e) => return ctx.fail(e).await,
    };

    for value in args.data {
        ctx.write(json!({ "value": value })).await;
    }

    let mut error = RpcError::new(args.name, args.message);
    error.info = args.info;
    error.context = args.context;
    ctx.fail(error).await;
}

async fn sleep(ctx: RpcContext) {
    let args: SleepArgs = match single_arg(&ctx) {
        Ok(args) => args,
        Err(e) => return ctx.fail(e).await,
    };

    tokio::time::sleep(Duration::from_millis(args.ms)).await;
    ctx.end().await;
}

async fn yes(mut ctx: RpcContext) {
    let args: YesArgs = match single_arg(&ctx) {
        Ok(args) => args,
        Err(e) => return ctx.fail(e).await,
    };

    for _ in 0..args.count {
        if ctx.is_disconnected() {
            tracing::debug!(msgid = ctx.request_id(), "client went away, stopping early");
            break;
        }
        ctx.write(json!({ "value": args.value })).await;
    }
    ctx.end().await;
}
