//! Globals installed into a script method's engine context.
//!
//! A script body sees exactly these globals and nothing else from the host:
//!
//! - `context` - snapshot of the session context, plus
//!   `context.update(key, value)` which persists before returning
//! - `storage.insert(table, record)`, `storage.select(table, fields, conditions)`,
//!   `storage.update(table, delta, conditions)`, `storage.delete(table, conditions)`
//! - `security.hash(secret)`, `security.verify(secret, hash)`
//! - `clock.now()` - milliseconds since the Unix epoch
//! - `log.debug/info/warn/error(message)`
//! - `client.emit(name, payload)` - push an event on a persistent connection
//! - `lib` - the shared modules, evaluated into this context
//!
//! Capability calls are asynchronous on the host side; the script runs on a
//! blocking thread and waits for them through the runtime handle.
//!
//! Every global fails with a timeout error once the invocation's deadline
//! has passed, so a body the caller already gave up on cannot write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use boa_engine::{
    js_string,
    object::{FunctionObjectBuilder, JsObject, ObjectInitializer},
    property::{Attribute, PropertyDescriptor},
    value::JsValue,
    Context, JsError, JsNativeError, JsResult, NativeFunction, Source,
};
use keel_common::{EventEnvelope, KeelError, Result};
use serde_json::{Map, Value};
use tokio::runtime::Handle;

use crate::capabilities::Capabilities;
use crate::modules::SharedModule;
use crate::script::conversions::{js_value_to_json, json_to_js_value};
use crate::session::Session;
use crate::socket_server::Responder;

/// Host handles one script invocation may reach.
pub(crate) struct ScriptScope {
    pub method: String,
    pub modules: Vec<Arc<SharedModule>>,
    pub capabilities: Arc<Capabilities>,
    pub session: Option<Arc<Session>>,
    pub responder: Option<Arc<Responder>>,
    pub handle: Handle,
    pub deadline: Arc<Deadline>,
}

/// Wall-clock bound of one invocation, shared between the awaiting call and
/// the blocking thread running the body.
pub(crate) struct Deadline {
    at: Instant,
    timeout: Duration,
    cancelled: AtomicBool,
}

impl Deadline {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            at: Instant::now() + timeout,
            timeout,
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn expired(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || Instant::now() >= self.at
    }

    fn check(&self) -> JsResult<()> {
        if self.expired() {
            return Err(js_error(KeelError::Timeout(self.timeout.as_millis() as u64)));
        }
        Ok(())
    }
}

/// Cancels the deadline when the awaiting call goes away, e.g. when the
/// execution timeout drops it.
pub(crate) struct CancelOnDrop(pub Arc<Deadline>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Wraps a host closure as a native function that refuses to run past the
/// deadline.
fn native<F>(deadline: &Arc<Deadline>, f: F) -> NativeFunction
where
    F: Fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue> + 'static,
{
    let deadline = deadline.clone();
    // SAFETY: every closure passed here captures only `Arc` handles, strings
    // and a runtime handle. None of them holds a garbage-collected value, so
    // the collector has nothing to trace in the captures.
    unsafe {
        NativeFunction::from_closure(move |this, args, ctx| {
            deadline.check()?;
            f(this, args, ctx)
        })
    }
}

pub(crate) fn install(ctx: &mut Context, scope: &ScriptScope) -> Result<()> {
    let context = context_object(ctx, scope)?;
    register(ctx, "context", context)?;

    let storage = storage_object(ctx, scope);
    register(ctx, "storage", storage)?;

    let security = security_object(ctx, scope);
    register(ctx, "security", security)?;

    let clock = clock_object(ctx, scope);
    register(ctx, "clock", clock)?;

    let log = log_object(ctx, scope);
    register(ctx, "log", log)?;

    let client = client_object(ctx, scope);
    register(ctx, "client", client)?;

    install_lib(ctx, scope)
}

/// Evaluates each shared module and hangs its value under `lib` at the
/// module's path. A module that throws is left out.
fn install_lib(ctx: &mut Context, scope: &ScriptScope) -> Result<()> {
    let lib = ObjectInitializer::new(ctx).build();
    register(ctx, "lib", lib.clone())?;

    let internal = |e: JsError| KeelError::Internal(format!("Failed to install lib: {}", e));
    for module in &scope.modules {
        let Some((leaf, parents)) = module.path().split_last() else {
            continue;
        };
        let value = match ctx.eval(Source::from_bytes(module.source().as_bytes())) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(module = %module.name(), "Module failed to evaluate: {}", e);
                continue;
            }
        };

        let mut target = lib.clone();
        for segment in parents {
            let existing = target.get(js_string!(segment.as_str()), ctx).map_err(internal)?;
            target = match existing.as_object() {
                Some(object) => object.clone(),
                None => {
                    let object = ObjectInitializer::new(ctx).build();
                    target
                        .set(js_string!(segment.as_str()), object.clone(), false, ctx)
                        .map_err(internal)?;
                    object
                }
            };
        }
        target
            .set(js_string!(leaf.as_str()), value, false, ctx)
            .map_err(internal)?;
    }
    Ok(())
}

fn register(ctx: &mut Context, name: &str, object: JsObject) -> Result<()> {
    ctx.register_global_property(
        js_string!(name),
        object,
        Attribute::READONLY | Attribute::PERMANENT,
    )
    .map_err(|e| KeelError::Internal(format!("Failed to install {}: {}", name, e)))
}

pub(crate) fn js_error(err: KeelError) -> JsError {
    JsNativeError::error().with_message(err.to_string()).into()
}

fn string_arg(args: &[JsValue], index: usize, name: &str) -> JsResult<String> {
    args.get(index)
        .and_then(|v| v.as_string())
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| {
            JsNativeError::typ()
                .with_message(format!("{} must be a string", name))
                .into()
        })
}

fn json_arg(args: &[JsValue], index: usize, ctx: &mut Context) -> JsResult<Value> {
    let value = args.get(index).cloned().unwrap_or_default();
    js_value_to_json(value, ctx).map_err(js_error)
}

/// An object argument, or an empty map when the argument is absent.
fn map_arg(args: &[JsValue], index: usize, name: &str, ctx: &mut Context) -> JsResult<Map<String, Value>> {
    match json_arg(args, index, ctx)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(JsNativeError::typ()
            .with_message(format!("{} must be an object", name))
            .into()),
    }
}

fn fields_arg(args: &[JsValue], index: usize, ctx: &mut Context) -> JsResult<Vec<String>> {
    match json_arg(args, index, ctx)? {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                _ => Err(JsNativeError::typ()
                    .with_message("fields must be strings")
                    .into()),
            })
            .collect(),
        Value::Null => Ok(Vec::new()),
        _ => Err(JsNativeError::typ()
            .with_message("fields must be an array")
            .into()),
    }
}

fn to_js(value: Value, ctx: &mut Context) -> JsResult<JsValue> {
    json_to_js_value(value, ctx).map_err(js_error)
}

fn context_object(ctx: &mut Context, scope: &ScriptScope) -> Result<JsObject> {
    let snapshot = scope
        .session
        .as_ref()
        .map(|s| s.context())
        .unwrap_or_default();
    let value = json_to_js_value(Value::Object(snapshot), ctx)?;
    let object = value
        .as_object()
        .map(|o| o.clone())
        .ok_or_else(|| KeelError::Internal("context snapshot is not an object".into()))?;

    let update = {
        let session = scope.session.clone();
        let handle = scope.handle.clone();
        native(&scope.deadline, move |this, args, ctx| {
            let Some(session) = &session else {
                return Err(JsNativeError::typ()
                    .with_message("context.update requires a session")
                    .into());
            };
            let key = string_arg(args, 0, "key")?;
            let raw = args.get(1).cloned().unwrap_or_default();
            let value = js_value_to_json(raw.clone(), ctx).map_err(js_error)?;
            handle.block_on(session.update(&key, value)).map_err(js_error)?;
            if let Some(target) = this.as_object() {
                target.set(js_string!(key), raw, false, ctx)?;
            }
            Ok(JsValue::undefined())
        })
    };
    let update = FunctionObjectBuilder::new(ctx.realm(), update)
        .name(js_string!("update"))
        .length(2)
        .build();
    object
        .define_property_or_throw(
            js_string!("update"),
            PropertyDescriptor::builder()
                .value(update)
                .writable(false)
                .enumerable(false)
                .configurable(false)
                .build(),
            ctx,
        )
        .map_err(|e| KeelError::Internal(format!("Failed to install context.update: {}", e)))?;
    Ok(object)
}

fn storage_object(ctx: &mut Context, scope: &ScriptScope) -> JsObject {
    let storage = scope.capabilities.storage();

    let insert = {
        let storage = storage.clone();
        let handle = scope.handle.clone();
        native(&scope.deadline, move |_, args, ctx| {
            let table = string_arg(args, 0, "table")?;
            let record = map_arg(args, 1, "record", ctx)?;
            let id = handle
                .block_on(storage.insert(&table, record))
                .map_err(js_error)?;
            to_js(id, ctx)
        })
    };

    let select = {
        let storage = storage.clone();
        let handle = scope.handle.clone();
        native(&scope.deadline, move |_, args, ctx| {
            let table = string_arg(args, 0, "table")?;
            let fields = fields_arg(args, 1, ctx)?;
            let conditions = map_arg(args, 2, "conditions", ctx)?;
            let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
            let rows = handle
                .block_on(storage.select(&table, &fields, &conditions))
                .map_err(js_error)?;
            to_js(Value::Array(rows.into_iter().map(Value::Object).collect()), ctx)
        })
    };

    let update = {
        let storage = storage.clone();
        let handle = scope.handle.clone();
        native(&scope.deadline, move |_, args, ctx| {
            let table = string_arg(args, 0, "table")?;
            let delta = map_arg(args, 1, "delta", ctx)?;
            let conditions = map_arg(args, 2, "conditions", ctx)?;
            let changed = handle
                .block_on(storage.update(&table, delta, &conditions))
                .map_err(js_error)?;
            Ok(JsValue::new(changed as f64))
        })
    };

    let delete = {
        let storage = storage.clone();
        let handle = scope.handle.clone();
        native(&scope.deadline, move |_, args, ctx| {
            let table = string_arg(args, 0, "table")?;
            let conditions = map_arg(args, 1, "conditions", ctx)?;
            let removed = handle
                .block_on(storage.delete(&table, &conditions))
                .map_err(js_error)?;
            Ok(JsValue::new(removed as f64))
        })
    };

    ObjectInitializer::new(ctx)
        .function(insert, js_string!("insert"), 2)
        .function(select, js_string!("select"), 3)
        .function(update, js_string!("update"), 3)
        .function(delete, js_string!("delete"), 2)
        .build()
}

fn security_object(ctx: &mut Context, scope: &ScriptScope) -> JsObject {
    let hashing = scope.capabilities.hashing();

    let hash = {
        let hashing = hashing.clone();
        let handle = scope.handle.clone();
        native(&scope.deadline, move |_, args, _ctx| {
            let secret = string_arg(args, 0, "secret")?;
            let hashed = handle.block_on(hashing.hash(&secret)).map_err(js_error)?;
            Ok(JsValue::new(js_string!(hashed)))
        })
    };

    let verify = {
        let hashing = hashing.clone();
        let handle = scope.handle.clone();
        native(&scope.deadline, move |_, args, _ctx| {
            let secret = string_arg(args, 0, "secret")?;
            let hash = string_arg(args, 1, "hash")?;
            let valid = handle
                .block_on(hashing.verify(&secret, &hash))
                .map_err(js_error)?;
            Ok(JsValue::new(valid))
        })
    };

    ObjectInitializer::new(ctx)
        .function(hash, js_string!("hash"), 1)
        .function(verify, js_string!("verify"), 2)
        .build()
}

fn clock_object(ctx: &mut Context, scope: &ScriptScope) -> JsObject {
    let now = {
        let capabilities = scope.capabilities.clone();
        native(&scope.deadline, move |_, _, _| Ok(JsValue::new(capabilities.now_ms() as f64)))
    };
    ObjectInitializer::new(ctx)
        .function(now, js_string!("now"), 0)
        .build()
}

#[derive(Clone, Copy)]
enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

fn log_object(ctx: &mut Context, scope: &ScriptScope) -> JsObject {
    let logger = |level: Level| {
        let method = scope.method.clone();
        native(&scope.deadline, move |_, args, ctx| {
            let message = match args.first() {
                Some(value) if value.is_string() => value
                    .as_string()
                    .map(|s| s.to_std_string_escaped())
                    .unwrap_or_default(),
                _ => json_arg(args, 0, ctx)?.to_string(),
            };
            match level {
                Level::Debug => tracing::debug!(method = %method, "{}", message),
                Level::Info => tracing::info!(method = %method, "{}", message),
                Level::Warn => tracing::warn!(method = %method, "{}", message),
                Level::Error => tracing::error!(method = %method, "{}", message),
            }
            Ok(JsValue::undefined())
        })
    };
    let (debug, info, warn, error) = (
        logger(Level::Debug),
        logger(Level::Info),
        logger(Level::Warn),
        logger(Level::Error),
    );
    ObjectInitializer::new(ctx)
        .function(debug, js_string!("debug"), 1)
        .function(info, js_string!("info"), 1)
        .function(warn, js_string!("warn"), 1)
        .function(error, js_string!("error"), 1)
        .build()
}

fn client_object(ctx: &mut Context, scope: &ScriptScope) -> JsObject {
    let emit = {
        let responder = scope.responder.clone();
        let target = scope.method.clone();
        let handle = scope.handle.clone();
        native(&scope.deadline, move |_, args, ctx| {
            let Some(responder) = &responder else {
                return Err(JsNativeError::typ()
                    .with_message("events require a persistent connection")
                    .into());
            };
            let name = string_arg(args, 0, "name")?;
            let payload = json_arg(args, 1, ctx)?;
            let event = EventEnvelope::new(name, target.clone(), payload);
            handle.block_on(responder.emit(&event)).map_err(js_error)?;
            Ok(JsValue::undefined())
        })
    };
    ObjectInitializer::new(ctx)
        .function(emit, js_string!("emit"), 2)
        .build()
}
