//! File-based script methods
//!
//! A method file evaluates to either a bare function (authenticated access)
//! or an object:
//!
//! ```js
//! ({
//!   access: 'public',
//!   method: async ({ login }) => {
//!     const [user] = storage.select('SystemUser', ['id'], { login });
//!     return { exists: !!user };
//!   },
//! });
//! ```
//!
//! Throwing a string fails the call with that string as a business error;
//! any other exception is an internal error whose detail stays in the log.
//!
//! Each call evaluates the cached source in a fresh engine context on a
//! blocking thread, because engine contexts cannot move between threads.
//! Shared modules are evaluated into the same context first, as `lib`.

mod bindings;
pub mod conversions;

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use boa_engine::{
    js_string, object::FunctionObjectBuilder, object::JsObject, value::JsValue, Context, JsError,
    NativeFunction, Script, Source,
};
use keel_common::{KeelError, Result};
use serde_json::Value;

use crate::capabilities::Capabilities;
use crate::method::{Access, CallContext, Method};
use crate::modules::SharedModule;
use crate::resource_limits::ResourceLimits;
use bindings::{CancelOnDrop, Deadline, ScriptScope};
use conversions::{js_value_to_json, json_to_js_value};

pub struct ScriptMethod {
    name: String,
    path: PathBuf,
    source: Arc<str>,
    access: Access,
}

impl ScriptMethod {
    /// Evaluates `source` in a throwaway context to validate its shape.
    /// The method body itself is not run.
    pub fn compile(name: &str, path: &Path, source: String, limits: &ResourceLimits) -> Result<Self> {
        let mut ctx = new_context(limits);
        let value = ctx
            .eval(Source::from_bytes(source.as_bytes()))
            .map_err(|e| KeelError::Internal(format!("{}: {}", path.display(), e)))?;
        let (access, _) = resolve(&value, &mut ctx)
            .map_err(|e| KeelError::Internal(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            source: Arc::from(source),
            access,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Method for ScriptMethod {
    fn access(&self) -> Access {
        self.access
    }

    async fn execute(&self, ctx: &CallContext, args: Value) -> Result<Value> {
        let limits = ctx.sandbox.limits().clone();
        let deadline = Deadline::new(limits.execution_timeout);
        let _cancel = CancelOnDrop(deadline.clone());
        let scope = ScriptScope {
            method: self.name.clone(),
            modules: ctx.capabilities().modules().exports(),
            capabilities: ctx.capabilities().clone(),
            session: ctx.session.clone(),
            responder: ctx.transport.responder().cloned(),
            handle: tokio::runtime::Handle::current(),
            deadline,
        };
        let source = self.source.clone();

        tokio::task::spawn_blocking(move || run(&source, args, &scope, &limits))
            .await
            .map_err(|e| KeelError::Internal(format!("Script task failed: {}", e)))?
    }
}

/// Runs a start hook. The file must evaluate to a function, which is called
/// without arguments under the execution timeout and sees the same globals
/// as a method body without a session.
pub async fn run_start_hook(
    hook: &SharedModule,
    capabilities: Arc<Capabilities>,
    limits: &ResourceLimits,
) -> Result<Value> {
    let timeout = limits.execution_timeout;
    let deadline = Deadline::new(timeout);
    let _cancel = CancelOnDrop(deadline.clone());
    let scope = ScriptScope {
        method: hook.name(),
        modules: capabilities.modules().exports(),
        capabilities,
        session: None,
        responder: None,
        handle: tokio::runtime::Handle::current(),
        deadline,
    };
    let source = hook.source().clone();
    let limits = limits.clone();

    let task = tokio::task::spawn_blocking(move || run_hook(&source, &scope, &limits));
    match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined.map_err(|e| KeelError::Internal(format!("Start hook task failed: {}", e)))?,
        Err(_) => Err(KeelError::Timeout(timeout.as_millis() as u64)),
    }
}

/// Parses `source` without running it.
pub(crate) fn check_syntax(file: &Path, source: &str) -> Result<()> {
    let mut ctx = Context::default();
    Script::parse(Source::from_bytes(source.as_bytes()), None, &mut ctx)
        .map(|_| ())
        .map_err(|e| KeelError::Internal(format!("{}: {}", file.display(), e)))
}

fn new_context(limits: &ResourceLimits) -> Context {
    let mut ctx = Context::default();
    ctx.runtime_limits_mut()
        .set_loop_iteration_limit(limits.effective_loop_limit());
    ctx
}

/// Extracts the access level and the callable from an evaluated file.
fn resolve(value: &JsValue, ctx: &mut Context) -> Result<(Access, JsObject)> {
    let shape_error =
        || KeelError::Internal("method file must evaluate to a function or { access, method }".into());

    let object = value.as_object().map(|o| o.clone()).ok_or_else(shape_error)?;
    if object.is_callable() {
        return Ok((Access::Authenticated, object));
    }

    let access = object
        .get(js_string!("access"), ctx)
        .map_err(|e| KeelError::Internal(e.to_string()))?;
    let access = if access.is_undefined() {
        Access::Authenticated
    } else {
        let raw = access
            .as_string()
            .map(|s| s.to_std_string_escaped())
            .unwrap_or_default();
        Access::parse(&raw)
            .ok_or_else(|| KeelError::Internal(format!("unknown access level {:?}", raw)))?
    };

    let method = object
        .get(js_string!("method"), ctx)
        .map_err(|e| KeelError::Internal(e.to_string()))?;
    let method = method
        .as_object()
        .map(|o| o.clone())
        .filter(|o| o.is_callable())
        .ok_or_else(shape_error)?;

    Ok((access, method))
}

fn run(source: &str, args: Value, scope: &ScriptScope, limits: &ResourceLimits) -> Result<Value> {
    let mut ctx = new_context(limits);
    bindings::install(&mut ctx, scope)?;

    let value = ctx
        .eval(Source::from_bytes(source.as_bytes()))
        .map_err(thrown)?;
    let (_, function) = resolve(&value, &mut ctx)?;

    let js_args = json_to_js_value(args, &mut ctx)?;
    let result = function
        .call(&JsValue::undefined(), &[js_args], &mut ctx)
        .map_err(thrown)?;

    settle(result, &mut ctx)
}

fn run_hook(source: &str, scope: &ScriptScope, limits: &ResourceLimits) -> Result<Value> {
    let mut ctx = new_context(limits);
    bindings::install(&mut ctx, scope)?;

    let value = ctx
        .eval(Source::from_bytes(source.as_bytes()))
        .map_err(thrown)?;
    let function = value
        .as_object()
        .map(|o| o.clone())
        .filter(|o| o.is_callable())
        .ok_or_else(|| KeelError::Internal("start hook must evaluate to a function".into()))?;
    let result = function
        .call(&JsValue::undefined(), &[], &mut ctx)
        .map_err(thrown)?;

    settle(result, &mut ctx)
}

/// Maps an exception to the caller-facing error.
fn thrown(err: JsError) -> KeelError {
    if let Some(value) = err.as_opaque() {
        if let Some(message) = value.as_string() {
            return KeelError::Method(message.to_std_string_escaped());
        }
    }
    KeelError::Internal(format!("Script error: {}", err))
}

type Outcome = Rc<RefCell<Option<Result<Value>>>>;

/// Resolves a returned thenable by draining the job queue; plain values are
/// converted directly.
fn settle(result: JsValue, ctx: &mut Context) -> Result<Value> {
    let then = match result.as_object() {
        Some(object) => object
            .get(js_string!("then"), ctx)
            .map_err(|e| KeelError::Internal(e.to_string()))?,
        None => JsValue::undefined(),
    };
    let Some(then) = then.as_object().map(|o| o.clone()).filter(|o| o.is_callable()) else {
        return js_value_to_json(result, ctx);
    };

    let outcome: Outcome = Rc::new(RefCell::new(None));

    // SAFETY: the captured cell only ever holds plain JSON values and
    // errors, never engine values, so there is nothing for the collector
    // to trace.
    let on_fulfilled = {
        let outcome = outcome.clone();
        unsafe {
            NativeFunction::from_closure(move |_, args, ctx| {
                let value = args.first().cloned().unwrap_or_default();
                *outcome.borrow_mut() = Some(js_value_to_json(value, ctx));
                Ok(JsValue::undefined())
            })
        }
    };
    let on_rejected = {
        let outcome = outcome.clone();
        unsafe {
            NativeFunction::from_closure(move |_, args, _ctx| {
                let reason = args.first().cloned().unwrap_or_default();
                let err = match reason.as_string() {
                    Some(message) => KeelError::Method(message.to_std_string_escaped()),
                    None => KeelError::Internal(format!("Script rejected: {}", reason.display())),
                };
                *outcome.borrow_mut() = Some(Err(err));
                Ok(JsValue::undefined())
            })
        }
    };

    let on_fulfilled = FunctionObjectBuilder::new(ctx.realm(), on_fulfilled).length(1).build();
    let on_rejected = FunctionObjectBuilder::new(ctx.realm(), on_rejected).length(1).build();
    then.call(&result, &[on_fulfilled.into(), on_rejected.into()], ctx)
        .map_err(thrown)?;

    let _ = ctx.run_jobs();

    let settled = outcome.borrow_mut().take();
    settled.unwrap_or_else(|| Err(KeelError::Internal("method promise never settled".into())))
}

#[cfg(test)]
mod tests;
