use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use keel_common::KeelError;
use serde_json::{json, Value};

use super::ScriptMethod;
use crate::capabilities::Capabilities;
use crate::identity::TransportIdentity;
use crate::method::{Access, BoundCall, CallContext, Method, MethodTable};
use crate::modules::ModuleTable;
use crate::resource_limits::ResourceLimits;
use crate::sandbox::SandboxPool;
use crate::security::Argon2Hasher;
use crate::session::SessionStore;
use crate::storage::{conditions, Conditions, MemoryStorage, Storage};

struct Harness {
    capabilities: Arc<Capabilities>,
    pool: Arc<SandboxPool>,
    limits: ResourceLimits,
}

impl Harness {
    fn new() -> Self {
        Self::with_limits(ResourceLimits::new())
    }

    fn with_limits(limits: ResourceLimits) -> Self {
        Self::build(limits, ModuleTable::default())
    }

    fn with_modules(modules: ModuleTable) -> Self {
        Self::build(ResourceLimits::new(), modules)
    }

    fn build(limits: ResourceLimits, modules: ModuleTable) -> Self {
        let capabilities = Capabilities::with_modules(
            Arc::new(MemoryStorage::new()),
            Arc::new(Argon2Hasher::with_params(64, 1, 1).unwrap()),
            modules,
        );
        let pool = SandboxPool::new(capabilities.clone(), MethodTable::new(), limits.clone(), 1);
        Self {
            capabilities,
            pool,
            limits,
        }
    }

    fn compile(&self, source: &str) -> keel_common::Result<ScriptMethod> {
        ScriptMethod::compile("test", Path::new("test.js"), source.to_string(), &self.limits)
    }

    fn anonymous(&self) -> CallContext {
        CallContext {
            method: "test".into(),
            session: None,
            transport: Arc::new(TransportIdentity::http(
                "127.0.0.1:5000".parse().unwrap(),
                None,
                None,
            )),
            sandbox: self.pool.build(),
        }
    }

    async fn call(&self, source: &str, args: Value) -> keel_common::Result<Value> {
        let method = self.compile(source)?;
        method.execute(&self.anonymous(), args).await
    }
}

#[test]
fn test_object_shape_access() {
    let harness = Harness::new();
    let open = harness
        .compile("({ access: 'public', method: () => 1 })")
        .unwrap();
    assert_eq!(open.access(), Access::Public);

    let closed = harness
        .compile("({ access: 'authenticated', method: () => 1 })")
        .unwrap();
    assert_eq!(closed.access(), Access::Authenticated);

    let implicit = harness.compile("({ method: () => 1 })").unwrap();
    assert_eq!(implicit.access(), Access::Authenticated);
}

#[test]
fn test_bare_function_is_authenticated() {
    let harness = Harness::new();
    let method = harness.compile("(args) => args").unwrap();
    assert_eq!(method.access(), Access::Authenticated);
}

#[test]
fn test_bad_shapes_fail_to_compile() {
    let harness = Harness::new();
    assert!(harness.compile("42").is_err());
    assert!(harness.compile("({ access: 'public' })").is_err());
    assert!(harness.compile("({ access: 'everyone', method: () => 1 })").is_err());
    assert!(harness.compile("({ method: ").is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_returns_arguments() {
    let harness = Harness::new();
    let result = harness
        .call(
            "({ access: 'public', method: ({ a, b }) => ({ sum: a + b, tags: ['x'] }) })",
            json!({ "a": 2, "b": 3 }),
        )
        .await
        .unwrap();
    assert_eq!(result, json!({ "sum": 5, "tags": ["x"] }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_method_settles() {
    let harness = Harness::new();
    let result = harness
        .call(
            "({ access: 'public', method: async ({ n }) => { await null; return n * 2; } })",
            json!({ "n": 21 }),
        )
        .await
        .unwrap();
    assert_eq!(result, json!(42));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_thrown_string_is_business_error() {
    let harness = Harness::new();
    let err = harness
        .call(
            "({ access: 'public', method: () => { throw 'Incorrect login or password'; } })",
            json!({}),
        )
        .await
        .unwrap_err();
    match err {
        KeelError::Method(message) => assert_eq!(message, "Incorrect login or password"),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_string_is_business_error() {
    let harness = Harness::new();
    let err = harness
        .call(
            "({ access: 'public', method: async () => { throw 'nope'; } })",
            json!({}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KeelError::Method(m) if m == "nope"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_other_exception_is_internal() {
    let harness = Harness::new();
    let err = harness
        .call(
            "({ access: 'public', method: () => { throw new Error('secret detail'); } })",
            json!({}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KeelError::Internal(_)));
    assert_eq!(err.public_message(), "Internal Server Error");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runaway_loop_is_stopped() {
    let harness = Harness::with_limits(ResourceLimits::new().with_loop_iteration_limit(10_000));
    let err = harness
        .call(
            "({ access: 'public', method: () => { while (true) {} } })",
            json!({}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KeelError::Internal(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_out_body_cannot_write() {
    let harness = Harness::new();
    let timeout = Duration::from_millis(100);
    let source = r#"({
        access: 'public',
        method: () => {
            const start = Date.now();
            while (Date.now() - start < 300) {}
            storage.insert('Late', { written: true });
            return 'done';
        },
    })"#;
    let call = BoundCall {
        method: Arc::new(harness.compile(source).unwrap()),
        ctx: harness.anonymous(),
        timeout,
    };
    let err = call.invoke(json!({})).await.unwrap_err();
    assert!(matches!(err, KeelError::Timeout(100)));

    // Give the abandoned body time to reach its storage call
    tokio::time::sleep(Duration::from_millis(600)).await;
    let rows = harness
        .capabilities
        .storage()
        .select("Late", &["written"], &Conditions::new())
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_modules_are_injected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("geo")).unwrap();
    std::fs::write(dir.path().join("geo/distance.js"), "(a, b) => Math.abs(a - b)").unwrap();
    std::fs::write(dir.path().join("geo/start.js"), "() => {}").unwrap();
    std::fs::write(dir.path().join("units.js"), "({ km: (m) => m / 1000 })").unwrap();
    std::fs::write(dir.path().join("faulty.js"), "(() => { throw 'nope'; })()").unwrap();
    let modules = ModuleTable::new(dir.path());
    modules.load().await.unwrap();

    let harness = Harness::with_modules(modules);
    let result = harness
        .call(
            r#"({
                access: 'public',
                method: () => [
                    lib.units.km(lib.geo.distance(500, 3500)),
                    typeof lib.geo.start,
                    typeof lib.faulty,
                ],
            })"#,
            json!({}),
        )
        .await
        .unwrap();
    assert_eq!(result, json!([3, "undefined", "undefined"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_storage_binding() {
    let harness = Harness::new();
    let source = r#"({
        access: 'public',
        method: ({ name }) => {
            const id = storage.insert('Item', { name, count: 1 });
            storage.update('Item', { count: 5 }, { id });
            const rows = storage.select('Item', ['name', 'count'], { name });
            return { id, rows };
        },
    })"#;
    let result = harness
        .call(source, json!({ "name": "widget" }))
        .await
        .unwrap();
    assert_eq!(result["id"], json!(1));
    assert_eq!(result["rows"], json!([{ "name": "widget", "count": 5 }]));

    let rows = harness
        .capabilities
        .storage()
        .select("Item", &["count"], &conditions([("name", json!("widget"))]))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_security_and_clock_bindings() {
    let harness = Harness::new();
    let source = r#"({
        access: 'public',
        method: ({ secret }) => {
            const hash = security.hash(secret);
            return {
                good: security.verify(secret, hash),
                bad: security.verify('other', hash),
                recent: clock.now() > 1600000000000,
            };
        },
    })"#;
    let result = harness
        .call(source, json!({ "secret": "hunter2" }))
        .await
        .unwrap();
    assert_eq!(result, json!({ "good": true, "bad": false, "recent": true }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_is_not_reachable() {
    let harness = Harness::new();
    let result = harness
        .call(
            "({ access: 'public', method: () => [typeof require, typeof process, typeof fetch] })",
            json!({}),
        )
        .await
        .unwrap();
    assert_eq!(result, json!(["undefined", "undefined", "undefined"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_emit_without_connection_fails() {
    let harness = Harness::new();
    let err = harness
        .call(
            "({ access: 'public', method: () => client.emit('tick', {}) })",
            json!({}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KeelError::Internal(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_context_update_persists() {
    let harness = Harness::new();
    let sessions = SessionStore::new(&harness.capabilities, harness.pool.clone());
    let transport = Arc::new(TransportIdentity::http(
        "127.0.0.1:5000".parse().unwrap(),
        None,
        None,
    ));
    let session = sessions.start(&transport, 7).await.unwrap();

    let method = harness
        .compile("() => { context.update('theme', 'dark'); return context.theme; }")
        .unwrap();
    let ctx = CallContext {
        method: "test".into(),
        session: Some(session.clone()),
        transport,
        sandbox: session.sandbox().clone(),
    };
    let result = method.execute(&ctx, json!({})).await.unwrap();
    assert_eq!(result, json!("dark"));
    assert_eq!(session.get("theme"), Some(json!("dark")));

    let rows = harness
        .capabilities
        .storage()
        .select(
            "Session",
            &["data"],
            &conditions([("token", json!(session.token()))]),
        )
        .await
        .unwrap();
    let data: Value = serde_json::from_str(rows[0]["data"].as_str().unwrap()).unwrap();
    assert_eq!(data, json!({ "theme": "dark" }));
}
