//! RPC channel
//!
//! Transport-independent call path shared by the HTTP and socket servers:
//! admission permit, session lookup, method resolution, access check,
//! invocation, optional session start, response envelope.

use std::sync::Arc;
use std::time::Instant;

use keel_common::{AdmissionSemaphore, CallEnvelope, KeelError, Packet, ResponseEnvelope, Result};
use serde_json::{json, Value};

use crate::identity::TransportIdentity;
use crate::method::Access;
use crate::metrics::MetricsCollector;
use crate::sandbox::Sandbox;
use crate::session::SessionStore;

pub struct Channel {
    default_sandbox: Arc<Sandbox>,
    sessions: Arc<SessionStore>,
    semaphore: AdmissionSemaphore,
    metrics: Arc<MetricsCollector>,
}

impl Channel {
    pub fn new(
        default_sandbox: Arc<Sandbox>,
        sessions: Arc<SessionStore>,
        semaphore: AdmissionSemaphore,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            default_sandbox,
            sessions,
            semaphore,
            metrics,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn semaphore(&self) -> &AdmissionSemaphore {
        &self.semaphore
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Runs one call and builds the envelope answering it. Never fails:
    /// errors become error envelopes carrying the call id.
    pub async fn call(&self, call: CallEnvelope, transport: &Arc<TransportIdentity>) -> ResponseEnvelope {
        let start = Instant::now();
        let CallEnvelope { id, target, args } = call;

        let outcome = match self.semaphore.enter().await {
            Ok(permit) => {
                let outcome = self.execute(&target, args, transport).await;
                permit.leave();
                self.metrics.record_call(&target, start, outcome.is_ok());
                outcome
            }
            Err(e) => {
                self.metrics.record_rejected();
                Err(e)
            }
        };

        match outcome {
            Ok(result) => {
                tracing::info!(target: "keel::access", "{}\t{}\tok", transport.ip(), target);
                ResponseEnvelope::success(id, result)
            }
            Err(e) => {
                match &e {
                    KeelError::Method(message) => tracing::info!(
                        target: "keel::access",
                        "{}\t{}\t{}",
                        transport.ip(),
                        target,
                        message
                    ),
                    _ if e.code() >= 500 => tracing::warn!(
                        target: "keel::access",
                        "{}\t{}\t{}",
                        transport.ip(),
                        target,
                        e
                    ),
                    _ => tracing::info!(
                        target: "keel::access",
                        "{}\t{}\t{}",
                        transport.ip(),
                        target,
                        e.code()
                    ),
                }
                ResponseEnvelope::failure(id, &e)
            }
        }
    }

    async fn execute(&self, target: &str, args: Value, transport: &Arc<TransportIdentity>) -> Result<Value> {
        let session = self.sessions.restore(transport).await?;
        let sandbox = session
            .as_ref()
            .map(|s| s.sandbox().clone())
            .unwrap_or_else(|| self.default_sandbox.clone());

        let (access, bound) = sandbox.run(target, session.clone(), transport.clone())?;
        if access == Access::Authenticated && session.is_none() {
            return Err(KeelError::Forbidden(target.to_string()));
        }

        let mut result = bound.invoke(args).await?;

        if access == Access::Public && session.is_none() {
            if let Some(user_id) = result.get("userId").and_then(Value::as_i64) {
                let session = self.sessions.start(transport, user_id).await?;
                if let Value::Object(map) = &mut result {
                    map.insert("token".into(), json!(session.token()));
                }
            }
        }

        Ok(result)
    }

    /// Applies a non-call packet received on a persistent connection.
    pub fn packet(&self, packet: Packet, transport: &TransportIdentity) {
        match packet {
            Packet::Token(token) => {
                transport.set_credential(Some(token));
                tracing::debug!(peer = %transport.remote(), "Credential attached to connection");
            }
            Packet::Call(call) => {
                tracing::warn!(call = call.id, "Call packet routed past the call path");
            }
            Packet::Response(_) | Packet::Event(_) => {
                tracing::debug!(peer = %transport.remote(), "Ignoring client-side packet");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::method::MethodTable;
    use crate::methods;
    use crate::metrics::WorkerRole;
    use crate::resource_limits::ResourceLimits;
    use crate::sandbox::SandboxPool;
    use crate::script::ScriptMethod;
    use crate::security::Argon2Hasher;
    use crate::storage::{Conditions, MemoryStorage, Storage};
    use std::path::Path;
    use std::time::Duration;

    struct Fixture {
        channel: Channel,
        methods: MethodTable,
        storage: Arc<dyn Storage>,
    }

    impl Fixture {
        async fn new(concurrency: usize) -> Self {
            let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
            let capabilities = Capabilities::new(
                storage.clone(),
                Arc::new(Argon2Hasher::with_params(64, 1, 1).unwrap()),
            );
            let methods = MethodTable::new();
            let limits = ResourceLimits::new().with_execution_timeout(Duration::from_millis(500));
            let pool = SandboxPool::new(capabilities.clone(), methods.clone(), limits, 2);
            let sessions = Arc::new(SessionStore::new(&capabilities, pool.clone()));
            let metrics = Arc::new(MetricsCollector::new(WorkerRole::Server, 0));
            methods::register(&methods, sessions.clone(), metrics.clone());
            sessions
                .register_user("marcus", "marcus", "Marcus Aurelius")
                .await
                .unwrap();

            let channel = Channel::new(
                pool.build(),
                sessions,
                AdmissionSemaphore::new(concurrency, 10, Duration::from_millis(200)),
                metrics,
            );
            Self {
                channel,
                methods,
                storage,
            }
        }

        fn script(&self, name: &str, source: &str) {
            let method = ScriptMethod::compile(
                name,
                Path::new("inline.js"),
                source.to_string(),
                &ResourceLimits::new(),
            )
            .unwrap();
            self.methods.insert(name, Arc::new(method));
        }
    }

    fn transport() -> Arc<TransportIdentity> {
        Arc::new(TransportIdentity::http(
            "192.168.1.20:50000".parse().unwrap(),
            Some("example.com"),
            None,
        ))
    }

    #[tokio::test]
    async fn test_sign_in_starts_session() {
        let fixture = Fixture::new(4).await;
        let transport = transport();
        let reply = fixture
            .channel
            .call(
                CallEnvelope::new(1, "signIn", json!({"login": "marcus", "password": "marcus"})),
                &transport,
            )
            .await;

        assert_eq!(reply.callback, 1);
        let result = reply.result.unwrap();
        assert_eq!(result["result"], "success");
        assert!(result["userId"].is_i64());
        let token = result["token"].as_str().unwrap();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));

        let cookies = transport.take_cookies();
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].starts_with(&format!("token={};", token)));
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let fixture = Fixture::new(4).await;
        let reply = fixture
            .channel
            .call(
                CallEnvelope::new(1, "signIn", json!({"login": "marcus", "password": "nope"})),
                &transport(),
            )
            .await;
        let error = reply.error.unwrap();
        assert_eq!(reply.callback, 1);
        assert_eq!(error.message, "Incorrect login or password");
    }

    #[tokio::test]
    async fn test_authenticated_method_requires_session() {
        let fixture = Fixture::new(4).await;
        let reply = fixture
            .channel
            .call(CallEnvelope::new(9, "status", json!({})), &transport())
            .await;
        let error = reply.error.unwrap();
        assert_eq!(error.code, 403);
        assert_eq!(error.message, "Forbidden");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_anonymous_call_never_runs_authenticated_body() {
        let fixture = Fixture::new(4).await;
        fixture.script(
            "record",
            "(args) => { storage.insert('Visit', { page: args.page }); return 'ok'; }",
        );
        let reply = fixture
            .channel
            .call(CallEnvelope::new(4, "record", json!({"page": "/"})), &transport())
            .await;
        let error = reply.error.unwrap();
        assert_eq!(reply.callback, 4);
        assert_eq!(error.code, 403);

        let rows = fixture
            .storage
            .select("Visit", &[], &Conditions::new())
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(fixture.channel.semaphore().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_session_carries_across_calls() {
        let fixture = Fixture::new(4).await;
        let transport = transport();
        fixture
            .channel
            .call(
                CallEnvelope::new(1, "signIn", json!({"login": "marcus", "password": "marcus"})),
                &transport,
            )
            .await;
        let reply = fixture
            .channel
            .call(CallEnvelope::new(2, "status", json!({})), &transport)
            .await;
        assert_eq!(reply.result.unwrap()["result"], "success");
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let fixture = Fixture::new(4).await;
        let reply = fixture
            .channel
            .call(CallEnvelope::new(3, "nothing/here", json!({})), &transport())
            .await;
        assert_eq!(reply.error.unwrap().code, 404);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_permit_released_after_failure() {
        let fixture = Fixture::new(1).await;
        fixture.script(
            "fail",
            "({ access: 'public', method: () => { throw new Error('boom'); } })",
        );
        for id in 1..=3 {
            let reply = fixture
                .channel
                .call(CallEnvelope::new(id, "fail", json!({})), &transport())
                .await;
            assert_eq!(reply.error.unwrap().code, 500);
        }
        assert_eq!(fixture.channel.semaphore().in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_public_script_without_user_id_stays_anonymous() {
        let fixture = Fixture::new(4).await;
        fixture.script("echo", "({ access: 'public', method: (args) => args })");
        let transport = transport();
        let reply = fixture
            .channel
            .call(CallEnvelope::new(5, "echo", json!({"x": 1})), &transport)
            .await;
        assert_eq!(reply.result.unwrap(), json!({"x": 1}));
        assert!(transport.take_cookies().is_empty());
        assert!(fixture.channel.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_token_packet_sets_credential() {
        let fixture = Fixture::new(4).await;
        let transport = transport();
        fixture
            .channel
            .packet(Packet::Token("abc".into()), &transport);
        assert_eq!(transport.credential().as_deref(), Some("abc"));
    }
}
