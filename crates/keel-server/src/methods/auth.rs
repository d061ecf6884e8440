use std::sync::Arc;

use async_trait::async_trait;
use keel_common::{KeelError, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use super::SIGN_IN_FAILED;
use crate::method::{Access, CallContext, Method};
use crate::session::SessionStore;

#[derive(Debug, Deserialize)]
struct Credentials {
    #[serde(default)]
    login: String,
    #[serde(default)]
    password: String,
}

/// `signIn {login, password}` → `{result: "success", userId}`.
///
/// The channel turns the `userId` into a session and adds its token.
pub struct SignIn {
    sessions: Arc<SessionStore>,
}

impl SignIn {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Method for SignIn {
    fn access(&self) -> Access {
        Access::Public
    }

    async fn execute(&self, ctx: &CallContext, args: Value) -> Result<Value> {
        let credentials: Credentials = serde_json::from_value(args)
            .map_err(|_| KeelError::Method(SIGN_IN_FAILED.into()))?;

        match self
            .sessions
            .authenticate(&credentials.login, &credentials.password)
            .await?
        {
            Some(user_id) => {
                tracing::info!(user_id, ip = %ctx.transport.ip(), "Signed in");
                Ok(json!({ "result": "success", "userId": user_id }))
            }
            None => {
                tracing::info!(ip = %ctx.transport.ip(), "Sign-in refused");
                Err(KeelError::Method(SIGN_IN_FAILED.into()))
            }
        }
    }
}

/// `signOut` revokes the caller's session and clears its credential.
pub struct SignOut {
    sessions: Arc<SessionStore>,
}

impl SignOut {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Method for SignOut {
    fn access(&self) -> Access {
        Access::Authenticated
    }

    async fn execute(&self, ctx: &CallContext, _args: Value) -> Result<Value> {
        let session = ctx
            .session
            .as_ref()
            .ok_or_else(|| KeelError::Forbidden("signOut".into()))?;
        self.sessions.remove(&ctx.transport, session.token()).await?;
        Ok(json!({ "result": "success" }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Registration {
    login: String,
    password: String,
    #[serde(default)]
    full_name: String,
}

/// `registerUser {login, password, fullName}` → `{result: "success", id}`.
///
/// Registering does not sign the new user in.
pub struct RegisterUser {
    sessions: Arc<SessionStore>,
}

impl RegisterUser {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Method for RegisterUser {
    fn access(&self) -> Access {
        Access::Public
    }

    async fn execute(&self, _ctx: &CallContext, args: Value) -> Result<Value> {
        let registration: Registration = serde_json::from_value(args)
            .map_err(|_| KeelError::Method("login and password are required".into()))?;
        if registration.login.is_empty() || registration.password.is_empty() {
            return Err(KeelError::Method("login and password are required".into()));
        }

        let id = self
            .sessions
            .register_user(
                &registration.login,
                &registration.password,
                &registration.full_name,
            )
            .await?;
        tracing::info!(login = %registration.login, "User registered");
        // Not `userId`: that key is what opens a session
        Ok(json!({ "result": "success", "id": id }))
    }
}

/// `status` → the caller's user id and session context.
pub struct Status;

#[async_trait]
impl Method for Status {
    fn access(&self) -> Access {
        Access::Authenticated
    }

    async fn execute(&self, ctx: &CallContext, _args: Value) -> Result<Value> {
        let session = ctx
            .session
            .as_ref()
            .ok_or_else(|| KeelError::Forbidden("status".into()))?;
        Ok(json!({
            "result": "success",
            "userId": session.user_id(),
            "context": session.context(),
        }))
    }
}
