//! Hooks Module
//!
//! Extension points for authentication, publish interception and
//! per-subscriber delivery filtering. Policy lives in the implementations;
//! the broker only calls them at fixed points.

use std::fmt;

use async_trait::async_trait;

use crate::protocol::{Publish, QoS, ReasonCode};


/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
    /// Authentication failed
    AuthenticationFailed,
    /// Authorization denied
    AuthorizationDenied,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::AuthenticationFailed => write!(f, "Authentication failed"),
            HookError::AuthorizationDenied => write!(f, "Authorization denied"),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Outcome of publish interception
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishDecision {
    /// Dispatch normally
    #[default]
    Accept,
    /// Do not dispatch; acknowledge QoS 1/2 with this reason code
    Reject(ReasonCode),
    /// Do not dispatch and close the publisher's connection
    Close(ReasonCode),
}

/// Broker hooks trait
///
/// Every method has a default that allows everything, so implementations
/// only override what they need.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called for every CONNECT before a session is created or resumed
    ///
    /// # Returns
    /// * `Ok(true)` - Authentication successful
    /// * `Ok(false)` - Rejected with "not authorized"
    /// * `Err(_)` - Internal error; the connection is refused
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called before an inbound or injected publish is dispatched.
    /// `sender` is `None` for server-originated messages.
    async fn on_publish(
        &self,
        _sender: Option<&str>,
        _publish: &Publish,
    ) -> HookResult<PublishDecision> {
        Ok(PublishDecision::Accept)
    }

    /// Called for each topic filter of a SUBSCRIBE
    async fn on_subscribe_check(
        &self,
        _client_id: &str,
        _filter: &str,
        _qos: QoS,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called for each topic filter of an UNSUBSCRIBE. `false` keeps the
    /// subscription and answers with "not authorized".
    async fn on_unsubscribe_check(&self, _client_id: &str, _filter: &str) -> HookResult<bool> {
        Ok(true)
    }

    /// Called once per matched subscriber during fan-out. Returning `false`
    /// skips that subscriber only. Runs on the dispatch path, so it must not
    /// block.
    fn on_enqueue(&self, _client_id: &str, _publish: &Publish) -> bool {
        true
    }

    /// Called after CONNACK is queued
    async fn on_client_connected(&self, _client_id: &str, _username: Option<&str>) {}

    /// Called after a connection ends
    ///
    /// `graceful` is true when the client sent DISCONNECT
    async fn on_client_disconnected(&self, _client_id: &str, _graceful: bool) {}
}

/// Default hooks implementation that allows everything
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

/// Implement Hooks for Arc<T> where T: Hooks
#[async_trait]
impl<T: Hooks + ?Sized> Hooks for std::sync::Arc<T> {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        (**self)
            .on_authenticate(client_id, username, password)
            .await
    }

    async fn on_publish(
        &self,
        sender: Option<&str>,
        publish: &Publish,
    ) -> HookResult<PublishDecision> {
        (**self).on_publish(sender, publish).await
    }

    async fn on_subscribe_check(
        &self,
        client_id: &str,
        filter: &str,
        qos: QoS,
    ) -> HookResult<bool> {
        (**self).on_subscribe_check(client_id, filter, qos).await
    }

    async fn on_unsubscribe_check(&self, client_id: &str, filter: &str) -> HookResult<bool> {
        (**self).on_unsubscribe_check(client_id, filter).await
    }

    fn on_enqueue(&self, client_id: &str, publish: &Publish) -> bool {
        (**self).on_enqueue(client_id, publish)
    }

    async fn on_client_connected(&self, client_id: &str, username: Option<&str>) {
        (**self).on_client_connected(client_id, username).await;
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        (**self).on_client_disconnected(client_id, graceful).await;
    }
}

/// Chains several hook implementations
///
/// Checks pass only if every hook passes; the first publish decision other
/// than `Accept` wins. Notifications reach every hook in order.
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_authenticate(client_id, username, password).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_publish(
        &self,
        sender: Option<&str>,
        publish: &Publish,
    ) -> HookResult<PublishDecision> {
        for hooks in &self.hooks {
            match hooks.on_publish(sender, publish).await? {
                PublishDecision::Accept => {}
                decision => return Ok(decision),
            }
        }
        Ok(PublishDecision::Accept)
    }

    async fn on_subscribe_check(
        &self,
        client_id: &str,
        filter: &str,
        qos: QoS,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_subscribe_check(client_id, filter, qos).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_unsubscribe_check(&self, client_id: &str, filter: &str) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_unsubscribe_check(client_id, filter).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn on_enqueue(&self, client_id: &str, publish: &Publish) -> bool {
        self.hooks.iter().all(|h| h.on_enqueue(client_id, publish))
    }

    async fn on_client_connected(&self, client_id: &str, username: Option<&str>) {
        for hooks in &self.hooks {
            hooks.on_client_connected(client_id, username).await;
        }
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        for hooks in &self.hooks {
            hooks.on_client_disconnected(client_id, graceful).await;
        }
    }
}
