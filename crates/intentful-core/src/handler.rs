// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider handler invocation.
//!
//! The reconciler hands one diff at a time to a [`HandlerInvoker`]. A
//! handler either succeeds, optionally returning a status patch, or fails
//! with a [`HandlerError`] whose message is recorded on the intent watcher.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::model::{Diff, Entity, EntityReference};

/// One handler call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerRequest {
    /// The entity being reconciled.
    pub entity_ref: EntityReference,
    /// Procedure bound to the diff's signature.
    pub procedure: String,
    /// Where the procedure is reachable, if declared.
    pub callback: Option<String>,
    /// Entity as loaded at the start of the attempt.
    pub entity: Entity,
    /// The diff to resolve.
    pub diff: Diff,
}

/// Handler failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// The handler ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The signature declares no callback to invoke.
    #[error("no callback declared for procedure '{0}'")]
    MissingCallback(String),

    /// The handler did not answer in time.
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// The handler could not be reached.
    #[error("handler transport error: {0}")]
    Transport(String),
}

/// Invokes provider handlers.
#[async_trait::async_trait]
pub trait HandlerInvoker: Send + Sync {
    /// Run the handler for `request.diff`.
    ///
    /// `Ok(Some(patch))` is a status patch to apply, `Ok(None)` means the
    /// handler wrote status itself.
    async fn invoke(&self, request: &HandlerRequest) -> Result<Option<Value>, HandlerError>;
}

/// Calls handlers over HTTP at their signature's `procedure_callback`.
///
/// The request body is `{"entity": .., "input": [diff content]}`. A 2xx JSON
/// body is the status patch; any other status is a failure whose message is
/// the body's `message` field, or the body itself.
#[derive(Debug, Clone)]
pub struct HttpHandlerInvoker {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpHandlerInvoker {
    /// Create an invoker whose calls time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, HandlerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HandlerError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait::async_trait]
impl HandlerInvoker for HttpHandlerInvoker {
    async fn invoke(&self, request: &HandlerRequest) -> Result<Option<Value>, HandlerError> {
        let url = request
            .callback
            .as_deref()
            .ok_or_else(|| HandlerError::MissingCallback(request.procedure.clone()))?;

        let body = json!({
            "entity": request.entity,
            "input": request.diff.content,
        });

        debug!(
            entity = %request.entity_ref,
            procedure = %request.procedure,
            url,
            "Invoking handler"
        );

        let response = self.client.post(url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                HandlerError::Timeout(self.timeout)
            } else {
                HandlerError::Transport(format!("request to {} failed: {}", url, e))
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                HandlerError::Timeout(self.timeout)
            } else {
                HandlerError::Transport(format!("reading response from {} failed: {}", url, e))
            }
        })?;

        if !status.is_success() {
            return Err(HandlerError::Failed(error_message(status.as_u16(), &text)));
        }
        Ok(status_patch(&text))
    }
}

/// Failure message of a non-2xx handler response.
fn error_message(status: u16, body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    match from_json {
        Some(message) => message,
        None if !body.trim().is_empty() => body.trim().to_string(),
        None => format!("handler returned HTTP {}", status),
    }
}

/// Status patch carried by a 2xx handler response.
fn status_patch(body: &str) -> Option<Value> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Null) | Err(_) => None,
        Ok(patch) => Some(patch),
    }
}
