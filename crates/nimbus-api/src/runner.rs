//! Transport abstraction for pluggable API runners.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ApiError;

/// A single API action to execute: `app/action` plus form parameters and
/// an optional file part.
#[derive(Debug, Clone)]
pub struct ActionInput {
    /// The server app to invoke, e.g. `files`.
    pub app: &'static str,
    /// The action within the app, e.g. `getfolder`.
    pub action: &'static str,
    /// Form-style parameters, sent in order.
    pub params: Vec<(String, String)>,
    /// Optional file body sent as a multipart part.
    pub file: Option<FilePart>,
    /// Whether the call may be transparently retried by the transport.
    ///
    /// Only reads and naturally idempotent mutations set this; the
    /// transport additionally requires steady state before retrying.
    pub idempotent: bool,
}

impl ActionInput {
    /// A parameter-less action.
    #[must_use]
    pub fn new(app: &'static str, action: &'static str) -> Self {
        Self {
            app,
            action,
            params: Vec::new(),
            file: None,
            idempotent: false,
        }
    }

    /// Append a form parameter.
    #[must_use]
    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.push((key.to_owned(), value.into()));
        self
    }

    /// Attach a file body.
    #[must_use]
    pub fn file(mut self, param: &'static str, name: impl Into<String>, data: Bytes) -> Self {
        self.file = Some(FilePart {
            param,
            name: name.into(),
            data,
        });
        self
    }

    /// Mark the action safe to retry.
    #[must_use]
    pub fn retryable(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

/// A file body attached to an [`ActionInput`].
#[derive(Debug, Clone)]
pub struct FilePart {
    /// The multipart parameter name the server expects.
    pub param: &'static str,
    /// The file name reported to the server.
    pub name: String,
    /// The raw bytes.
    pub data: Bytes,
}

/// Trait for pluggable API transports.
///
/// A runner executes exactly one action and hands back raw response
/// bytes; it knows nothing about the JSON envelope or authentication.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Execute an action and return the raw response body.
    async fn run_action(&self, input: ActionInput) -> Result<Bytes, ApiError>;

    /// Execute an action whose response is a raw byte stream rather than
    /// a JSON envelope (ranged downloads).
    async fn run_download(&self, input: ActionInput) -> Result<Bytes, ApiError>;

    /// Human-readable name of the endpoint this runner talks to.
    fn hostname(&self) -> String;

    /// Whether this transport requires an authenticated session.
    ///
    /// The local CLI transport runs with the invoking user's ambient
    /// credentials and returns false.
    fn requires_session(&self) -> bool {
        true
    }

    /// Enable or disable transparent retries of idempotent actions.
    ///
    /// Disabled during the initial handshake; the daemon enables it once
    /// it reaches steady state.
    fn set_retry(&self, enabled: bool);
}
