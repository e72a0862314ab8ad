//! HTTP transport backed by `reqwest`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::runner::{ActionInput, Runner};

/// How many times an idempotent action is retried after the first failure.
const RETRY_COUNT: u32 = 3;

/// Base delay for exponential backoff between retries.
const RETRY_BASE: Duration = Duration::from_millis(250);

/// Executes API actions against an HTTP endpoint.
///
/// Actions go out as `POST <base>/?app=<app>&action=<action>` with form
/// (or multipart, when a file part is attached) bodies. Connection-level
/// failures on idempotent actions are retried with exponential backoff,
/// but only once [`Runner::set_retry`] has enabled it — the initial
/// handshake must surface errors immediately.
pub struct HttpRunner {
    base_url: String,
    client: reqwest::Client,
    retry_enabled: AtomicBool,
}

impl HttpRunner {
    /// Create a runner for the given base URL.
    ///
    /// # Errors
    /// Returns [`ApiError::Connection`] if the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ApiError::Connection(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
            retry_enabled: AtomicBool::new(false),
        })
    }

    fn url_for(&self, input: &ActionInput) -> String {
        format!(
            "{}/?app={}&action={}",
            self.base_url, input.app, input.action
        )
    }

    fn build_request(&self, input: &ActionInput) -> reqwest::RequestBuilder {
        let req = self.client.post(self.url_for(input));

        if let Some(file) = &input.file {
            let mut form = reqwest::multipart::Form::new();
            for (key, value) in &input.params {
                form = form.text(key.clone(), value.clone());
            }
            form = form.part(
                file.param,
                reqwest::multipart::Part::bytes(file.data.to_vec()).file_name(file.name.clone()),
            );
            req.multipart(form)
        } else {
            req.form(&input.params)
        }
    }

    async fn send(&self, input: &ActionInput) -> Result<reqwest::Response, ApiError> {
        let can_retry = input.idempotent && self.retry_enabled.load(Ordering::Relaxed);
        let attempts = if can_retry { RETRY_COUNT + 1 } else { 1 };

        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = RETRY_BASE * 2u32.pow(attempt - 1);
                warn!(app = input.app, action = input.action, ?delay, "retrying action");
                tokio::time::sleep(delay).await;
            }

            match self.build_request(input).send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => last_err = Some(ApiError::Connection(e.to_string())),
            }
        }

        Err(last_err.unwrap_or_else(|| ApiError::Connection("no attempts made".to_owned())))
    }
}

#[async_trait]
impl Runner for HttpRunner {
    async fn run_action(&self, input: ActionInput) -> Result<Bytes, ApiError> {
        debug!(app = input.app, action = input.action, "run_action");

        let resp = self.send(&input).await?;
        resp.bytes()
            .await
            .map_err(|e| ApiError::Connection(e.to_string()))
    }

    async fn run_download(&self, input: ActionInput) -> Result<Bytes, ApiError> {
        debug!(app = input.app, action = input.action, "run_download");

        let resp = self.send(&input).await?;

        // Error envelopes come back as JSON even on download endpoints;
        // the client layer detects them by content type.
        resp.bytes()
            .await
            .map_err(|e| ApiError::Connection(e.to_string()))
    }

    fn hostname(&self) -> String {
        self.base_url.clone()
    }

    fn set_retry(&self, enabled: bool) {
        self.retry_enabled.store(enabled, Ordering::Relaxed);
    }
}
