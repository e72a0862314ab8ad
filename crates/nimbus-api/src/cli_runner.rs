//! Local transport that invokes the server's CLI entry point.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::ApiError;
use crate::runner::{ActionInput, Runner};

/// Executes API actions by running the server installation's CLI binary.
///
/// Used for mounts on the same host as the server (`--apipath`). The CLI
/// speaks the same `app/action` surface as HTTP; parameters become
/// `--key value` arguments and a file part is piped through stdin.
/// No session is required — the CLI runs with ambient credentials.
pub struct CliRunner {
    api_path: PathBuf,
}

impl CliRunner {
    /// Create a runner for the CLI at the given path.
    #[must_use]
    pub fn new(api_path: PathBuf) -> Self {
        Self { api_path }
    }

    async fn run(&self, input: &ActionInput) -> Result<Bytes, ApiError> {
        debug!(app = input.app, action = input.action, "cli invoke");

        let mut cmd = tokio::process::Command::new(&self.api_path);
        cmd.arg(input.app).arg(input.action);

        for (key, value) in &input.params {
            cmd.arg(format!("--{key}")).arg(value);
        }

        if let Some(file) = &input.file {
            cmd.arg(format!("--{}-", file.param)); // read part from stdin
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| ApiError::Connection(format!("cli spawn: {e}")))?;

        if let Some(file) = &input.file {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| ApiError::Connection("cli stdin unavailable".to_owned()))?;
            stdin
                .write_all(&file.data)
                .await
                .map_err(|e| ApiError::Connection(format!("cli stdin: {e}")))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ApiError::Connection(format!("cli wait: {e}")))?;

        if !output.status.success() && output.stdout.is_empty() {
            return Err(ApiError::Connection(format!(
                "cli exited with {}",
                output.status
            )));
        }

        Ok(Bytes::from(output.stdout))
    }
}

#[async_trait]
impl Runner for CliRunner {
    async fn run_action(&self, input: ActionInput) -> Result<Bytes, ApiError> {
        self.run(&input).await
    }

    async fn run_download(&self, input: ActionInput) -> Result<Bytes, ApiError> {
        self.run(&input).await
    }

    fn hostname(&self) -> String {
        self.api_path.display().to_string()
    }

    fn requires_session(&self) -> bool {
        false
    }

    fn set_retry(&self, _enabled: bool) {
        // The local CLI either works or it does not; retries would only
        // re-run the same process.
    }
}
