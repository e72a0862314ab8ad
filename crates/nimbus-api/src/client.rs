//! Typed API client: session auth, envelope parsing, one method per action.

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::models::{
    AccountLimits, FileRecord, FilesystemRecord, FolderListing, FolderRecord, ServerConfig,
    SessionRecord, StorageRecord,
};
use crate::runner::{ActionInput, Runner};

/// The object-storage operations the filesystem core depends on.
///
/// [`ApiClient`] implements this for any transport; tests implement it
/// over an in-memory store.
#[async_trait]
pub trait ObjectApi: Send + Sync {
    /// `server/getconfig`.
    async fn server_config(&self) -> Result<ServerConfig, ApiError>;
    /// `files/getlimits`.
    async fn account_limits(&self) -> Result<AccountLimits, ApiError>;
    /// `files/getconfig` for one filesystem.
    async fn storage_config(&self, fs_id: &str) -> Result<StorageRecord, ApiError>;
    /// `files/getfilesystems`.
    async fn filesystems(&self) -> Result<Vec<FilesystemRecord>, ApiError>;
    /// `files/listadopted`: items shared to this account.
    async fn list_adopted(&self) -> Result<FolderListing, ApiError>;
    /// `files/getfolder`: list a folder's contents.
    async fn get_folder(&self, id: &str) -> Result<FolderListing, ApiError>;
    /// `files/createfolder`.
    async fn create_folder(&self, parent: &str, name: &str) -> Result<FolderRecord, ApiError>;
    /// `files/createfile`: create an empty file.
    async fn create_file(&self, parent: &str, name: &str) -> Result<FileRecord, ApiError>;
    /// `files/upload`: create a file with an inline body.
    async fn upload(
        &self,
        parent: &str,
        name: &str,
        data: Bytes,
        overwrite: bool,
    ) -> Result<FileRecord, ApiError>;
    /// `files/writefile`: write bytes at an offset of an existing file.
    async fn write_file(&self, id: &str, offset: u64, data: Bytes) -> Result<FileRecord, ApiError>;
    /// `files/ftruncate`.
    async fn truncate_file(&self, id: &str, size: u64) -> Result<(), ApiError>;
    /// `files/download` with an inclusive byte range.
    async fn download(&self, id: &str, fstart: u64, flast: u64) -> Result<Bytes, ApiError>;
    /// `files/renamefile`.
    async fn rename_file(&self, id: &str, name: &str, overwrite: bool) -> Result<(), ApiError>;
    /// `files/renamefolder`.
    async fn rename_folder(&self, id: &str, name: &str, overwrite: bool) -> Result<(), ApiError>;
    /// `files/movefile`.
    async fn move_file(&self, id: &str, parent: &str, overwrite: bool) -> Result<(), ApiError>;
    /// `files/movefolder`.
    async fn move_folder(&self, id: &str, parent: &str, overwrite: bool) -> Result<(), ApiError>;
    /// `files/deletefile`.
    async fn delete_file(&self, id: &str) -> Result<(), ApiError>;
    /// `files/deletefolder`.
    async fn delete_folder(&self, id: &str) -> Result<(), ApiError>;
}

#[derive(Default)]
struct SessionState {
    username: String,
    account_id: String,
    session_id: String,
    session_key: String,
    created_session: bool,
}

/// API client over a [`Runner`] transport.
///
/// Attaches session parameters to every call, parses the JSON envelope
/// and maps non-ok responses through [`ApiError::from_envelope`].
pub struct ApiClient<R: Runner> {
    runner: R,
    session: Mutex<SessionState>,
}

impl<R: Runner> ApiClient<R> {
    /// Wrap a transport.
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            session: Mutex::new(SessionState::default()),
        }
    }

    /// Human-readable endpoint name, optionally with the signed-in user.
    #[must_use]
    pub fn name(&self) -> String {
        let hostname = self.runner.hostname();
        let session = self.session.lock().expect("session lock");
        if session.username.is_empty() {
            hostname
        } else {
            format!("{} on {hostname}", session.username)
        }
    }

    /// Whether this transport needs `authenticate` before file calls.
    #[must_use]
    pub fn requires_session(&self) -> bool {
        self.runner.requires_session()
    }

    /// Enable transparent retries; called once the daemon reaches steady
    /// state (never during the handshake).
    pub fn enable_retry(&self) {
        self.runner.set_retry(true);
    }

    fn finalize(&self, mut input: ActionInput) -> ActionInput {
        let session = self.session.lock().expect("session lock");
        if !session.session_id.is_empty() {
            input = input
                .param("auth_sessionid", session.session_id.clone())
                .param("auth_sessionkey", session.session_key.clone());
        } else if !session.username.is_empty() {
            input = input.param("auth_sudouser", session.username.clone());
        }
        input
    }

    fn parse_envelope(body: &[u8]) -> Result<Value, ApiError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| ApiError::Json(e.to_string()))?;

        let ok = value
            .get("ok")
            .and_then(Value::as_bool)
            .ok_or_else(|| ApiError::Json("envelope missing 'ok'".to_owned()))?;

        if ok {
            value
                .get("appdata")
                .cloned()
                .ok_or_else(|| ApiError::Json("envelope missing 'appdata'".to_owned()))
        } else {
            let code = value.get("code").and_then(Value::as_u64).unwrap_or(0);
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Err(ApiError::from_envelope(
                u16::try_from(code).unwrap_or(0),
                message,
            ))
        }
    }

    async fn invoke(&self, input: ActionInput) -> Result<Value, ApiError> {
        let body = self.runner.run_action(self.finalize(input)).await?;
        Self::parse_envelope(&body)
    }

    async fn invoke_typed<T: DeserializeOwned>(&self, input: ActionInput) -> Result<T, ApiError> {
        let appdata = self.invoke(input).await?;
        serde_json::from_value(appdata).map_err(|e| ApiError::Json(e.to_string()))
    }

    /// Authenticate with username and password, creating a session.
    ///
    /// # Errors
    /// [`ApiError::TwoFactor`] if the account needs a code and none was
    /// given; [`ApiError::AuthFailed`] on bad credentials.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        twofactor: Option<&str>,
    ) -> Result<SessionRecord, ApiError> {
        info!(username, "creating session");

        self.close_session().await?;

        let mut input = ActionInput::new("accounts", "createsession")
            .param("username", username)
            .param("auth_password", password);
        if let Some(code) = twofactor {
            input = input.param("auth_twofactor", code);
        }

        let resp = self.invoke(input).await?;

        let record = SessionRecord {
            account_id: json_str(&resp, &["account", "id"])?,
            session_id: json_str(&resp, &["client", "session", "id"])?,
            session_key: json_str(&resp, &["client", "session", "authkey"])?,
        };

        let mut session = self.session.lock().expect("session lock");
        session.username = username.to_owned();
        session.account_id = record.account_id.clone();
        session.session_id = record.session_id.clone();
        session.session_key = record.session_key.clone();
        session.created_session = true;

        Ok(record)
    }

    /// Adopt an existing session (`accounts/getaccount` verifies it).
    pub async fn pre_authenticate(
        &self,
        session_id: &str,
        session_key: &str,
    ) -> Result<(), ApiError> {
        self.close_session().await?;

        {
            let mut session = self.session.lock().expect("session lock");
            session.session_id = session_id.to_owned();
            session.session_key = session_key.to_owned();
        }

        let resp = self.invoke(ActionInput::new("accounts", "getaccount")).await?;

        let mut session = self.session.lock().expect("session lock");
        session.account_id = json_str(&resp, &["id"])?;
        session.username = json_str(&resp, &["username"])?;
        Ok(())
    }

    /// `files/getfilesystem`: fetch one filesystem by id.
    pub async fn filesystem(&self, id: &str) -> Result<FilesystemRecord, ApiError> {
        self.invoke_typed(
            ActionInput::new("files", "getfilesystem")
                .param("filesystem", id)
                .retryable(),
        )
        .await
    }

    /// Tear down a session this client created (`accounts/deleteclient`).
    pub async fn close_session(&self) -> Result<(), ApiError> {
        let created = {
            let session = self.session.lock().expect("session lock");
            session.created_session
        };

        if created {
            debug!("deleting session client");
            self.invoke(ActionInput::new("accounts", "deleteclient"))
                .await?;
        }

        *self.session.lock().expect("session lock") = SessionState::default();
        Ok(())
    }
}

fn json_str(value: &Value, path: &[&str]) -> Result<String, ApiError> {
    let mut cur = value;
    for key in path {
        cur = cur
            .get(key)
            .ok_or_else(|| ApiError::Json(format!("missing field '{}'", path.join("."))))?;
    }
    cur.as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| ApiError::Json(format!("field '{}' is not a string", path.join("."))))
}

#[async_trait]
impl<R: Runner> ObjectApi for ApiClient<R> {
    async fn server_config(&self) -> Result<ServerConfig, ApiError> {
        self.invoke_typed(ActionInput::new("server", "getconfig").retryable())
            .await
    }

    async fn account_limits(&self) -> Result<AccountLimits, ApiError> {
        self.invoke_typed(ActionInput::new("files", "getlimits").retryable())
            .await
    }

    async fn storage_config(&self, fs_id: &str) -> Result<StorageRecord, ApiError> {
        self.invoke_typed(
            ActionInput::new("files", "getconfig")
                .param("filesystem", fs_id)
                .retryable(),
        )
        .await
    }

    async fn filesystems(&self) -> Result<Vec<FilesystemRecord>, ApiError> {
        self.invoke_typed(ActionInput::new("files", "getfilesystems").retryable())
            .await
    }

    async fn list_adopted(&self) -> Result<FolderListing, ApiError> {
        self.invoke_typed(ActionInput::new("files", "listadopted").retryable())
            .await
    }

    async fn get_folder(&self, id: &str) -> Result<FolderListing, ApiError> {
        self.invoke_typed(
            ActionInput::new("files", "getfolder")
                .param("folder", id)
                .retryable(),
        )
        .await
    }

    async fn create_folder(&self, parent: &str, name: &str) -> Result<FolderRecord, ApiError> {
        self.invoke_typed(
            ActionInput::new("files", "createfolder")
                .param("parent", parent)
                .param("name", name),
        )
        .await
    }

    async fn create_file(&self, parent: &str, name: &str) -> Result<FileRecord, ApiError> {
        self.invoke_typed(
            ActionInput::new("files", "createfile")
                .param("parent", parent)
                .param("name", name),
        )
        .await
    }

    async fn upload(
        &self,
        parent: &str,
        name: &str,
        data: Bytes,
        overwrite: bool,
    ) -> Result<FileRecord, ApiError> {
        self.invoke_typed(
            ActionInput::new("files", "upload")
                .param("parent", parent)
                .param("overwrite", if overwrite { "true" } else { "false" })
                .file("file", name, data),
        )
        .await
    }

    async fn write_file(&self, id: &str, offset: u64, data: Bytes) -> Result<FileRecord, ApiError> {
        self.invoke_typed(
            ActionInput::new("files", "writefile")
                .param("file", id)
                .param("offset", offset.to_string())
                .file("data", "data", data),
        )
        .await
    }

    async fn truncate_file(&self, id: &str, size: u64) -> Result<(), ApiError> {
        self.invoke(
            ActionInput::new("files", "ftruncate")
                .param("file", id)
                .param("size", size.to_string())
                .retryable(),
        )
        .await
        .map(|_| ())
    }

    async fn download(&self, id: &str, fstart: u64, flast: u64) -> Result<Bytes, ApiError> {
        let input = self.finalize(
            ActionInput::new("files", "download")
                .param("file", id)
                .param("fstart", fstart.to_string())
                .param("flast", flast.to_string())
                .retryable(),
        );

        let body = self.runner.run_download(input).await?;

        // Error responses arrive as a JSON envelope instead of raw bytes.
        if body.first() == Some(&b'{') {
            if let Ok(value) = serde_json::from_slice::<Value>(&body) {
                if value.get("ok").and_then(Value::as_bool) == Some(false) {
                    let code = value.get("code").and_then(Value::as_u64).unwrap_or(0);
                    let message = value
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    return Err(ApiError::from_envelope(
                        u16::try_from(code).unwrap_or(0),
                        message,
                    ));
                }
            }
        }

        Ok(body)
    }

    async fn rename_file(&self, id: &str, name: &str, overwrite: bool) -> Result<(), ApiError> {
        self.invoke(
            ActionInput::new("files", "renamefile")
                .param("file", id)
                .param("name", name)
                .param("overwrite", if overwrite { "true" } else { "false" }),
        )
        .await
        .map(|_| ())
    }

    async fn rename_folder(&self, id: &str, name: &str, overwrite: bool) -> Result<(), ApiError> {
        self.invoke(
            ActionInput::new("files", "renamefolder")
                .param("folder", id)
                .param("name", name)
                .param("overwrite", if overwrite { "true" } else { "false" }),
        )
        .await
        .map(|_| ())
    }

    async fn move_file(&self, id: &str, parent: &str, overwrite: bool) -> Result<(), ApiError> {
        self.invoke(
            ActionInput::new("files", "movefile")
                .param("file", id)
                .param("parent", parent)
                .param("overwrite", if overwrite { "true" } else { "false" }),
        )
        .await
        .map(|_| ())
    }

    async fn move_folder(&self, id: &str, parent: &str, overwrite: bool) -> Result<(), ApiError> {
        self.invoke(
            ActionInput::new("files", "movefolder")
                .param("folder", id)
                .param("parent", parent)
                .param("overwrite", if overwrite { "true" } else { "false" }),
        )
        .await
        .map(|_| ())
    }

    async fn delete_file(&self, id: &str) -> Result<(), ApiError> {
        self.invoke(
            ActionInput::new("files", "deletefile")
                .param("file", id)
                .retryable(),
        )
        .await
        .map(|_| ())
    }

    async fn delete_folder(&self, id: &str) -> Result<(), ApiError> {
        self.invoke(
            ActionInput::new("files", "deletefolder")
                .param("folder", id)
                .retryable(),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoRunner {
        body: &'static str,
    }

    #[async_trait]
    impl Runner for EchoRunner {
        async fn run_action(&self, _input: ActionInput) -> Result<Bytes, ApiError> {
            Ok(Bytes::from_static(self.body.as_bytes()))
        }

        async fn run_download(&self, _input: ActionInput) -> Result<Bytes, ApiError> {
            Ok(Bytes::from_static(self.body.as_bytes()))
        }

        fn hostname(&self) -> String {
            "test".to_owned()
        }

        fn set_retry(&self, _enabled: bool) {}
    }

    #[tokio::test]
    async fn ok_envelope_yields_appdata() {
        let client = ApiClient::new(EchoRunner {
            body: r#"{"ok":true,"code":0,"message":"","appdata":{"apiversion":2}}"#,
        });
        let config = client.server_config().await.expect("server config");
        assert_eq!(config.apiversion, 2);
    }

    #[tokio::test]
    async fn error_envelope_maps_through_table() {
        let client = ApiClient::new(EchoRunner {
            body: r#"{"ok":false,"code":404,"message":"UNKNOWN_FOLDER","appdata":null}"#,
        });
        let err = client.get_folder("f1").await.expect_err("should fail");
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn malformed_body_is_a_json_error() {
        let client = ApiClient::new(EchoRunner { body: "not json" });
        let err = client.get_folder("f1").await.expect_err("should fail");
        assert!(matches!(err, ApiError::Json(_)));
    }

    #[tokio::test]
    async fn download_detects_error_envelopes() {
        let client = ApiClient::new(EchoRunner {
            body: r#"{"ok":false,"code":404,"message":"UNKNOWN_FILE","appdata":null}"#,
        });
        let err = client.download("f1", 0, 10).await.expect_err("should fail");
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
