//! Rust SDK for the nimbus server API.
//!
//! The server speaks a JSON envelope over HTTP (or over a local CLI
//! invocation of the same API). Every call names an `app` and an `action`,
//! carries form-style parameters plus optional file parts, and returns
//! `{"ok": bool, "code": int, "message": string, "appdata": ...}`.
//!
//! [`runner::Runner`] is the transport seam; [`client::ApiClient`] layers
//! session auth, envelope parsing and typed calls on top of it, and
//! [`client::ObjectApi`] is the object-safe facade the filesystem core
//! consumes (and that tests mock).

mod cli_runner;
mod client;
mod error;
mod http_runner;
mod models;
mod runner;

pub use cli_runner::CliRunner;
pub use client::{ApiClient, ObjectApi};
pub use error::ApiError;
pub use http_runner::HttpRunner;
pub use models::{
    AccountLimits, FileRecord, FilesystemRecord, FolderListing, FolderRecord, ItemDates,
    ServerConfig, SessionRecord, StorageRecord,
};
pub use runner::{ActionInput, FilePart, Runner};
