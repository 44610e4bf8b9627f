//! Error types surfaced by the reply guard.
//!
//! The retry state machine itself has no fatal error class: everything that
//! can go wrong while supervising a conversation is recovered locally. The
//! errors here cover construction (bad tag names, unreadable config files)
//! and talking to a stopped service.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplyGuardError {
    /// A configured content tag name cannot be matched safely.
    #[error("invalid content tag name {name:?}: {reason}")]
    InvalidTag { name: String, reason: &'static str },

    /// The tag pattern failed to compile.
    #[error("failed to compile pattern for tag {name:?}: {source}")]
    TagPattern {
        name: String,
        #[source]
        source: regex_lite::Error,
    },

    /// Reading a config file from disk failed.
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A config file was readable but not valid TOML for `GuardConfig`.
    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The background service has been disposed or its task exited.
    #[error("reply guard service is no longer running")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, ReplyGuardError>;
