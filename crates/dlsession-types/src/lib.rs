//! Shared types for dlsession
//!
//! This crate contains the plain data structures shared by the core
//! session engine and the CLI host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Session Types
// ============================================================================

/// State of a download session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Requesting,
    Streaming,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    /// True once one of the three terminal outcomes has been reached
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// True while a transport and a writer are owned by the session
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Requesting | SessionState::Streaming | SessionState::Cancelling
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Requesting => "requesting",
            SessionState::Streaming => "streaming",
            SessionState::Cancelling => "cancelling",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Declared size of the resource. Unknown is a distinct value, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<u64>", into = "Option<u64>")]
pub enum ByteTotal {
    Known(u64),
    #[default]
    Unknown,
}

impl ByteTotal {
    pub fn as_option(self) -> Option<u64> {
        match self {
            ByteTotal::Known(total) => Some(total),
            ByteTotal::Unknown => None,
        }
    }

    pub fn is_known(self) -> bool {
        matches!(self, ByteTotal::Known(_))
    }
}

impl From<Option<u64>> for ByteTotal {
    fn from(value: Option<u64>) -> Self {
        value.map(ByteTotal::Known).unwrap_or(ByteTotal::Unknown)
    }
}

impl From<ByteTotal> for Option<u64> {
    fn from(value: ByteTotal) -> Self {
        value.as_option()
    }
}

/// Username/password pair returned by a credential prompt
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// An empty username is treated the same as a refusal
    pub fn is_empty(&self) -> bool {
        self.username.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Transport Failure Types
// ============================================================================

/// Classified transport-level error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorCode {
    ConnectionRefused,
    HostNotFound,
    Timeout,
    TlsHandshake,
    TooManyRedirects,
    AuthenticationRequired,
    HttpStatus(u16),
    Protocol,
    Other,
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorCode::ConnectionRefused => f.write_str("connection refused"),
            TransportErrorCode::HostNotFound => f.write_str("host not found"),
            TransportErrorCode::Timeout => f.write_str("timed out"),
            TransportErrorCode::TlsHandshake => f.write_str("TLS handshake failed"),
            TransportErrorCode::TooManyRedirects => f.write_str("too many redirects"),
            TransportErrorCode::AuthenticationRequired => f.write_str("authentication required"),
            TransportErrorCode::HttpStatus(status) => write!(f, "HTTP {}", status),
            TransportErrorCode::Protocol => f.write_str("protocol error"),
            TransportErrorCode::Other => f.write_str("transport error"),
        }
    }
}

/// A transport error with its code and the transport's own description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportFailure {
    pub code: TransportErrorCode,
    pub description: String,
}

impl TransportFailure {
    pub fn new(code: TransportErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.description)
        }
    }
}

/// Kind of TLS problem reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsWarningCode {
    /// Validation is switched off for this transport
    CertificateNotVerified,
    InvalidCertificate,
    HandshakeFailed,
}

/// Non-fatal TLS report; the transport decides whether to continue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsWarning {
    pub code: TlsWarningCode,
    pub description: String,
}

impl fmt::Display for TlsWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.description)
    }
}

// ============================================================================
// Outcome Types
// ============================================================================

/// Why a session failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DestinationUnavailable,
    OverwriteDeclined,
    Transport,
    Io,
    Integrity,
}

/// Terminal outcome of a session, reported exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Outcome {
    Completed { path: PathBuf, bytes: u64 },
    Failed { kind: FailureKind, reason: String },
    Cancelled,
}

impl Outcome {
    pub fn state(&self) -> SessionState {
        match self {
            Outcome::Completed { .. } => SessionState::Completed,
            Outcome::Failed { .. } => SessionState::Failed,
            Outcome::Cancelled => SessionState::Cancelled,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed { .. })
    }
}

/// Snapshot of a session, suitable for printing once it is over
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub url: String,
    pub file_name: String,
    pub state: SessionState,
    pub bytes_received: u64,
    pub bytes_total: ByteTotal,
    pub tls_warnings: Vec<TlsWarning>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<Outcome>,
}

// ============================================================================
// Settings Types
// ============================================================================

/// What to do when the artifact name already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    /// Ask the host for consent
    #[default]
    Ask,
    Always,
    Never,
}

impl FromStr for OverwritePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ask" => Ok(OverwritePolicy::Ask),
            "always" | "yes" => Ok(OverwritePolicy::Always),
            "never" | "no" => Ok(OverwritePolicy::Never),
            other => Err(format!("Invalid overwrite policy: {}", other)),
        }
    }
}

impl fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OverwritePolicy::Ask => "ask",
            OverwritePolicy::Always => "always",
            OverwritePolicy::Never => "never",
        };
        f.write_str(name)
    }
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory the artifact is written to
    pub download_dir: PathBuf,
    pub overwrite: OverwritePolicy,
    pub connect_timeout_secs: u64,
    /// Idle time allowed between body reads
    pub read_timeout_secs: u64,
    /// Whole-session deadline; expiry cancels the session
    pub timeout_secs: Option<u64>,
    pub user_agent: String,
    pub max_redirects: usize,
    /// Disables certificate validation (reported as a TLS warning)
    pub accept_invalid_certs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            overwrite: OverwritePolicy::Ask,
            connect_timeout_secs: 30,
            read_timeout_secs: 120,
            timeout_secs: None,
            user_agent: format!("dlsession/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 10,
            accept_invalid_certs: false,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events published to asynchronous hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SessionEvent {
    StatusChanged {
        id: Uuid,
        text: String,
    },
    Progress {
        id: Uuid,
        received: u64,
        total: Option<u64>,
    },
    Terminal {
        id: Uuid,
        outcome: Outcome,
    },
}
