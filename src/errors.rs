use thiserror::Error;

/// Codes after which the session id is dropped and the request retried once.
pub const SESSION_CODES: &[&str] = &["WRONG_IP", "STIMEOUT", "BAD_SID", "WRONG_SID", "NO_SUCH_SESSION"];

/// Codes returned by the login endpoint for bad credentials or subscriptions.
pub const LOGIN_CODES: &[&str] = &["ACC_WRONG", "ACC_EMPTY", "ACC_NOSUB", "EMPTY_SUB"];

/// Login codes that mean the credentials are fine but nothing is paid for.
const SUBSCRIPTION_CODES: &[&str] = &["ACC_NOSUB", "EMPTY_SUB"];

/// Failure reported by an [`HttpTransport`](crate::transport::HttpTransport).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    /// DNS lookup or TCP/TLS connect failed
    #[error("No internet connection ({0})")]
    Connect(String),

    /// Request timed out in the transport
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Server answered with a non-2xx status
    #[error("Server returned {status}: {reason}")]
    Status { status: u16, reason: String },

    /// Writing a downloaded body failed
    #[error("I/O error: {0}")]
    Io(String),

    /// The request was dropped before it completed
    #[error("Request cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Other(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Error type for every remote operation in the crate.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Response body was not JSON or lacked expected fields
    #[error("Failed to parse response: {0}")]
    Decode(String),

    /// Server-side `{"error": {"code", "message"}}`
    #[error("{message} ({code})")]
    Application { code: String, message: String },

    /// The channel lineup came back without any channel
    #[error("Empty channels list, please retry later.")]
    EmptyLineup,

    /// Request could not be built (bad base URL, artwork URL without a file name)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The pending operation was abandoned before it resolved
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Decode(e.to_string())
    }
}

/// Coarse classification callers use to pick what to tell the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    Credentials,
    SubscriptionExpired,
    /// Session expired or similar; trying again is expected to work
    Transient,
    Malformed,
    Application,
    Cancelled,
}

impl ApiError {
    pub fn application(code: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Application {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Machine readable server code, if this is an application error.
    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Application { code, .. } => Some(code),
            _ => None,
        }
    }

    /// True for the codes that invalidate the current session.
    pub fn is_session_invalid(&self) -> bool {
        self.code().is_some_and(|c| SESSION_CODES.contains(&c))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ApiError::Cancelled | ApiError::Transport(TransportError::Cancelled)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Transport(TransportError::Cancelled) | ApiError::Cancelled => {
                ErrorKind::Cancelled
            }
            ApiError::Transport(TransportError::Status { status, .. }) if *status >= 500 => {
                ErrorKind::Transient
            }
            ApiError::Transport(TransportError::Timeout(_)) => ErrorKind::Transient,
            ApiError::Transport(_) => ErrorKind::Connectivity,
            ApiError::Decode(_) => ErrorKind::Malformed,
            ApiError::Application { code, .. } => {
                if SUBSCRIPTION_CODES.contains(&code.as_str()) {
                    ErrorKind::SubscriptionExpired
                } else if LOGIN_CODES.contains(&code.as_str()) {
                    ErrorKind::Credentials
                } else if SESSION_CODES.contains(&code.as_str()) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Application
                }
            }
            ApiError::EmptyLineup => ErrorKind::Transient,
            ApiError::InvalidRequest(_) => ErrorKind::Application,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Connectivity)
    }

    /// Short text suitable for a status line.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Connectivity => {
                "Unable to reach the server. Please check your internet connection.".to_string()
            }
            ErrorKind::Credentials => "Username or password is incorrect.".to_string(),
            ErrorKind::SubscriptionExpired => {
                "No active subscription on this account.".to_string()
            }
            ErrorKind::Transient => "The server is busy. Please try again.".to_string(),
            ErrorKind::Malformed => {
                "Server response is invalid. This may be a provider issue.".to_string()
            }
            ErrorKind::Application | ErrorKind::Cancelled => self.to_string(),
        }
    }
}
