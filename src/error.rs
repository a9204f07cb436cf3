use crate::sftp;
use std::{borrow::Cow, fmt, io};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("login failed{}", Diagnostic(.0))]
    LoginFailed(Option<String>),

    #[error("host not found{}", Diagnostic(.0))]
    HostNotFound(Option<String>),

    #[error("access denied{}", Diagnostic(.0))]
    AccessDenied(Option<String>),

    #[error("timed out")]
    Timeout,

    #[error("protocol error: {msg}")]
    Protocol { msg: Cow<'static, str> },

    #[error("end of file")]
    Eof,

    #[error("too many levels of symbolic links")]
    TooManyLinks,

    #[error("not on the same file system")]
    NotSameFilesystem,

    #[error("operation not supported")]
    NotSupported,

    #[error("file exists")]
    FileExists,

    #[error("invalid URI: {0}")]
    InvalidUri(String),

    #[error("errored in underlying transport I/O")]
    Io(
        #[from]
        #[source]
        io::Error,
    ),

    #[error("operation cancelled")]
    Cancelled,

    #[error("generic error{}", Diagnostic(.0))]
    Generic(Option<String>),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<Cow<'static, str>>) -> Self {
        Error::Protocol { msg: msg.into() }
    }

    /// Map an SFTP status code onto the local error taxonomy.
    ///
    /// Returns `None` for `SSH_FX_OK`.
    pub fn from_status(code: u32, message: &str) -> Option<Self> {
        let message = if message.is_empty() {
            None
        } else {
            Some(message.to_owned())
        };
        let err = match code {
            sftp::SSH_FX_OK => return None,
            sftp::SSH_FX_EOF => Error::Eof,
            sftp::SSH_FX_NO_SUCH_FILE => Error::NotFound,
            sftp::SSH_FX_PERMISSION_DENIED => Error::PermissionDenied,
            sftp::SSH_FX_NO_CONNECTION => Error::LoginFailed(message),
            sftp::SSH_FX_BAD_MESSAGE => Error::protocol("server rejected a malformed message"),
            sftp::SSH_FX_CONNECTION_LOST => {
                Error::Io(io::Error::new(io::ErrorKind::ConnectionAborted, "connection lost"))
            }
            sftp::SSH_FX_OP_UNSUPPORTED => Error::NotSupported,
            _ => Error::Generic(message),
        };
        Some(err)
    }

    /// Whether the byte stream can no longer be trusted after this error.
    ///
    /// A connection that produced a fatal error is dropped instead of
    /// being handed to the next caller.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Protocol { .. } => true,
            // rejected before anything was sent.
            Error::Io(err) => err.kind() != io::ErrorKind::InvalidInput,
            _ => false,
        }
    }
}

struct Diagnostic<'a>(&'a Option<String>);

impl fmt::Display for Diagnostic<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(text) => write!(f, ": {}", text),
            None => Ok(()),
        }
    }
}
