use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::process::GoneReason;

/// Failures of the shell core. Everything except `Config` and `Surface`
/// ends the application through the coordinator's shutdown path.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to launch backend {path:?}: {source}")]
    LaunchFault {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backend did not announce a port within {after:?}")]
    HandshakeTimeout { after: Duration },

    #[error("backend wrote a line longer than {limit} bytes before announcing a port")]
    HandshakeOverflow { limit: usize },

    #[error("{0}")]
    BackendExited(GoneReason),

    #[error("failed to load {url}: {reason}")]
    NavigationFault { url: String, reason: String },

    #[error("surface '{label}': {reason}")]
    Surface { label: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shell event loop is no longer running")]
    ChannelClosed,
}

impl ShellError {
    /// Whether this error must take the whole application down
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::Surface { .. })
    }
}

pub type ShellResult<T> = Result<T, ShellError>;
