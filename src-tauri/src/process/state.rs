use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// State of one supervised backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SupervisorState {
    #[default]
    Starting,
    AwaitingHandshake,
    Connected,
    Reconnecting,
    Terminating,
    Failed,
}

impl SupervisorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// Where the backend can be reached. Only ever `localhost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    port: u16,
}

impl Endpoint {
    pub const HOST: &'static str = "localhost";

    pub fn new(port: u16) -> Option<Self> {
        (port > 0).then_some(Self { port })
    }

    pub fn host(&self) -> &'static str {
        Self::HOST
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Root location the surfaces load
    pub fn url(&self) -> String {
        format!("http://{}:{}/", Self::HOST, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", Self::HOST, self.port)
    }
}

/// Why the backend is gone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoneReason {
    /// Exited before any port was announced
    NeverStarted { code: Option<i32> },
    /// Exited after the shell had connected to it
    ConnectionLost { port: u16, code: Option<i32> },
}

impl GoneReason {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::NeverStarted { code } | Self::ConnectionLost { code, .. } => *code,
        }
    }
}

impl fmt::Display for GoneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self.code() {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        match self {
            Self::NeverStarted { .. } => {
                write!(f, "backend never started: exited before announcing a port ({})", code)
            }
            Self::ConnectionLost { port, .. } => {
                write!(f, "lost connection to backend on port {} ({})", port, code)
            }
        }
    }
}

/// Read-only view of the endpoint the supervisor currently serves.
/// Empty until the current process instance is connected.
#[derive(Debug, Clone, Default)]
pub struct EndpointView(Arc<RwLock<Option<Endpoint>>>);

impl EndpointView {
    pub fn current(&self) -> Option<Endpoint> {
        *self.0.read()
    }
}

/// Write side of `EndpointView`, held only by the supervisor
#[derive(Debug, Default)]
pub(crate) struct EndpointSlot(Arc<RwLock<Option<Endpoint>>>);

impl EndpointSlot {
    pub(crate) fn publish(&self, endpoint: Endpoint) {
        *self.0.write() = Some(endpoint);
    }

    pub(crate) fn withdraw(&self) {
        *self.0.write() = None;
    }

    pub(crate) fn view(&self) -> EndpointView {
        EndpointView(self.0.clone())
    }
}
