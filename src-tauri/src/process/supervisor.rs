use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::state::{Endpoint, EndpointSlot, EndpointView, GoneReason, SupervisorState};
use crate::error::{ShellError, ShellResult};
use crate::handshake::{HandshakeScanner, HANDSHAKE_SETTLE};
use crate::relay::{LogRelay, OutputStream, RecentLines};

/// Signals the supervisor raises towards the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The current process announced its port
    Ready(Endpoint),
    /// The current process exited
    Gone(GoneReason),
}

/// Connection state machine for the backend process.
///
/// The supervisor does no I/O of its own: the coordinator feeds it spawn
/// results, output chunks and exits in arrival order, and acts on the
/// events it returns.
pub struct Supervisor {
    state: SupervisorState,
    history: Vec<SupervisorState>,
    discovered: Option<Endpoint>,
    slot: EndpointSlot,
    scanner: HandshakeScanner,
    relay: LogRelay,
    handshake_timeout: Duration,
    deadline: Option<Instant>,
    settle_at: Option<Instant>,
    connected_this_instance: bool,
    pid: Option<u32>,
}

impl Supervisor {
    pub fn new(relay: LogRelay, handshake_timeout: Duration, max_handshake_line: usize) -> Self {
        Self {
            state: SupervisorState::Starting,
            history: vec![SupervisorState::Starting],
            discovered: None,
            slot: EndpointSlot::default(),
            scanner: HandshakeScanner::new(max_handshake_line),
            relay,
            handshake_timeout,
            deadline: None,
            settle_at: None,
            connected_this_instance: false,
            pid: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Every state entered so far, in order
    pub fn history(&self) -> &[SupervisorState] {
        &self.history
    }

    /// Last endpoint discovered by any handshake
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.discovered
    }

    /// Endpoint surfaces may be navigated to right now
    pub fn navigable_endpoint(&self) -> Option<Endpoint> {
        if self.state == SupervisorState::Connected {
            self.discovered
        } else {
            None
        }
    }

    pub fn endpoint_view(&self) -> EndpointView {
        self.slot.view()
    }

    pub fn recent_output(&self) -> RecentLines {
        self.relay.recent()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// When the handshake wait gives up, while one is pending
    pub fn handshake_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// When a held `port=<digits>` at the end of the output is taken as final
    pub fn settle_deadline(&self) -> Option<Instant> {
        self.settle_at
    }

    fn transition(&mut self, next: SupervisorState) {
        if self.state == next {
            return;
        }
        debug!("Supervisor state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// The OS accepted the spawn; start waiting for the handshake
    pub fn on_spawned(&mut self, pid: Option<u32>) {
        if self.state == SupervisorState::Reconnecting {
            self.transition(SupervisorState::Starting);
        }
        self.pid = pid;
        self.connected_this_instance = false;
        self.scanner.reset();
        self.settle_at = None;
        self.deadline = Some(Instant::now() + self.handshake_timeout);
        self.relay.note(&format!("backend started (pid {:?})", pid));
        info!("Backend spawned with PID {:?}, awaiting handshake", pid);
        self.transition(SupervisorState::AwaitingHandshake);
    }

    /// The spawn itself failed; there is nothing to supervise
    pub fn on_launch_failed(&mut self, err: &ShellError) {
        error!("Backend launch failed: {}", err);
        self.deadline = None;
        self.settle_at = None;
        self.transition(SupervisorState::Failed);
    }

    /// Handles one stdout chunk. Every chunk is relayed; only while awaiting
    /// the handshake is it scanned, and the first announced port is final.
    pub fn on_output_chunk(&mut self, chunk: &[u8]) -> ShellResult<Option<SupervisorEvent>> {
        self.relay.relay(OutputStream::Stdout, chunk);

        if self.state != SupervisorState::AwaitingHandshake {
            return Ok(None);
        }

        match self.scanner.feed(chunk) {
            Ok(Some(port)) => Ok(self.connect(port)),
            Ok(None) => {
                self.settle_at = self
                    .scanner
                    .awaiting_digits()
                    .then(|| Instant::now() + HANDSHAKE_SETTLE);
                Ok(None)
            }
            Err(e) => {
                self.deadline = None;
                self.settle_at = None;
                self.transition(SupervisorState::Failed);
                Err(e)
            }
        }
    }

    /// Stdout stayed quiet past the settle deadline. A port announced at the
    /// very end of the output is taken as complete.
    pub fn on_output_settled(&mut self) -> Option<SupervisorEvent> {
        self.settle_at = None;
        if self.state != SupervisorState::AwaitingHandshake {
            return None;
        }
        let port = self.scanner.settle()?;
        self.connect(port)
    }

    /// Stdout reached end of file. Nothing more can follow a held port.
    pub fn on_output_closed(&mut self) -> Option<SupervisorEvent> {
        debug!("Backend closed its standard output");
        self.on_output_settled()
    }

    fn connect(&mut self, port: u16) -> Option<SupervisorEvent> {
        // the scanner never yields 0
        let endpoint = Endpoint::new(port)?;
        info!("Backend handshake complete, listening on {}", endpoint);
        self.discovered = Some(endpoint);
        self.slot.publish(endpoint);
        self.deadline = None;
        self.settle_at = None;
        self.connected_this_instance = true;
        self.transition(SupervisorState::Connected);
        Some(SupervisorEvent::Ready(endpoint))
    }

    /// Stderr is relayed only, never scanned
    pub fn on_error_chunk(&mut self, chunk: &[u8]) {
        self.relay.relay(OutputStream::Stderr, chunk);
    }

    /// The process exited, whatever state we were in. A supervisor that has
    /// already failed stays `Failed`.
    pub fn on_exit(&mut self, code: Option<i32>) -> SupervisorEvent {
        self.relay.flush();
        self.relay.note(&format!("backend exited ({:?})", code));
        self.deadline = None;
        self.settle_at = None;
        self.slot.withdraw();

        let reason = match (self.connected_this_instance, self.discovered) {
            (true, Some(endpoint)) => GoneReason::ConnectionLost {
                port: endpoint.port(),
                code,
            },
            _ => GoneReason::NeverStarted { code },
        };
        if self.state == SupervisorState::Terminating || self.state.is_terminal() {
            info!("Backend stopped: {}", reason);
        } else {
            warn!("{}", reason);
        }

        if !self.state.is_terminal() {
            self.transition(SupervisorState::Terminating);
            self.transition(SupervisorState::Failed);
        }
        self.pid = None;
        SupervisorEvent::Gone(reason)
    }

    /// The handshake deadline passed
    pub fn on_handshake_timeout(&mut self) -> ShellError {
        self.deadline = None;
        self.settle_at = None;
        self.relay.flush();
        error!(
            "Backend did not announce a port within {:?}",
            self.handshake_timeout
        );
        self.transition(SupervisorState::Failed);
        ShellError::HandshakeTimeout {
            after: self.handshake_timeout,
        }
    }

    /// A kill was requested as part of shutdown
    pub fn on_terminating(&mut self) {
        if !self.state.is_terminal() {
            self.deadline = None;
            self.settle_at = None;
            self.slot.withdraw();
            self.transition(SupervisorState::Terminating);
        }
    }

    /// The current process is being replaced through an explicit respawn.
    /// Surfaces stay where they are until the new instance connects.
    pub fn on_reconnecting(&mut self) {
        self.deadline = None;
        self.settle_at = None;
        self.slot.withdraw();
        self.relay.flush();
        self.transition(SupervisorState::Reconnecting);
    }

    pub fn flush_output(&mut self) {
        self.relay.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::LogRelay;

    fn supervisor() -> Supervisor {
        Supervisor::new(LogRelay::in_memory(50), Duration::from_secs(5), 1024)
    }

    #[tokio::test]
    async fn test_handshake_reaches_connected() {
        let mut sup = supervisor();
        sup.on_spawned(Some(42));
        assert!(sup.handshake_deadline().is_some());
        assert_eq!(sup.on_output_chunk(b"starting...\n").unwrap(), None);
        let event = sup.on_output_chunk(b"port=9921\n").unwrap();

        let endpoint = Endpoint::new(9921).unwrap();
        assert_eq!(event, Some(SupervisorEvent::Ready(endpoint)));
        assert_eq!(
            sup.history(),
            &[
                SupervisorState::Starting,
                SupervisorState::AwaitingHandshake,
                SupervisorState::Connected
            ]
        );
        assert_eq!(sup.navigable_endpoint(), Some(endpoint));
        assert_eq!(sup.endpoint_view().current(), Some(endpoint));
        assert!(sup.handshake_deadline().is_none());
    }

    #[tokio::test]
    async fn test_first_port_wins() {
        let mut sup = supervisor();
        sup.on_spawned(None);
        sup.on_output_chunk(b"port=1000\n").unwrap();
        assert_eq!(sup.on_output_chunk(b"port=2000\n").unwrap(), None);
        assert_eq!(sup.endpoint().map(|e| e.port()), Some(1000));
        assert_eq!(sup.navigable_endpoint().map(|e| e.port()), Some(1000));
    }

    #[tokio::test]
    async fn test_handshake_chunk_is_also_relayed() {
        let mut sup = supervisor();
        sup.on_spawned(None);
        sup.on_output_chunk(b"port=1000\nafter\n").unwrap();
        let lines = sup.recent_output().snapshot();
        assert!(lines.contains(&"[OUT] port=1000".to_string()));
        assert!(lines.contains(&"[OUT] after".to_string()));
    }

    #[tokio::test]
    async fn test_exit_before_handshake_never_connects() {
        let mut sup = supervisor();
        sup.on_spawned(None);
        let event = sup.on_exit(Some(2));
        assert_eq!(
            event,
            SupervisorEvent::Gone(GoneReason::NeverStarted { code: Some(2) })
        );
        assert!(!sup.history().contains(&SupervisorState::Connected));
        assert_eq!(sup.state(), SupervisorState::Failed);
    }

    #[tokio::test]
    async fn test_exit_after_connect_reports_lost_connection() {
        let mut sup = supervisor();
        sup.on_spawned(None);
        sup.on_output_chunk(b"port=9921\n").unwrap();
        let event = sup.on_exit(None);
        match event {
            SupervisorEvent::Gone(reason) => {
                assert!(reason.to_string().contains("lost connection"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(sup.state(), SupervisorState::Failed);
        assert_eq!(sup.endpoint_view().current(), None);
    }

    #[tokio::test]
    async fn test_handshake_timeout_fails() {
        let mut sup = supervisor();
        sup.on_spawned(None);
        let err = sup.on_handshake_timeout();
        assert!(matches!(err, ShellError::HandshakeTimeout { .. }));
        assert_eq!(sup.state(), SupervisorState::Failed);
        assert!(sup.handshake_deadline().is_none());
    }

    #[tokio::test]
    async fn test_exit_after_failure_stays_failed() {
        let mut sup = supervisor();
        sup.on_spawned(Some(7));
        sup.on_handshake_timeout();
        sup.on_terminating();
        let event = sup.on_exit(None);
        assert_eq!(event, SupervisorEvent::Gone(GoneReason::NeverStarted { code: None }));
        assert_eq!(
            sup.history(),
            &[
                SupervisorState::Starting,
                SupervisorState::AwaitingHandshake,
                SupervisorState::Failed
            ]
        );
        assert_eq!(sup.pid(), None);
    }

    #[tokio::test]
    async fn test_unterminated_port_connects_once_settled() {
        let mut sup = supervisor();
        sup.on_spawned(None);
        assert_eq!(sup.on_output_chunk(b"port=9921").unwrap(), None);
        assert!(sup.settle_deadline().is_some());
        assert_eq!(sup.state(), SupervisorState::AwaitingHandshake);

        let event = sup.on_output_settled();
        assert_eq!(event, Some(SupervisorEvent::Ready(Endpoint::new(9921).unwrap())));
        assert_eq!(sup.state(), SupervisorState::Connected);
        assert!(sup.settle_deadline().is_none());
        assert!(sup.handshake_deadline().is_none());
    }

    #[tokio::test]
    async fn test_more_digits_before_settle_extend_the_port() {
        let mut sup = supervisor();
        sup.on_spawned(None);
        sup.on_output_chunk(b"port=99").unwrap();
        let event = sup.on_output_chunk(b"21\n").unwrap();
        assert_eq!(event, Some(SupervisorEvent::Ready(Endpoint::new(9921).unwrap())));
        assert!(sup.settle_deadline().is_none());
        assert_eq!(sup.on_output_settled(), None);
    }

    #[tokio::test]
    async fn test_closed_output_resolves_held_port() {
        let mut sup = supervisor();
        sup.on_spawned(None);
        sup.on_output_chunk(b"port=4242").unwrap();
        assert_eq!(
            sup.on_output_closed(),
            Some(SupervisorEvent::Ready(Endpoint::new(4242).unwrap()))
        );
    }

    #[tokio::test]
    async fn test_overflow_fails() {
        let mut sup = Supervisor::new(LogRelay::in_memory(5), Duration::from_secs(5), 32);
        sup.on_spawned(None);
        let err = sup.on_output_chunk(&[b'z'; 40]).unwrap_err();
        assert!(matches!(err, ShellError::HandshakeOverflow { .. }));
        assert_eq!(sup.state(), SupervisorState::Failed);
    }

    #[tokio::test]
    async fn test_reconnect_requires_new_handshake() {
        let mut sup = supervisor();
        sup.on_spawned(Some(1));
        sup.on_output_chunk(b"port=1000\n").unwrap();

        sup.on_reconnecting();
        assert_eq!(sup.state(), SupervisorState::Reconnecting);
        assert_eq!(sup.navigable_endpoint(), None);
        assert_eq!(sup.endpoint_view().current(), None);

        sup.on_spawned(Some(2));
        assert_eq!(sup.state(), SupervisorState::AwaitingHandshake);
        let event = sup.on_output_chunk(b"port=2000\n").unwrap();
        assert_eq!(
            event,
            Some(SupervisorEvent::Ready(Endpoint::new(2000).unwrap()))
        );
        assert_eq!(
            &sup.history()[3..],
            &[
                SupervisorState::Reconnecting,
                SupervisorState::Starting,
                SupervisorState::AwaitingHandshake,
                SupervisorState::Connected
            ]
        );
    }

    #[tokio::test]
    async fn test_exit_of_replaced_instance_before_handshake_is_never_started() {
        let mut sup = supervisor();
        sup.on_spawned(Some(1));
        sup.on_output_chunk(b"port=1000\n").unwrap();
        sup.on_reconnecting();
        sup.on_spawned(Some(2));
        let event = sup.on_exit(Some(1));
        assert_eq!(
            event,
            SupervisorEvent::Gone(GoneReason::NeverStarted { code: Some(1) })
        );
    }
}
