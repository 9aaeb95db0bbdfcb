/// Lifecycle coordination
///
/// One `Coordinator` owns the supervisor and the window controller and runs a
/// single event loop over shell events, backend process events and the
/// handshake deadline. Every way the application can end goes through
/// `shutdown`, which consumes the coordinator and therefore runs once.
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ShellError, ShellResult};
use crate::notify::NotificationBridge;
use crate::process::{
    BackendProcess, Endpoint, EndpointView, InstanceEvent, LaunchSpec, ProcessEvent, Supervisor,
    SupervisorEvent, SupervisorState,
};
use crate::relay::{LogRelay, RecentLines};
use crate::window::{classify_navigation, NavigationDecision, SurfaceHost, WindowController};

/// Things the desktop layer reports to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    SurfaceClosed(String),
    /// The app was activated again (dock click, second instance launch)
    Reactivate,
    RefreshRequested(Option<String>),
    DevToolsToggleRequested(Option<String>),
    /// A surface tried to leave the backend origin
    ExternalNavigation(String),
    NotificationActivated { source: String, id: String },
    RespawnRequested,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Launching,
    Running,
    ShuttingDown,
    Terminated,
}

/// Whether the application survives its last window closing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowClosePolicy {
    pub keep_running_without_windows: bool,
}

impl WindowClosePolicy {
    /// macOS apps stay alive in the dock, everything else quits
    pub fn platform_default() -> Self {
        Self {
            keep_running_without_windows: cfg!(target_os = "macos"),
        }
    }
}

impl Default for WindowClosePolicy {
    fn default() -> Self {
        Self::platform_default()
    }
}

#[derive(Debug)]
pub enum ShutdownReason {
    AllWindowsClosed,
    UserQuit,
    Fatal(ShellError),
}

impl ShutdownReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AllWindowsClosed | Self::UserQuit => 0,
            Self::Fatal(_) => 1,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllWindowsClosed => write!(f, "all windows closed"),
            Self::UserQuit => write!(f, "quit requested"),
            Self::Fatal(e) => write!(f, "{}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub launch: LaunchSpec,
    pub handshake_timeout: Duration,
    pub max_handshake_line: usize,
    pub policy: WindowClosePolicy,
    pub notification_path: String,
    pub log_file: Option<PathBuf>,
    pub recent_log_lines: usize,
}

/// What a finished run looked like
#[derive(Debug)]
pub struct ShellReport {
    pub reason: ShutdownReason,
    pub lifecycle: Vec<LifecycleState>,
    pub supervisor: Vec<SupervisorState>,
    pub endpoint: Option<Endpoint>,
}

/// Cloneable entry point into a running coordinator
#[derive(Debug, Clone)]
pub struct ShellHandle {
    tx: mpsc::UnboundedSender<ShellEvent>,
    endpoint: EndpointView,
    recent: RecentLines,
    lifecycle: Arc<RwLock<LifecycleState>>,
}

impl ShellHandle {
    pub fn send(&self, event: ShellEvent) -> ShellResult<()> {
        self.tx.send(event).map_err(|_| ShellError::ChannelClosed)
    }

    /// The backend endpoint while it is connected
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.current()
    }

    pub fn recent_logs(&self) -> Vec<String> {
        self.recent.snapshot()
    }

    pub fn classify(&self, url: &str) -> NavigationDecision {
        classify_navigation(self.endpoint.current(), url)
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.read()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.lifecycle(),
            LifecycleState::Launching | LifecycleState::Running
        )
    }

    /// Whether the application may end without an explicit exit code. The
    /// coordinator always exits with one, so only once it is gone.
    pub fn allows_implicit_exit(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct Coordinator {
    settings: CoordinatorSettings,
    supervisor: Supervisor,
    windows: WindowController,
    notifications: NotificationBridge,
    lifecycle: Arc<RwLock<LifecycleState>>,
    lifecycle_history: Vec<LifecycleState>,
    shell_rx: mpsc::UnboundedReceiver<ShellEvent>,
    process_tx: mpsc::UnboundedSender<InstanceEvent>,
    process_rx: mpsc::UnboundedReceiver<InstanceEvent>,
    backend: Option<BackendProcess>,
    instance: u64,
}

impl Coordinator {
    pub fn new(settings: CoordinatorSettings, host: Box<dyn SurfaceHost>) -> (Self, ShellHandle) {
        let relay = LogRelay::new(settings.log_file.clone(), settings.recent_log_lines);
        if let Some(path) = relay.log_path() {
            info!("Backend output is logged to {:?}", path);
        }
        let supervisor = Supervisor::new(
            relay,
            settings.handshake_timeout,
            settings.max_handshake_line,
        );
        let windows = WindowController::new(host, supervisor.endpoint_view());
        let notifications = NotificationBridge::new(settings.notification_path.clone());
        let lifecycle = Arc::new(RwLock::new(LifecycleState::Launching));

        let (shell_tx, shell_rx) = mpsc::unbounded_channel();
        let (process_tx, process_rx) = mpsc::unbounded_channel();

        let handle = ShellHandle {
            tx: shell_tx,
            endpoint: supervisor.endpoint_view(),
            recent: supervisor.recent_output(),
            lifecycle: lifecycle.clone(),
        };

        let coordinator = Self {
            settings,
            supervisor,
            windows,
            notifications,
            lifecycle,
            lifecycle_history: vec![LifecycleState::Launching],
            shell_rx,
            process_tx,
            process_rx,
            backend: None,
            instance: 0,
        };
        (coordinator, handle)
    }

    fn set_lifecycle(&mut self, next: LifecycleState) {
        let mut current = self.lifecycle.write();
        if *current != next {
            debug!("Lifecycle {:?} -> {:?}", *current, next);
            *current = next;
            self.lifecycle_history.push(next);
        }
    }

    /// Opens the main surface, launches the backend and runs until shutdown
    pub async fn run(mut self) -> ShellReport {
        info!("Shell starting, backend {:?}", self.settings.launch.program);

        if let Err(e) = self.windows.open_surface().await {
            return self.shutdown(ShutdownReason::Fatal(e)).await;
        }
        if let Err(e) = self.spawn_backend() {
            return self.shutdown(ShutdownReason::Fatal(e)).await;
        }
        self.set_lifecycle(LifecycleState::Running);

        let reason = loop {
            let deadline = self.supervisor.handshake_deadline();
            let settle = self.supervisor.settle_deadline();
            tokio::select! {
                Some((instance, event)) = self.process_rx.recv() => {
                    if let Some(reason) = self.on_process_event(instance, event).await {
                        break reason;
                    }
                }
                event = self.shell_rx.recv() => {
                    let Some(event) = event else {
                        info!("All shell handles dropped");
                        break ShutdownReason::UserQuit;
                    };
                    if let Some(reason) = self.on_shell_event(event).await {
                        break reason;
                    }
                }
                _ = wait_for(settle) => {
                    let ready = self.supervisor.on_output_settled();
                    if let Some(reason) = self.on_ready(ready).await {
                        break reason;
                    }
                }
                _ = wait_for(deadline) => {
                    break ShutdownReason::Fatal(self.supervisor.on_handshake_timeout());
                }
            }
        };

        self.shutdown(reason).await
    }

    fn spawn_backend(&mut self) -> ShellResult<()> {
        self.instance += 1;
        match BackendProcess::spawn(&self.settings.launch, self.instance, self.process_tx.clone()) {
            Ok(process) => {
                self.supervisor.on_spawned(process.pid());
                self.backend = Some(process);
                Ok(())
            }
            Err(e) => {
                self.supervisor.on_launch_failed(&e);
                Err(e)
            }
        }
    }

    async fn on_process_event(&mut self, instance: u64, event: ProcessEvent) -> Option<ShutdownReason> {
        if instance != self.instance {
            debug!("Ignoring output of replaced backend instance {}", instance);
            return None;
        }

        match event {
            ProcessEvent::Stdout(chunk) => match self.supervisor.on_output_chunk(&chunk) {
                Ok(ready) => self.on_ready(ready).await,
                Err(e) => Some(ShutdownReason::Fatal(e)),
            },
            ProcessEvent::StdoutClosed => {
                let ready = self.supervisor.on_output_closed();
                self.on_ready(ready).await
            }
            ProcessEvent::Stderr(chunk) => {
                self.supervisor.on_error_chunk(&chunk);
                None
            }
            ProcessEvent::Exited(code) => {
                self.backend = None;
                match self.supervisor.on_exit(code) {
                    SupervisorEvent::Gone(reason) => {
                        Some(ShutdownReason::Fatal(ShellError::BackendExited(reason)))
                    }
                    SupervisorEvent::Ready(_) => None,
                }
            }
        }
    }

    async fn on_ready(&mut self, event: Option<SupervisorEvent>) -> Option<ShutdownReason> {
        let Some(SupervisorEvent::Ready(endpoint)) = event else {
            return None;
        };
        match self.windows.navigate_to(endpoint).await {
            Ok(()) => None,
            Err(e) => Some(ShutdownReason::Fatal(e)),
        }
    }

    async fn on_shell_event(&mut self, event: ShellEvent) -> Option<ShutdownReason> {
        debug!("Shell event: {:?}", event);
        match event {
            ShellEvent::SurfaceClosed(label) => {
                if !self.windows.has_surface(&label) {
                    return None;
                }
                if self.windows.surface_closed(&label) > 0 {
                    return None;
                }
                if self.settings.policy.keep_running_without_windows {
                    info!("Last window closed, staying alive");
                    None
                } else {
                    Some(ShutdownReason::AllWindowsClosed)
                }
            }
            ShellEvent::Reactivate => {
                if self.windows.surface_count() == 0 {
                    info!("Reactivated without windows, opening a new one");
                    let result = self.windows.open_surface().await.map(|_| ());
                    self.check(result)
                } else {
                    let result = self.windows.focus();
                    self.check(result)
                }
            }
            ShellEvent::RefreshRequested(label) => {
                let result = self.windows.manual_refresh(label.as_deref()).await.map(|_| ());
                self.check(result)
            }
            ShellEvent::DevToolsToggleRequested(label) => {
                let result = self.windows.toggle_diagnostics(label.as_deref());
                self.check(result)
            }
            ShellEvent::ExternalNavigation(url) => {
                let result = self.windows.open_external(&url);
                self.check(result)
            }
            ShellEvent::NotificationActivated { source, id } => {
                self.notifications
                    .activate(self.supervisor.navigable_endpoint(), &source, &id);
                None
            }
            ShellEvent::RespawnRequested => self.respawn().await,
            ShellEvent::Quit => Some(ShutdownReason::UserQuit),
        }
    }

    /// Non-fatal failures are logged, fatal ones end the run
    fn check(&self, result: ShellResult<()>) -> Option<ShutdownReason> {
        match result {
            Ok(()) => None,
            Err(e) if e.is_fatal() => Some(ShutdownReason::Fatal(e)),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Replaces the backend with a fresh instance. Surfaces are navigated
    /// again only once the new instance completes its own handshake.
    async fn respawn(&mut self) -> Option<ShutdownReason> {
        info!("Restarting backend");
        self.supervisor.on_reconnecting();
        if let Some(mut backend) = self.backend.take() {
            info!("Stopping backend instance {}", backend.instance());
            backend.kill().await;
        }
        match self.spawn_backend() {
            Ok(()) => None,
            Err(e) => Some(ShutdownReason::Fatal(e)),
        }
    }

    /// The single termination path: stop the backend, tell the user about a
    /// fault, close every surface, hand the exit code to the host.
    pub async fn shutdown(mut self, reason: ShutdownReason) -> ShellReport {
        if reason.is_fatal() {
            error!("Shutting down: {}", reason);
        } else {
            info!("Shutting down: {}", reason);
        }
        self.set_lifecycle(LifecycleState::ShuttingDown);
        self.supervisor.on_terminating();

        if let Some(mut backend) = self.backend.take() {
            backend.kill().await;
            // the exit and any output before it are already queued
            while let Ok((instance, event)) = self.process_rx.try_recv() {
                if instance != self.instance {
                    continue;
                }
                match event {
                    ProcessEvent::Stdout(chunk) => {
                        let _ = self.supervisor.on_output_chunk(&chunk);
                    }
                    ProcessEvent::Stderr(chunk) => self.supervisor.on_error_chunk(&chunk),
                    ProcessEvent::StdoutClosed => {}
                    ProcessEvent::Exited(code) => {
                        self.supervisor.on_exit(code);
                    }
                }
            }
        }
        self.supervisor.flush_output();

        if let ShutdownReason::Fatal(e) = &reason {
            self.windows.report_fatal(&e.to_string());
        }
        self.windows.close_all();
        self.set_lifecycle(LifecycleState::Terminated);
        self.windows.exit(reason.exit_code());

        ShellReport {
            lifecycle: self.lifecycle_history.clone(),
            supervisor: self.supervisor.history().to_vec(),
            endpoint: self.supervisor.endpoint(),
            reason,
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
