use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ShellError, ShellResult};

/// Default time a backend gets to exit on its own after being asked to stop
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);

// Output still in flight when the process exits is drained for at most this long
const READER_DRAIN: Duration = Duration::from_millis(500);
const READ_CHUNK: usize = 8 * 1024;

/// What the driver observes about one process instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Stdout reached end of file. The process may still be running.
    StdoutClosed,
    /// Always the last event of an instance. `None` when ended by a signal.
    Exited(Option<i32>),
}

/// Events are tagged with the instance that produced them so a replaced
/// process can never be mistaken for the current one.
pub type InstanceEvent = (u64, ProcessEvent);

/// How to launch the backend
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub kill_grace: Duration,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Handle to one running backend process.
///
/// The child itself is owned by a monitor task that reports its exit. This
/// handle only asks the monitor to stop it.
#[derive(Debug)]
pub struct BackendProcess {
    pid: Option<u32>,
    instance: u64,
    kill_tx: Option<mpsc::Sender<oneshot::Sender<()>>>,
    exited: Arc<AtomicBool>,
}

impl BackendProcess {
    /// Spawns the backend with piped output. Output chunks and the final exit
    /// are delivered on `events`, tagged with `instance`.
    pub fn spawn(
        spec: &LaunchSpec,
        instance: u64,
        events: mpsc::UnboundedSender<InstanceEvent>,
    ) -> ShellResult<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        // Take the backend down with us if the shell dies without cleaning up
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                Ok(())
            });
        }

        info!("Spawning backend: {:?} {:?}", spec.program, spec.args);
        let mut child = cmd.spawn().map_err(|source| ShellError::LaunchFault {
            path: spec.program.clone(),
            source,
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .map(|out| {
                pump(
                    out,
                    instance,
                    events.clone(),
                    ProcessEvent::Stdout,
                    Some(ProcessEvent::StdoutClosed),
                )
            });
        let stderr = child
            .stderr
            .take()
            .map(|err| pump(err, instance, events.clone(), ProcessEvent::Stderr, None));

        let (kill_tx, kill_rx) = mpsc::channel(1);
        let exited = Arc::new(AtomicBool::new(false));
        tokio::spawn(monitor(
            child,
            instance,
            spec.kill_grace,
            [stdout, stderr],
            kill_rx,
            events,
            exited.clone(),
        ));

        Ok(Self {
            pid,
            instance,
            kill_tx: Some(kill_tx),
            exited,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    /// Stops the process: a polite request first, a forced kill once the grace
    /// period runs out. Returns after the `Exited` event has been sent.
    /// Calling it again, or on a process that already exited, does nothing.
    pub async fn kill(&mut self) {
        let Some(kill_tx) = self.kill_tx.take() else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if kill_tx.send(ack_tx).await.is_err() {
            debug!("Backend instance {} already gone", self.instance);
            return;
        }
        let _ = ack_rx.await;
    }
}

fn pump<R, F>(
    mut reader: R,
    instance: u64,
    events: mpsc::UnboundedSender<InstanceEvent>,
    wrap: F,
    at_eof: Option<ProcessEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(Vec<u8>) -> ProcessEvent + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    if let Some(event) = at_eof {
                        let _ = events.send((instance, event));
                    }
                    break;
                }
                Ok(n) => {
                    if events.send((instance, wrap(buf[..n].to_vec()))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Backend pipe read failed: {}", e);
                    break;
                }
            }
        }
    })
}

async fn monitor(
    mut child: Child,
    instance: u64,
    grace: Duration,
    readers: [Option<JoinHandle<()>>; 2],
    mut kill_rx: mpsc::Receiver<oneshot::Sender<()>>,
    events: mpsc::UnboundedSender<InstanceEvent>,
    exited: Arc<AtomicBool>,
) {
    let mut ack = None;
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        request = kill_rx.recv() => {
            // a dropped handle counts as a kill request
            ack = request;
            terminate(&mut child, grace).await
        }
    };

    for mut reader in readers.into_iter().flatten() {
        if tokio::time::timeout(READER_DRAIN, &mut reader).await.is_err() {
            debug!("Backend pipe still open after exit, abandoning reader");
            reader.abort();
        }
    }

    let code = status.and_then(|s| s.code());
    exited.store(true, Ordering::SeqCst);
    let _ = events.send((instance, ProcessEvent::Exited(code)));
    if let Some(ack) = ack {
        let _ = ack.send(());
    }

    kill_rx.close();
    while let Ok(ack) = kill_rx.try_recv() {
        let _ = ack.send(());
    }
}

async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => return Some(status),
                Ok(Err(e)) => warn!("Waiting for backend PID {} failed: {}", pid, e),
                Err(_) => warn!(
                    "Backend PID {} ignored SIGTERM for {:?}, killing",
                    pid, grace
                ),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        warn!("Failed to kill backend: {}", e);
    }
    child.wait().await.ok()
}
