#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use goircha_lib::notify::DEFAULT_NOTIFICATION_PATH;
use goircha_lib::process::LaunchSpec;
use goircha_lib::{
    Coordinator, CoordinatorSettings, ShellError, ShellHandle, ShellReport, ShellResult,
    SurfaceHost, WindowClosePolicy,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Open(String),
    Load(String, String),
    DevTools(String),
    External(String),
    Focus(String),
    Fatal(String),
    CloseAll,
    Exit(i32),
}

/// Surface host that records every call instead of drawing anything
#[derive(Clone, Default)]
pub struct RecordingHost {
    calls: Arc<Mutex<Vec<HostCall>>>,
    fail_loads: bool,
}

impl RecordingHost {
    pub fn failing_loads() -> Self {
        Self {
            fail_loads: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().clone()
    }

    pub fn loads(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HostCall::Load(label, url) => Some((label, url)),
                _ => None,
            })
            .collect()
    }

    pub fn exits(&self) -> Vec<i32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HostCall::Exit(code) => Some(code),
                _ => None,
            })
            .collect()
    }

    /// Messages shown to the user about fatal faults
    pub fn fatals(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HostCall::Fatal(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: HostCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl SurfaceHost for RecordingHost {
    fn open_surface(&mut self, label: &str) -> ShellResult<()> {
        self.record(HostCall::Open(label.to_string()));
        Ok(())
    }

    async fn load(&mut self, label: &str, url: &str) -> ShellResult<()> {
        if self.fail_loads {
            return Err(ShellError::NavigationFault {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.record(HostCall::Load(label.to_string(), url.to_string()));
        Ok(())
    }

    fn toggle_devtools(&mut self, label: &str) -> ShellResult<()> {
        self.record(HostCall::DevTools(label.to_string()));
        Ok(())
    }

    fn open_external(&mut self, url: &str) -> ShellResult<()> {
        self.record(HostCall::External(url.to_string()));
        Ok(())
    }

    fn focus(&mut self, label: &str) -> ShellResult<()> {
        self.record(HostCall::Focus(label.to_string()));
        Ok(())
    }

    fn report_fatal(&mut self, message: &str) {
        self.record(HostCall::Fatal(message.to_string()));
    }

    fn close_all(&mut self) {
        self.record(HostCall::CloseAll);
    }

    fn exit(&mut self, code: i32) {
        self.record(HostCall::Exit(code));
    }
}

/// Settings for a mock backend run by `/bin/sh -c <script>`
pub fn settings(script: &str) -> CoordinatorSettings {
    CoordinatorSettings {
        launch: LaunchSpec::new("/bin/sh").arg("-c").arg(script),
        handshake_timeout: Duration::from_secs(10),
        max_handshake_line: 64 * 1024,
        policy: WindowClosePolicy {
            keep_running_without_windows: false,
        },
        notification_path: DEFAULT_NOTIFICATION_PATH.to_string(),
        log_file: None,
        recent_log_lines: 100,
    }
}

pub struct RunningShell {
    pub handle: ShellHandle,
    pub host: RecordingHost,
    task: JoinHandle<ShellReport>,
}

impl RunningShell {
    pub fn start(settings: CoordinatorSettings, host: RecordingHost) -> Self {
        let (coordinator, handle) = Coordinator::new(settings, Box::new(host.clone()));
        let task = tokio::spawn(coordinator.run());
        Self { handle, host, task }
    }

    /// Waits for the coordinator to finish on its own
    pub async fn finished(self) -> ShellReport {
        tokio::time::timeout(TEST_TIMEOUT, self.task)
            .await
            .expect("shell finished in time")
            .expect("shell task did not panic")
    }

    pub async fn wait_for<F>(&self, what: &str, condition: F)
    where
        F: Fn(&Self) -> bool,
    {
        wait_until(what, || condition(self)).await;
    }
}

pub async fn wait_until<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let waited = tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}
