/// Backend output relay
///
/// Every chunk the backend writes is forwarded here, independent of the
/// handshake. Lines are emitted to tracing under the `backend` target,
/// appended to a per-run log file and kept in a bounded in-memory tail that
/// the diagnostics view reads.
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::app::APP_ID;

/// Default number of lines kept for the diagnostics view
pub const DEFAULT_RECENT_LINES: usize = 800;

// A line longer than this is emitted in pieces
const MAX_CARRY_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn tag(self) -> &'static str {
        match self {
            Self::Stdout => "OUT",
            Self::Stderr => "ERR",
        }
    }
}

/// Returns the platform-specific path for the backend log file
/// - macOS: ~/Library/Logs/goircha/backend.log
/// - Windows: %LOCALAPPDATA%\goircha\logs\backend.log
/// - Linux: ~/.goircha/logs/backend.log
pub fn default_log_path() -> PathBuf {
    let log_dir = if cfg!(target_os = "macos") {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("Library")
            .join("Logs")
            .join(APP_ID)
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_ID)
            .join("logs")
    } else {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(format!(".{}", APP_ID))
            .join("logs")
    };
    log_dir.join("backend.log")
}

/// Shared, bounded tail of relayed lines
#[derive(Debug, Clone)]
pub struct RecentLines {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl RecentLines {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct LogRelay {
    file: Option<File>,
    path: Option<PathBuf>,
    stdout_carry: Vec<u8>,
    stderr_carry: Vec<u8>,
    recent: RecentLines,
}

impl LogRelay {
    /// Creates a relay. When `log_path` is given the file is truncated and a
    /// header written, so each run starts with a fresh log.
    pub fn new(log_path: Option<PathBuf>, recent_lines: usize) -> Self {
        let file = log_path.as_deref().and_then(open_fresh_log);
        Self {
            path: if file.is_some() { log_path } else { None },
            file,
            stdout_carry: Vec::new(),
            stderr_carry: Vec::new(),
            recent: RecentLines::new(recent_lines),
        }
    }

    /// Relay that only keeps the in-memory tail
    pub fn in_memory(recent_lines: usize) -> Self {
        Self::new(None, recent_lines)
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn recent(&self) -> RecentLines {
        self.recent.clone()
    }

    /// Forwards one raw chunk. Complete lines are emitted now, a trailing
    /// partial line waits for the next chunk or `flush`.
    pub fn relay(&mut self, stream: OutputStream, chunk: &[u8]) {
        let mut carry = std::mem::take(self.carry_mut(stream));
        carry.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = carry[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            self.emit(stream, &carry[start..end]);
            start = end + 1;
        }
        carry.drain(..start);

        if carry.len() > MAX_CARRY_BYTES {
            self.emit(stream, &carry);
            carry.clear();
        }
        *self.carry_mut(stream) = carry;
    }

    /// Emits whatever partial lines are still buffered
    pub fn flush(&mut self) {
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let carry = std::mem::take(self.carry_mut(stream));
            if !carry.is_empty() {
                self.emit(stream, &carry);
            }
        }
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }

    /// Writes a shell-side marker line into the backend log
    pub fn note(&mut self, message: &str) {
        self.write_line(&format!("=== {} ===", message));
    }

    fn carry_mut(&mut self, stream: OutputStream) -> &mut Vec<u8> {
        match stream {
            OutputStream::Stdout => &mut self.stdout_carry,
            OutputStream::Stderr => &mut self.stderr_carry,
        }
    }

    fn emit(&mut self, stream: OutputStream, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches('\r');
        match stream {
            OutputStream::Stdout => info!(target: "backend", "[BACKEND OUT] {}", line),
            OutputStream::Stderr => warn!(target: "backend", "[BACKEND ERR] {}", line),
        }
        let tagged = format!("[{}] {}", stream.tag(), line);
        self.write_line(&tagged);
        self.recent.push(tagged);
    }

    fn write_line(&mut self, line: &str) {
        if let Some(file) = self.file.as_mut() {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            if writeln!(file, "[{}] {}", timestamp, line).is_err() {
                warn!("Backend log file became unwritable, relaying to tracing only");
                self.file = None;
            }
        }
    }
}

fn open_fresh_log(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
    {
        Ok(mut file) => {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(file, "=== backend log started at {} ===", timestamp);
            Some(file)
        }
        Err(e) => {
            warn!("Could not open backend log {:?}: {}", path, e);
            None
        }
    }
}
