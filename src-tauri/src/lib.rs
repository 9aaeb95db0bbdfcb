/// Desktop shell for the goircha IRC client
///
/// The shell launches the goircha backend, waits for it to announce its
/// port on stdout, points its windows at `http://localhost:<port>/` and
/// keeps window and backend lifetimes in step. Everything except the native
/// window layer builds and tests headlessly; the Tauri glue lives behind the
/// `desktop` feature.
pub mod app;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handshake;
pub mod notify;
pub mod process;
pub mod relay;
pub mod window;

#[cfg(feature = "desktop")]
mod desktop;

pub use config::ShellConfig;
pub use coordinator::{
    Coordinator, CoordinatorSettings, LifecycleState, ShellEvent, ShellHandle, ShellReport,
    ShutdownReason, WindowClosePolicy,
};
pub use error::{ShellError, ShellResult};
pub use window::{NavigationDecision, SurfaceHost};

#[cfg(feature = "desktop")]
pub use desktop::run;

/// Installs the fmt subscriber. INFO by default, DEBUG with `GOIRCHA_DEBUG`.
/// Safe to call more than once.
pub fn init_tracing() {
    let level = if std::env::var_os(app::DEBUG_ENV).is_some() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
}
