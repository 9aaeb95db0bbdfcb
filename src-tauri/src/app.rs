pub const APP_NAME: &str = env!("APP_NAME");
pub const APP_VERSION: &str = env!("APP_VERSION");
pub const APP_ID: &str = env!("APP_ID");

/// Label of the first surface; later surfaces get a numeric suffix
pub const MAIN_SURFACE_LABEL: &str = "main";

#[cfg(target_os = "windows")]
pub const BACKEND_BINARY_NAME: &str = "backend.exe";
#[cfg(not(target_os = "windows"))]
pub const BACKEND_BINARY_NAME: &str = "backend";

pub const BACKEND_ENV: &str = "GOIRCHA_BACKEND";
pub const HANDSHAKE_TIMEOUT_ENV: &str = "GOIRCHA_HANDSHAKE_TIMEOUT_MS";
pub const KEEP_ALIVE_ENV: &str = "GOIRCHA_KEEP_ALIVE";
pub const DEBUG_ENV: &str = "GOIRCHA_DEBUG";
