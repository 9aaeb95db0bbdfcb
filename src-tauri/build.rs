/// Build script
/// Runs at compile time before the shell is built
/// - Injects app metadata from the package manifest into Rust code
/// - With the `desktop` feature, processes tauri.conf.json and platform resources
use std::env;

fn main() {
    let name = env::var("CARGO_PKG_NAME").unwrap_or_else(|_| "goircha".to_string());
    let version = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.1.0".to_string());

    // Normalize name for file system use (lowercase, alphanumeric + hyphens only)
    let app_id = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .collect::<String>();

    // Inject into Rust code via environment variables (accessible with env!() macro)
    println!("cargo:rustc-env=APP_NAME={}", name);
    println!("cargo:rustc-env=APP_VERSION={}", version);
    println!("cargo:rustc-env=APP_ID={}", app_id);

    #[cfg(feature = "desktop")]
    tauri_build::build()
}
