// Prevents additional console window on Windows in release builds, DO NOT REMOVE!!
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

fn main() {
    // Release builds abort on panic; on Linux the backend still goes down
    // with us through its parent-death signal
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("Application panic: {}", panic_info);
        default_hook(panic_info);
    }));

    goircha_lib::run();
}
