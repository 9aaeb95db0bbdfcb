/// Tauri glue: builds the app, wires native events into the coordinator
/// and lets the coordinator decide when the process ends.
mod commands;
mod host;
mod menu;

use tauri::{Manager, RunEvent, WindowEvent};
use tracing::{error, info};

use crate::app::{APP_NAME, APP_VERSION};
use crate::config::ShellConfig;
use crate::coordinator::{Coordinator, ShellEvent, ShellHandle};

use host::TauriSurfaceHost;

/// Posts an event if the coordinator is up
fn post<R: tauri::Runtime>(app: &tauri::AppHandle<R>, event: ShellEvent) {
    if let Some(shell) = app.try_state::<ShellHandle>() {
        if let Err(e) = shell.send(event) {
            tracing::debug!("Dropping shell event: {}", e);
        }
    }
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    crate::init_tracing();
    info!("Starting {} {}", APP_NAME, APP_VERSION);

    let config = ShellConfig::load();

    let app = tauri::Builder::default()
        .plugin(tauri_plugin_single_instance::init(|app, _argv, _cwd| {
            info!("Second instance launched, reactivating");
            post(app, ShellEvent::Reactivate);
        }))
        .plugin(tauri_plugin_shell::init())
        .plugin(tauri_plugin_dialog::init())
        .menu(menu::build)
        .on_menu_event(menu::handle)
        .on_window_event(|window, event| {
            if let WindowEvent::Destroyed = event {
                post(
                    window.app_handle(),
                    ShellEvent::SurfaceClosed(window.label().to_string()),
                );
            }
        })
        .invoke_handler(tauri::generate_handler![
            commands::refresh,
            commands::toggle_devtools,
            commands::notification_activated,
            commands::get_backend_logs,
            commands::get_backend_endpoint,
            commands::restart_backend,
        ])
        .setup(move |app| {
            let host = TauriSurfaceHost::new(app.handle().clone(), config.window.clone());
            let (coordinator, shell) =
                Coordinator::new(config.coordinator_settings(), Box::new(host));
            app.manage(shell);

            tauri::async_runtime::spawn(async move {
                let report = coordinator.run().await;
                if report.reason.is_fatal() {
                    error!("Shell stopped: {}", report.reason);
                } else {
                    info!("Shell stopped: {}", report.reason);
                }
            });
            Ok(())
        })
        .build(tauri::generate_context!())
        .expect("error while building tauri application");

    app.run(|app_handle, event| match event {
        // Closing windows never ends the app by itself, not even the ones
        // shutdown destroys; the coordinator exits through the host with its
        // own code
        RunEvent::ExitRequested { code: None, api, .. } => {
            let Some(shell) = app_handle.try_state::<ShellHandle>() else {
                return;
            };
            if shell.allows_implicit_exit() {
                return;
            }
            api.prevent_exit();
            if shell.is_running() && !app_handle.webview_windows().is_empty() {
                post(app_handle, ShellEvent::Quit);
            }
        }
        #[cfg(target_os = "macos")]
        RunEvent::Reopen {
            has_visible_windows: false,
            ..
        } => post(app_handle, ShellEvent::Reactivate),
        _ => {}
    });
}
