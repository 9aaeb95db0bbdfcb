/// Commands the backend page may invoke
use tauri::{State, WebviewWindow};

use crate::coordinator::{ShellEvent, ShellHandle};

fn send(shell: &ShellHandle, event: ShellEvent) -> Result<(), String> {
    shell.send(event).map_err(|e| e.to_string())
}

#[tauri::command]
pub fn refresh(window: WebviewWindow, shell: State<'_, ShellHandle>) -> Result<(), String> {
    send(&shell, ShellEvent::RefreshRequested(Some(window.label().to_string())))
}

#[tauri::command]
pub fn toggle_devtools(window: WebviewWindow, shell: State<'_, ShellHandle>) -> Result<(), String> {
    send(
        &shell,
        ShellEvent::DevToolsToggleRequested(Some(window.label().to_string())),
    )
}

/// The user clicked a notification for `source`/`id`
#[tauri::command]
pub fn notification_activated(
    source: String,
    id: String,
    shell: State<'_, ShellHandle>,
) -> Result<(), String> {
    send(&shell, ShellEvent::NotificationActivated { source, id })
}

#[tauri::command]
pub fn get_backend_logs(shell: State<'_, ShellHandle>) -> Vec<String> {
    shell.recent_logs()
}

#[tauri::command]
pub fn get_backend_endpoint(shell: State<'_, ShellHandle>) -> Option<String> {
    shell.endpoint().map(|endpoint| endpoint.url())
}

#[tauri::command]
pub fn restart_backend(shell: State<'_, ShellHandle>) -> Result<(), String> {
    send(&shell, ShellEvent::RespawnRequested)
}
