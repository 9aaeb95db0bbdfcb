use tauri::menu::{Menu, MenuEvent, MenuItem, PredefinedMenuItem, Submenu};
use tauri::{AppHandle, Manager, Runtime};

use super::post;
use crate::coordinator::ShellEvent;

const RELOAD_ID: &str = "view.reload";
const DEVTOOLS_ID: &str = "view.devtools";
const RESTART_ID: &str = "view.restart-backend";

/// The platform default menu plus a "View" menu for reload and devtools
pub fn build<R: Runtime>(app: &AppHandle<R>) -> tauri::Result<Menu<R>> {
    let menu = Menu::default(app)?;

    let reload = MenuItem::with_id(app, RELOAD_ID, "Reload", true, Some("CmdOrCtrl+R"))?;
    let devtools = MenuItem::with_id(
        app,
        DEVTOOLS_ID,
        "Toggle Developer Tools",
        true,
        Some("F12"),
    )?;
    let restart = MenuItem::with_id(app, RESTART_ID, "Restart Backend", true, None::<&str>)?;
    let separator = PredefinedMenuItem::separator(app)?;

    let view = Submenu::with_items(app, "View", true, &[&reload, &devtools, &separator, &restart])?;
    menu.append(&view)?;
    Ok(menu)
}

fn focused_label<R: Runtime>(app: &AppHandle<R>) -> Option<String> {
    app.webview_windows()
        .into_iter()
        .find(|(_, window)| window.is_focused().unwrap_or(false))
        .map(|(label, _)| label)
}

pub fn handle<R: Runtime>(app: &AppHandle<R>, event: MenuEvent) {
    match event.id().as_ref() {
        RELOAD_ID => post(app, ShellEvent::RefreshRequested(focused_label(app))),
        DEVTOOLS_ID => post(app, ShellEvent::DevToolsToggleRequested(focused_label(app))),
        RESTART_ID => post(app, ShellEvent::RespawnRequested),
        _ => {}
    }
}
