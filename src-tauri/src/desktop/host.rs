use std::time::Duration;

use async_trait::async_trait;
use tauri::webview::NewWindowResponse;
use tauri::{AppHandle, Manager, Url, WebviewUrl, WebviewWindow, WebviewWindowBuilder};
use tauri_plugin_dialog::{DialogExt, MessageDialogKind};
use tauri_plugin_shell::ShellExt;
use tracing::{debug, warn};

use crate::app::APP_NAME;
use crate::config::WindowConfig;
use crate::coordinator::{ShellEvent, ShellHandle};
use crate::error::{ShellError, ShellResult};
use crate::window::{fresh_location, NavigationDecision, SurfaceHost};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// `SurfaceHost` backed by Tauri webview windows
pub struct TauriSurfaceHost {
    app: AppHandle,
    window: WindowConfig,
    probe: reqwest::Client,
}

impl TauriSurfaceHost {
    pub fn new(app: AppHandle, window: WindowConfig) -> Self {
        let probe = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { app, window, probe }
    }

    fn webview(&self, label: &str) -> ShellResult<WebviewWindow> {
        self.app
            .get_webview_window(label)
            .ok_or_else(|| ShellError::Surface {
                label: label.to_string(),
                reason: "no such window".to_string(),
            })
    }
}

/// Keeps a surface on the backend origin. Returns whether the webview may
/// follow `url` itself.
fn route_navigation(app: &AppHandle, url: &Url) -> bool {
    let Some(shell) = app.try_state::<ShellHandle>() else {
        return true;
    };
    match shell.classify(url.as_str()) {
        NavigationDecision::Allow => true,
        NavigationDecision::OpenExternal => {
            let _ = shell.send(ShellEvent::ExternalNavigation(url.to_string()));
            false
        }
        NavigationDecision::Deny => {
            debug!("Blocked navigation to {}", url);
            false
        }
    }
}

fn surface_error(label: &str, e: impl std::fmt::Display) -> ShellError {
    ShellError::Surface {
        label: label.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl SurfaceHost for TauriSurfaceHost {
    fn open_surface(&mut self, label: &str) -> ShellResult<()> {
        let app = self.app.clone();
        let opener = self.app.clone();
        WebviewWindowBuilder::new(&self.app, label, WebviewUrl::App("index.html".into()))
            .title(&self.window.title)
            .inner_size(self.window.width, self.window.height)
            .on_navigation(move |url| route_navigation(&app, url))
            // links with a target and window.open never get a window of their own
            .on_new_window(move |url, _features| {
                if let Some(shell) = opener.try_state::<ShellHandle>() {
                    let _ = shell.send(ShellEvent::ExternalNavigation(url.to_string()));
                }
                NewWindowResponse::Deny
            })
            .build()
            .map_err(|e| surface_error(label, e))?;
        Ok(())
    }

    async fn load(&mut self, label: &str, url: &str) -> ShellResult<()> {
        let fault = |reason: String| ShellError::NavigationFault {
            url: url.to_string(),
            reason,
        };
        let window = self.webview(label)?;
        let fresh = fresh_location(url, chrono::Utc::now().timestamp_millis());
        let target = Url::parse(&fresh).map_err(|e| fault(e.to_string()))?;

        // the webview gives no load result, so check the backend answers first
        self.probe
            .get(url)
            .send()
            .await
            .map_err(|e| fault(e.to_string()))?;

        window.navigate(target).map_err(|e| fault(e.to_string()))
    }

    fn toggle_devtools(&mut self, label: &str) -> ShellResult<()> {
        let window = self.webview(label)?;
        if window.is_devtools_open() {
            window.close_devtools();
        } else {
            window.open_devtools();
        }
        Ok(())
    }

    // the replacement lives in tauri-plugin-opener
    #[allow(deprecated)]
    fn open_external(&mut self, url: &str) -> ShellResult<()> {
        self.app
            .shell()
            .open(url, None)
            .map_err(|e| surface_error("external", e))
    }

    fn focus(&mut self, label: &str) -> ShellResult<()> {
        let window = self.webview(label)?;
        if window.is_minimized().unwrap_or(false) {
            let _ = window.unminimize();
        }
        window.show().map_err(|e| surface_error(label, e))?;
        window.set_focus().map_err(|e| surface_error(label, e))
    }

    fn report_fatal(&mut self, message: &str) {
        self.app
            .dialog()
            .message(message)
            .title(format!("{} stopped", APP_NAME))
            .kind(MessageDialogKind::Error)
            .blocking_show();
    }

    fn close_all(&mut self) {
        for (label, window) in self.app.webview_windows() {
            if let Err(e) = window.destroy() {
                warn!("Failed to close window '{}': {}", label, e);
            }
        }
    }

    fn exit(&mut self, code: i32) {
        self.app.exit(code);
    }
}
