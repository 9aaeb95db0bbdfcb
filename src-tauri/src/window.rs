use async_trait::async_trait;
use reqwest::Url;
use tracing::{debug, info, warn};

use crate::app::MAIN_SURFACE_LABEL;
use crate::error::{ShellError, ShellResult};
use crate::process::{Endpoint, EndpointView};

/// Native capabilities the window controller drives. The desktop build
/// implements it on top of Tauri; tests record the calls.
#[async_trait]
pub trait SurfaceHost: Send {
    /// Creates a surface showing a placeholder until navigated
    fn open_surface(&mut self, label: &str) -> ShellResult<()>;

    /// Points the surface at `url`, resolving once the location is loaded
    async fn load(&mut self, label: &str, url: &str) -> ShellResult<()>;

    fn toggle_devtools(&mut self, label: &str) -> ShellResult<()>;

    /// Hands a location to the platform's default handler
    fn open_external(&mut self, url: &str) -> ShellResult<()>;

    fn focus(&mut self, label: &str) -> ShellResult<()>;

    /// Tells the user why the application is about to stop. Returns once
    /// the message has been acknowledged.
    fn report_fatal(&mut self, message: &str);

    fn close_all(&mut self);

    /// Ends the application. Called once, last.
    fn exit(&mut self, code: i32);
}

/// What a surface does with a location it is asked to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationDecision {
    /// Stays in the managed surface
    Allow,
    /// Denied in the surface and opened by the platform instead
    OpenExternal,
    Deny,
}

/// Decides where a navigation belongs. Only the discovered backend origin
/// and the shell's own placeholder pages load inside a surface.
pub fn classify_navigation(endpoint: Option<Endpoint>, url: &str) -> NavigationDecision {
    let Ok(parsed) = Url::parse(url) else {
        debug!("Denying unparsable navigation target: {}", url);
        return NavigationDecision::Deny;
    };

    match parsed.scheme() {
        "tauri" | "about" | "data" => return NavigationDecision::Allow,
        "http" | "https" => {}
        "mailto" => return NavigationDecision::OpenExternal,
        _ => return NavigationDecision::Deny,
    }

    // the bundled placeholder page is served from this origin on some platforms
    if parsed.host_str() == Some("tauri.localhost") {
        return NavigationDecision::Allow;
    }

    if let Some(endpoint) = endpoint {
        let same_origin = parsed.scheme() == "http"
            && matches!(parsed.host_str(), Some("localhost") | Some("127.0.0.1"))
            && parsed.port_or_known_default() == Some(endpoint.port());
        if same_origin {
            return NavigationDecision::Allow;
        }
    }
    NavigationDecision::OpenExternal
}

/// Marks a backend location as freshly requested so a reload after a
/// restart does not reuse a cached page
pub fn fresh_location(url: &str, nonce: i64) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().append_pair("shell_load", &nonce.to_string());
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

#[derive(Debug)]
struct Surface {
    label: String,
    loaded: Option<Endpoint>,
}

/// Owns the set of live surfaces and keeps them pointed at the backend
pub struct WindowController {
    host: Box<dyn SurfaceHost>,
    surfaces: Vec<Surface>,
    endpoint: EndpointView,
    next_surface: u32,
}

impl WindowController {
    pub fn new(host: Box<dyn SurfaceHost>, endpoint: EndpointView) -> Self {
        Self {
            host,
            surfaces: Vec::new(),
            endpoint,
            next_surface: 0,
        }
    }

    /// Creates a new surface. It is navigated at once when the backend is
    /// connected, otherwise it waits for the next `navigate_to`.
    pub async fn open_surface(&mut self) -> ShellResult<String> {
        let label = if self.next_surface == 0 {
            MAIN_SURFACE_LABEL.to_string()
        } else {
            format!("{}-{}", MAIN_SURFACE_LABEL, self.next_surface)
        };
        self.next_surface += 1;

        self.host.open_surface(&label)?;
        self.surfaces.push(Surface {
            label: label.clone(),
            loaded: None,
        });
        info!("Opened surface '{}'", label);

        match self.endpoint.current() {
            Some(endpoint) => self.navigate_surface(&label, endpoint).await?,
            None => debug!("Surface '{}' waits for the backend handshake", label),
        }
        Ok(label)
    }

    /// Loads the endpoint into every surface
    pub async fn navigate_to(&mut self, endpoint: Endpoint) -> ShellResult<()> {
        let waiting = self.pending_surfaces();
        if !waiting.is_empty() {
            debug!("Surfaces waiting for the backend: {:?}", waiting);
        }
        let labels: Vec<String> = self.surfaces.iter().map(|s| s.label.clone()).collect();
        for label in labels {
            self.navigate_surface(&label, endpoint).await?;
        }
        Ok(())
    }

    /// Loads the endpoint into one surface. A failed load is fatal.
    pub async fn navigate_surface(&mut self, label: &str, endpoint: Endpoint) -> ShellResult<()> {
        let url = endpoint.url();
        info!("Loading {} into surface '{}'", url, label);
        self.host
            .load(label, &url)
            .await
            .map_err(|e| match e {
                ShellError::NavigationFault { .. } => e,
                other => ShellError::NavigationFault {
                    url: url.clone(),
                    reason: other.to_string(),
                },
            })?;
        if let Some(surface) = self.surfaces.iter_mut().find(|s| s.label == label) {
            surface.loaded = Some(endpoint);
        }
        Ok(())
    }

    /// Reloads the current endpoint. Returns false when there is nothing to
    /// load yet.
    pub async fn manual_refresh(&mut self, label: Option<&str>) -> ShellResult<bool> {
        let Some(endpoint) = self.endpoint.current() else {
            debug!("Refresh requested before the backend announced a port");
            return Ok(false);
        };
        match label {
            Some(label) if self.has_surface(label) => {
                self.navigate_surface(label, endpoint).await?
            }
            Some(label) => {
                warn!("Refresh requested for unknown surface '{}'", label);
                return Ok(false);
            }
            None => self.navigate_to(endpoint).await?,
        }
        Ok(true)
    }

    pub fn toggle_diagnostics(&mut self, label: Option<&str>) -> ShellResult<()> {
        let label = match label {
            Some(label) => label.to_string(),
            None => match self.surfaces.first() {
                Some(surface) => surface.label.clone(),
                None => return Ok(()),
            },
        };
        self.host.toggle_devtools(&label)
    }

    /// Sends a location that left the backend origin to the platform
    pub fn open_external(&mut self, url: &str) -> ShellResult<()> {
        match classify_navigation(self.endpoint.current(), url) {
            NavigationDecision::OpenExternal => {
                info!("Opening {} externally", url);
                self.host.open_external(url)
            }
            NavigationDecision::Allow => {
                debug!("{} belongs to the backend, not opening externally", url);
                Ok(())
            }
            NavigationDecision::Deny => {
                warn!("Refusing to open {}", url);
                Ok(())
            }
        }
    }

    pub fn focus(&mut self) -> ShellResult<()> {
        match self.surfaces.first() {
            Some(surface) => {
                let label = surface.label.clone();
                self.host.focus(&label)
            }
            None => Ok(()),
        }
    }

    /// Forgets a surface the user closed. Returns how many remain.
    pub fn surface_closed(&mut self, label: &str) -> usize {
        self.surfaces.retain(|s| s.label != label);
        debug!("Surface '{}' closed, {} remaining", label, self.surfaces.len());
        self.surfaces.len()
    }

    pub fn has_surface(&self, label: &str) -> bool {
        self.surfaces.iter().any(|s| s.label == label)
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    /// Labels of surfaces that have not been loaded yet
    fn pending_surfaces(&self) -> Vec<String> {
        self.surfaces
            .iter()
            .filter(|s| s.loaded.is_none())
            .map(|s| s.label.clone())
            .collect()
    }

    pub fn report_fatal(&mut self, message: &str) {
        self.host.report_fatal(message);
    }

    pub fn close_all(&mut self) {
        self.host.close_all();
        self.surfaces.clear();
    }

    pub fn exit(&mut self, code: i32) {
        self.host.exit(code);
    }
}
