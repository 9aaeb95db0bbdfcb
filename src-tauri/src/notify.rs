/// Notification click-through
///
/// When the page reports that the user activated a notification, the shell
/// tells the backend which conversation to bring forward. The request is
/// fire-and-forget: nothing waits for it and failures are only logged.
use std::time::Duration;

use reqwest::{Client, Url};
use tracing::debug;

use crate::process::Endpoint;

pub const DEFAULT_NOTIFICATION_PATH: &str = "/changeWindow/{source}/{id}";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct NotificationBridge {
    client: Client,
    path_template: String,
}

impl NotificationBridge {
    pub fn new(path_template: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            path_template: path_template.into(),
        }
    }

    /// Builds the activation URL. Every template segment is percent-encoded
    /// on its own, so `source` and `id` can never add path segments.
    pub fn activation_url(&self, endpoint: Endpoint, source: &str, id: &str) -> Option<Url> {
        let mut url = Url::parse(&endpoint.url()).ok()?;
        {
            let mut segments = url.path_segments_mut().ok()?;
            segments.clear();
            for part in self.path_template.split('/').filter(|p| !p.is_empty()) {
                match part {
                    "{source}" => segments.push(source),
                    "{id}" => segments.push(id),
                    literal => segments.push(literal),
                };
            }
        }
        Some(url)
    }

    /// Sends the activation in the background. Skipped without an endpoint.
    pub fn activate(&self, endpoint: Option<Endpoint>, source: &str, id: &str) -> bool {
        let Some(endpoint) = endpoint else {
            debug!("Dropping notification activation, backend not connected");
            return false;
        };
        let Some(url) = self.activation_url(endpoint, source, id) else {
            debug!("Could not build activation URL for {}/{}", source, id);
            return false;
        };

        let client = self.client.clone();
        tokio::spawn(async move {
            match client.get(url.clone()).send().await {
                Ok(response) => debug!("Notification activation {} -> {}", url, response.status()),
                Err(e) => debug!("Notification activation {} failed: {}", url, e),
            }
        });
        true
    }
}

impl Default for NotificationBridge {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_PATH)
    }
}
