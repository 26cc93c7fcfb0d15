use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use crate::error::WatchError;
use crate::notifier::{Notification, Notifier};

const SERVERCHAN_API: &str = "https://sctapi.ftqq.com";

/// ServerChan push: a form POST of `title` and `desp` to the per-user endpoint.
pub struct ServerChan {
    client: Client,
    endpoint: Url,
}

impl ServerChan {
    pub fn new(send_key: &str) -> Result<Self, WatchError> {
        let endpoint = Url::parse(&format!("{SERVERCHAN_API}/{send_key}.send"))
            .map_err(|e| WatchError::NotifyFailed(format!("invalid SEND_KEY: {e}")))?;
        Ok(Self::with_endpoint(endpoint))
    }

    pub fn with_endpoint(endpoint: Url) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl Notifier for ServerChan {
    fn name(&self) -> &str {
        "serverchan"
    }

    async fn send(&self, notification: &Notification) -> Result<(), WatchError> {
        let form = [
            ("title", notification.title.as_str()),
            ("desp", notification.body.as_str()),
        ];
        // The endpoint embeds the send key, so keep it out of error messages.
        self.client
            .post(self.endpoint.clone())
            .form(&form)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| WatchError::NotifyFailed(e.without_url().to_string()))?;
        Ok(())
    }
}
