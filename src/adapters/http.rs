use crate::config::RemoteRelayConfig;
use crate::mirror::{MirrorError, RelayEndpoint};
use reqwest::blocking::Client;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Remote relay switched by plain HTTP GETs on its on/off URLs.
pub struct HttpRelayEndpoint {
    client: Client,
    on_url: String,
    off_url: String,
}

impl HttpRelayEndpoint {
    pub fn new(config: &RemoteRelayConfig) -> Result<Self, MirrorError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MirrorError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            on_url: config.url(true),
            off_url: config.url(false),
        })
    }
}

impl RelayEndpoint for HttpRelayEndpoint {
    fn command(&mut self, on: bool) -> Result<(), MirrorError> {
        let url = if on { &self.on_url } else { &self.off_url };
        debug!(%url, "remote relay request");
        let response = self
            .client
            .get(url.as_str())
            .send()
            .map_err(|e| MirrorError::Unreachable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(MirrorError::Status(status.as_u16()))
        }
    }
}
