/// Settings transport: the link to the host that owns the settings UI.
///
/// At startup it may supply a full remote snapshot; afterwards local edits
/// are mirrored back to it one field at a time.  Updates pushed by the host
/// arrive as `settings_update` requests over the socket or HTTP API.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use busy_proto::config::TransportConfig;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use tracing::{debug, info};

pub trait SettingsTransport: Send + Sync + 'static {
    /// Initial remote snapshot, if the host has one.
    fn fetch_initial(&self) -> BoxFuture<'static, anyhow::Result<Option<Value>>>;
    /// Publish one locally edited field.
    fn publish(&self, key: &str, value: &Value) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// Used when no settings host is configured.
pub struct NullTransport;

impl SettingsTransport for NullTransport {
    fn fetch_initial(&self) -> BoxFuture<'static, anyhow::Result<Option<Value>>> {
        futures_util::future::ready(Ok(None)).boxed()
    }

    fn publish(&self, key: &str, _value: &Value) -> BoxFuture<'static, anyhow::Result<()>> {
        debug!("transport: no host configured, not publishing {}", key);
        futures_util::future::ready(Ok(())).boxed()
    }
}

/// JSON over HTTP: `GET <url>` returns the snapshot, `POST <url>` with a
/// one-field object publishes an edit.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building settings transport client")?;
        Ok(Self { client, url: url.into() })
    }
}

impl SettingsTransport for HttpTransport {
    fn fetch_initial(&self) -> BoxFuture<'static, anyhow::Result<Option<Value>>> {
        let request = self.client.get(&self.url);
        let url = self.url.clone();
        async move {
            let resp = request.send().await.with_context(|| format!("GET {}", url))?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let body: Value = resp
                .error_for_status()?
                .json()
                .await
                .with_context(|| format!("decoding settings from {}", url))?;
            Ok((!body.is_null()).then_some(body))
        }
        .boxed()
    }

    fn publish(&self, key: &str, value: &Value) -> BoxFuture<'static, anyhow::Result<()>> {
        let mut body = Map::new();
        body.insert(key.to_string(), value.clone());
        let request = self.client.post(&self.url).json(&Value::Object(body));
        let url = self.url.clone();
        async move {
            request
                .send()
                .await
                .with_context(|| format!("POST {}", url))?
                .error_for_status()?;
            Ok(())
        }
        .boxed()
    }
}

pub fn from_config(config: &TransportConfig) -> anyhow::Result<Arc<dyn SettingsTransport>> {
    match &config.settings_url {
        Some(url) => {
            info!("transport: settings host at {}", url);
            let transport = HttpTransport::new(url.clone(), Duration::from_secs(config.timeout_secs))?;
            Ok(Arc::new(transport))
        }
        None => Ok(Arc::new(NullTransport)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_transport_has_no_snapshot() {
        let transport = NullTransport;
        assert!(transport.fetch_initial().await.unwrap().is_none());
        transport.publish("globalVolume", &Value::from(0.5)).await.unwrap();
    }

    #[test]
    fn test_from_config_without_url_is_null() {
        let config = TransportConfig::default();
        assert!(from_config(&config).is_ok());
    }
}
