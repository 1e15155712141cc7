use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use async_trait::async_trait;
use nanoid::nanoid;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// One live connection to a remote device. The drive core only ever holds
/// the identifier; the device itself lives with the backend and is never
/// destroyed from here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at_ms: u128,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at_ms: epoch_ms(),
        }
    }
}

/// A still image of device state. Each capture supersedes the previous one;
/// nothing downstream holds more than the latest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScreenCapture {
    pub id: String,
    /// Inline data URI or fetchable URL, passed through to the prediction
    /// service untouched.
    pub uri: String,
    pub captured_at_ms: u128,
}

impl ScreenCapture {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            id: nanoid!(),
            uri: uri.into(),
            captured_at_ms: epoch_ms(),
        }
    }
}

pub(crate) fn epoch_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Requested screenshot encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    /// Inline `data:` URI, ready to feed straight into the prediction
    /// service.
    #[default]
    Base64,
    /// Short-lived URL hosted by the backend.
    Url,
}

/// Clip rectangle in device pixels.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CaptureClip {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CaptureOptions {
    pub format: CaptureFormat,
    pub clip: Option<CaptureClip>,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not supported by this backend: {0}")]
    Unsupported(String),
    #[error("device backend error: {0}")]
    Backend(String),
}

/// Capability contract of the device-automation backend. Everything the
/// drive core asks of a device goes through this seam, so tests can swap in
/// a scripted fake and a different sandbox vendor only has to implement
/// this trait.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Provision a fresh device and return its session.
    async fn create_session(&self) -> Result<Session, DeviceError>;

    /// Re-acquire a live session this process does not hold in memory.
    async fn resolve_session(&self, id: &str) -> Result<Session, DeviceError>;

    async fn capture(
        &self,
        session_id: &str,
        opts: CaptureOptions,
    ) -> Result<ScreenCapture, DeviceError>;

    async fn click(&self, session_id: &str, x: i64, y: i64) -> Result<(), DeviceError>;

    async fn type_text(&self, session_id: &str, text: &str) -> Result<(), DeviceError>;

    async fn press_keys(&self, session_id: &str, keys: &[String]) -> Result<(), DeviceError>;

    /// Physical display size in pixels. Backends without the query answer
    /// `Unsupported`.
    async fn screen_size(&self, session_id: &str) -> Result<(u32, u32), DeviceError>;
}

/// Shared map of the sessions known to this process, keyed by backend id.
/// Clones share the underlying store. Re-registering an id overwrites the
/// previous entry.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session: Session) {
        self.inner.lock().await.insert(session.id.clone(), session);
    }

    pub async fn lookup(&self, id: &str) -> Option<Session> {
        self.inner.lock().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[derive(Clone)]
pub struct SandboxConfig {
    /// Base URL of the sandbox REST API, e.g. `https://api.example.dev/v1`.
    pub api_base: String,
    pub api_key: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("SANDBOX_BASE_URL").unwrap_or_default(),
            api_key: env::var("SANDBOX_API_KEY").unwrap_or_default(),
        }
    }
}

/// REST client for the hosted Android sandbox.
#[derive(Clone)]
pub struct SandboxClient {
    http: Client,
    cfg: SandboxConfig,
}

impl SandboxClient {
    pub fn new(cfg: SandboxConfig) -> Result<Self> {
        if cfg.api_base.is_empty() {
            bail!("SANDBOX_BASE_URL is not set");
        }
        if cfg.api_key.is_empty() {
            bail!("SANDBOX_API_KEY is not set");
        }
        Ok(Self {
            http: Client::new(),
            cfg,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.api_base.trim_end_matches('/'), path)
    }

    async fn get(&self, path: &str) -> Result<Value, DeviceError> {
        self.send(self.http.get(self.url(path)), path).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, DeviceError> {
        self.send(self.http.post(self.url(path)).json(&body), path)
            .await
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        path: &str,
    ) -> Result<Value, DeviceError> {
        let resp = req
            .bearer_auth(&self.cfg.api_key)
            .send()
            .await
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        match status {
            StatusCode::NOT_FOUND => Err(DeviceError::NotFound(path.to_string())),
            StatusCode::NOT_IMPLEMENTED => Err(DeviceError::Unsupported(path.to_string())),
            s if !s.is_success() => Err(DeviceError::Backend(format!("{s}: {text}"))),
            _ if text.is_empty() => Ok(Value::Null),
            _ => serde_json::from_str(&text)
                .map_err(|e| DeviceError::Backend(format!("invalid response body: {e}"))),
        }
    }
}

#[async_trait]
impl DeviceBackend for SandboxClient {
    async fn create_session(&self) -> Result<Session, DeviceError> {
        let v = self.post("boxes", json!({ "type": "android" })).await?;
        let id = v
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DeviceError::Backend("create response missing id".into()))?;
        info!(session = id, "sandbox device created");
        Ok(Session::new(id))
    }

    async fn resolve_session(&self, id: &str) -> Result<Session, DeviceError> {
        let v = self.get(&format!("boxes/{id}")).await?;
        let id = v.get("id").and_then(Value::as_str).unwrap_or(id);
        Ok(Session::new(id))
    }

    async fn capture(
        &self,
        session_id: &str,
        opts: CaptureOptions,
    ) -> Result<ScreenCapture, DeviceError> {
        let mut body = json!({ "outputFormat": opts.format });
        if let Some(clip) = opts.clip {
            body["clip"] =
                serde_json::to_value(clip).map_err(|e| DeviceError::Backend(e.to_string()))?;
        }
        let v = self
            .post(&format!("boxes/{session_id}/actions/screenshot"), body)
            .await?;
        let uri = v
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| DeviceError::Backend("screenshot response missing uri".into()))?;
        Ok(ScreenCapture::new(uri))
    }

    async fn click(&self, session_id: &str, x: i64, y: i64) -> Result<(), DeviceError> {
        self.post(
            &format!("boxes/{session_id}/actions/click"),
            json!({ "x": x, "y": y }),
        )
        .await
        .map(|_| ())
    }

    async fn type_text(&self, session_id: &str, text: &str) -> Result<(), DeviceError> {
        self.post(
            &format!("boxes/{session_id}/actions/type"),
            json!({ "text": text }),
        )
        .await
        .map(|_| ())
    }

    async fn press_keys(&self, session_id: &str, keys: &[String]) -> Result<(), DeviceError> {
        self.post(
            &format!("boxes/{session_id}/actions/press"),
            json!({ "keys": keys }),
        )
        .await
        .map(|_| ())
    }

    async fn screen_size(&self, session_id: &str) -> Result<(u32, u32), DeviceError> {
        let v = self.get(&format!("boxes/{session_id}/screen")).await?;
        let width = v.get("width").and_then(Value::as_u64);
        let height = v.get("height").and_then(Value::as_u64);
        match (width, height) {
            (Some(w), Some(h)) => Ok((w as u32, h as u32)),
            _ => Err(DeviceError::Backend(
                "screen response missing dimensions".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_register_and_lookup() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty().await);

        registry.register(Session::new("box-1")).await;
        registry.register(Session::new("box-2")).await;

        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.lookup("box-1").await.unwrap().id, "box-1");
        assert!(registry.lookup("box-3").await.is_none());

        let mut ids = registry.ids().await;
        ids.sort();
        assert_eq!(ids, vec!["box-1", "box-2"]);
    }

    #[tokio::test]
    async fn registry_last_registration_wins() {
        let registry = SessionRegistry::new();
        let first = Session::new("box-1");
        let stamp = first.created_at_ms;
        registry.register(first).await;

        let mut second = Session::new("box-1");
        second.created_at_ms = stamp + 10;
        registry.register(second).await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.lookup("box-1").await.unwrap().created_at_ms, stamp + 10);
    }

    #[tokio::test]
    async fn registry_clones_share_state() {
        let registry = SessionRegistry::new();
        let view = registry.clone();
        registry.register(Session::new("box-1")).await;
        assert_eq!(view.len().await, 1);
    }

    #[test]
    fn capture_format_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(CaptureFormat::Base64).unwrap(),
            serde_json::json!("base64")
        );
        assert_eq!(
            serde_json::to_value(CaptureFormat::Url).unwrap(),
            serde_json::json!("url")
        );
    }

    #[test]
    fn sandbox_client_requires_credentials() {
        let cfg = SandboxConfig {
            api_base: "https://api.example.dev/v1".into(),
            api_key: String::new(),
        };
        assert!(SandboxClient::new(cfg).is_err());
    }

    #[test]
    fn url_joins_without_double_slash() {
        let client = SandboxClient::new(SandboxConfig {
            api_base: "https://api.example.dev/v1/".into(),
            api_key: "test-key".into(),
        })
        .unwrap();
        assert_eq!(client.url("boxes"), "https://api.example.dev/v1/boxes");
    }
}
