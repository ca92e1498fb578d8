//! Client for the annotation API.
//!
//! Resolves the API's base URL through the discovery endpoint once per
//! client, then talks to `{base}{prefix}/annotations`.
//!
//! The discovered URL lives in a single-slot cache that is filled by the
//! first successful discovery and never expires. A failed discovery is not
//! cached: the call falls back to the origin the client was created with,
//! and the next call tries discovery again.

use agentation_core::models::{Annotation, AnnotationFields, AnnotationPatch};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::debug;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscoveryResponse {
    #[serde(default)]
    api_url: Option<String>,
}

pub struct SyncClient {
    http: reqwest::Client,
    origin: String,
    prefix: String,
    api_url: OnceCell<String>,
}

impl SyncClient {
    /// `origin` is where the dev server answers discovery, e.g.
    /// `http://localhost:5173`; `prefix` is the API prefix, e.g. `/api`.
    pub fn new(origin: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            origin: origin.into().trim_end_matches('/').to_string(),
            prefix: prefix.into().trim_end_matches('/').to_string(),
            api_url: OnceCell::new(),
        }
    }

    /// The cached base URL, if discovery has succeeded.
    pub fn cached_base_url(&self) -> Option<&str> {
        self.api_url.get().map(String::as_str)
    }

    /// Best base URL for API calls.
    pub async fn base_url(&self) -> String {
        if let Some(url) = self.api_url.get() {
            return url.clone();
        }
        match self.discover().await {
            Ok(url) => {
                let _ = self.api_url.set(url.clone());
                url
            }
            Err(e) => {
                debug!(error = %e, origin = %self.origin, "API discovery failed; using origin");
                self.origin.clone()
            }
        }
    }

    async fn discover(&self) -> Result<String> {
        let url = format!("{}{}/config", self.origin, self.prefix);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            bail!("discovery returned {}", resp.status());
        }
        let body: DiscoveryResponse = resp.json().await?;
        match body.api_url.filter(|u| !u.is_empty()) {
            Some(u) => Ok(u.trim_end_matches('/').to_string()),
            None => bail!("discovery response has no apiUrl"),
        }
    }

    async fn endpoint(&self) -> String {
        format!("{}{}/annotations", self.base_url().await, self.prefix)
    }

    /// Every stored annotation.
    pub async fn list(&self) -> Result<Vec<Annotation>> {
        let resp = self.http.get(self.endpoint().await).send().await?;
        let resp = check(resp, "fetch annotations")?;
        resp.json().await.context("Failed to decode annotation list")
    }

    /// Stores a new annotation by sending an `annotation.add` event.
    ///
    /// `id` is optional; the server generates one when it is `None`.
    pub async fn create(&self, id: Option<&str>, fields: &AnnotationFields) -> Result<Annotation> {
        let mut payload = serde_json::to_value(fields)?;
        if let (Some(id), Some(obj)) = (id, payload.as_object_mut()) {
            obj.insert("id".to_string(), json!(id));
        }
        let envelope = json!({ "event": "annotation.add", "annotation": payload });

        let resp = self
            .http
            .post(self.endpoint().await)
            .json(&envelope)
            .send()
            .await?;
        let resp = check(resp, "sync annotation")?;
        resp.json().await.context("Failed to decode stored annotation")
    }

    pub async fn update(&self, id: &str, patch: &AnnotationPatch) -> Result<Annotation> {
        let mut payload = serde_json::to_value(patch)?;
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("id".to_string(), json!(id));
        }
        let resp = self
            .http
            .patch(self.endpoint().await)
            .json(&payload)
            .send()
            .await?;
        let resp = check(resp, "update annotation")?;
        resp.json().await.context("Failed to decode updated annotation")
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.endpoint().await)
            .query(&[("id", id)])
            .send()
            .await?;
        check(resp, "delete annotation")?;
        Ok(())
    }
}

fn check(resp: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        bail!("Failed to {}: {}", action, resp.status())
    }
}
