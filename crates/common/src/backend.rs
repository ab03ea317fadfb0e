//! HTTP client for the topology/preferences backend.

use crate::topology::{FieldDoc, ZoneDoc};
use anyhow::{bail, Context, Result};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Process-wide user preferences.  Unknown keys are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moisture_threshold: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build backend http client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // -- zones ------------------------------------------------------------

    pub async fn get_zones(&self) -> Result<Vec<ZoneDoc>> {
        let url = self.url("/zones");
        let resp = self.http.get(&url).send().await.with_context(|| format!("GET {url}"))?;
        let resp = expect_success(resp, "GET /zones")?;
        resp.json().await.context("invalid zone list from backend")
    }

    pub async fn get_zone(&self, zone_id: &str) -> Result<Option<ZoneDoc>> {
        let url = self.url(&format!("/zones/{zone_id}"));
        let resp = self.http.get(&url).send().await.with_context(|| format!("GET {url}"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = expect_success(resp, "GET /zones/{id}")?;
        let zone = resp
            .json()
            .await
            .with_context(|| format!("invalid zone document for '{zone_id}'"))?;
        Ok(Some(zone))
    }

    pub async fn add_zone(&self, zone: &ZoneDoc) -> Result<()> {
        let url = self.url("/zones");
        let resp = self
            .http
            .post(&url)
            .json(zone)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        expect_success(resp, "POST /zones")?;
        Ok(())
    }

    pub async fn add_field(&self, zone_id: &str, field: &FieldDoc) -> Result<()> {
        let url = self.url(&format!("/zones/{zone_id}/fields"));
        let resp = self
            .http
            .post(&url)
            .json(field)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        expect_success(resp, "POST /zones/{id}/fields")?;
        Ok(())
    }

    // -- preferences ------------------------------------------------------

    pub async fn get_preferences(&self) -> Result<Option<Preferences>> {
        let url = self.url("/preferences");
        let resp = self.http.get(&url).send().await.with_context(|| format!("GET {url}"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = expect_success(resp, "GET /preferences")?;
        let prefs = resp.json().await.context("invalid preferences document")?;
        Ok(Some(prefs))
    }

    pub async fn create_preferences(&self, prefs: &Preferences) -> Result<()> {
        let url = self.url("/preferences");
        let resp = self
            .http
            .post(&url)
            .json(prefs)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        expect_status(resp, StatusCode::CREATED, "POST /preferences")
    }

    pub async fn update_preferences(&self, prefs: &Preferences) -> Result<()> {
        let url = self.url("/preferences");
        let resp = self
            .http
            .put(&url)
            .json(prefs)
            .send()
            .await
            .with_context(|| format!("PUT {url}"))?;
        expect_status(resp, StatusCode::OK, "PUT /preferences")
    }

    pub async fn delete_preferences(&self) -> Result<()> {
        let url = self.url("/preferences");
        let resp = self
            .http
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("DELETE {url}"))?;
        expect_status(resp, StatusCode::NO_CONTENT, "DELETE /preferences")
    }
}

fn expect_success(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if !status.is_success() {
        bail!("{what} failed with status {status}");
    }
    Ok(resp)
}

fn expect_status(resp: Response, expected: StatusCode, what: &str) -> Result<()> {
    let status = resp.status();
    if status != expected {
        bail!("{what} returned {status}, expected {expected}");
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
