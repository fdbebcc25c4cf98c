//! Geolocation lookup for registered resources.
//!
//! A lookup failure never fails registration: the pool falls back to the
//! supplier's country hint and the configured default timezone.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Apparent location of an egress endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoProfile {
    pub country: String,
    pub timezone: String,
    #[serde(default)]
    pub isp: Option<String>,
}

impl GeoProfile {
    /// Fixed fallback used when the external service is unreachable.
    pub fn fallback(country_hint: &str, default_timezone: &str) -> Self {
        Self {
            country: country_hint.to_string(),
            timezone: default_timezone.to_string(),
            isp: None,
        }
    }
}

/// Seam for the external geolocation service, so tests can stub it.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, host: &str) -> Result<GeoProfile>;
}

/// HTTP-backed lookup against an ip-api style endpoint returning
/// `{"countryCode": "...", "timezone": "...", "isp": "..."}`.
pub struct HttpGeoLookup {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    #[serde(rename = "countryCode")]
    country_code: String,
    timezone: String,
    #[serde(default)]
    isp: Option<String>,
}

impl HttpGeoLookup {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build geolocation client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl GeoLookup for HttpGeoLookup {
    async fn lookup(&self, host: &str) -> Result<GeoProfile> {
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), host);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Geolocation request failed for {host}"))?
            .error_for_status()
            .with_context(|| format!("Geolocation service rejected lookup for {host}"))?;
        let body: GeoResponse = response
            .json()
            .await
            .with_context(|| format!("Geolocation response for {host} was not decodable"))?;
        Ok(GeoProfile {
            country: body.country_code.to_ascii_lowercase(),
            timezone: body.timezone,
            isp: body.isp,
        })
    }
}

/// Lookup that always fails, forcing the fallback profile. Used where no
/// external service is configured (and in tests).
pub struct FallbackGeoLookup;

#[async_trait]
impl GeoLookup for FallbackGeoLookup {
    async fn lookup(&self, _host: &str) -> Result<GeoProfile> {
        anyhow::bail!("no geolocation service configured")
    }
}
