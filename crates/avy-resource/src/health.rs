//! Health probing for egress resources.
//!
//! A probe fetches a small URL through the resource with its own timeout,
//! so one slow endpoint never stalls the sweep. TLS/certificate errors on
//! the tunnel are classified separately from hard connection failures:
//! intercepting proxies routinely present their own certificates, and the
//! (configurable) lenient policy counts those probes as healthy.

use crate::resource::Resource;
use avy_config::ResourcePoolConfig;
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of one reachability probe.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub healthy: bool,
    /// Round-trip time; only meaningful when `healthy`.
    pub latency_ms: f64,
    pub detail: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy(latency_ms: f64) -> Self {
        Self {
            healthy: true,
            latency_ms,
            detail: None,
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: 0.0,
            detail: Some(detail.into()),
        }
    }
}

/// Probe one resource by fetching `config.probe_url` through it.
pub async fn probe_resource(resource: &Resource, config: &ResourcePoolConfig) -> ProbeOutcome {
    let proxy = match reqwest::Proxy::all(resource.proxy_url()) {
        Ok(p) => p,
        Err(err) => return ProbeOutcome::unhealthy(format!("invalid proxy url: {err}")),
    };

    let client = match reqwest::Client::builder()
        .proxy(proxy)
        .timeout(Duration::from_secs(config.probe_timeout_secs))
        .build()
    {
        Ok(c) => c,
        Err(err) => return ProbeOutcome::unhealthy(format!("client build failed: {err}")),
    };

    let started = Instant::now();
    match client.get(&config.probe_url).send().await {
        Ok(_) => {
            let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
            debug!(resource = %resource.id, latency_ms, "Probe succeeded");
            ProbeOutcome::healthy(latency_ms)
        }
        Err(err) => {
            let message = full_error_chain(&err);
            if config.tls_errors_are_healthy && is_tls_error(&message) {
                // The tunnel answered; the proxy is intercepting certs.
                let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
                debug!(resource = %resource.id, error = %message, "TLS error treated as healthy");
                ProbeOutcome::healthy(latency_ms)
            } else {
                debug!(resource = %resource.id, error = %message, "Probe failed");
                ProbeOutcome::unhealthy(message)
            }
        }
    }
}

/// Whether an error message describes a TLS/certificate problem on the
/// tunnel rather than a hard connection failure.
pub fn is_tls_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn full_error_chain(err: &reqwest::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}
