//! The resource pool: single source of truth for assignment state.
//!
//! All resources live behind one async mutex. Bind and unbind are whole
//! operations under that lock, and `claim_healthy` selects and binds in
//! the same critical section so two concurrent identity creations for the
//! same country can never receive the same resource.

use crate::geo::GeoLookup;
use crate::health::{ProbeOutcome, probe_resource};
use crate::resource::{Assignment, Resource, ResourceSpec};
use anyhow::{Result, bail};
use avy_config::ResourcePoolConfig;
use avy_core::{AppError, ResourceStatus};
use avy_store::{RecordStore, collections};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Emitted by the sweep when a bound resource crosses the failure
/// threshold. The identity pool decides what to do; the sweep never
/// unbinds anything itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationRequest {
    pub resource_id: String,
    pub identity_id: String,
    pub consecutive_failures: u32,
}

struct PoolInner {
    /// Insertion order is load-bearing: it breaks ranking ties.
    resources: Vec<Resource>,
}

/// Pool of egress resources with health tracking.
pub struct ResourcePool {
    inner: Mutex<PoolInner>,
    store: RecordStore,
    config: ResourcePoolConfig,
    geo: Arc<dyn GeoLookup>,
    rotation_tx: mpsc::UnboundedSender<RotationRequest>,
}

impl ResourcePool {
    /// Create a pool, restoring any persisted resources from the store.
    ///
    /// Returns the receiver half of the rotation-request channel; the
    /// identity pool drains it.
    pub fn open(
        store: RecordStore,
        config: ResourcePoolConfig,
        geo: Arc<dyn GeoLookup>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RotationRequest>)> {
        let restored: Vec<Resource> = store.list(collections::RESOURCES)?;
        if !restored.is_empty() {
            info!(count = restored.len(), "Restored resources from store");
        }
        let (rotation_tx, rotation_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            inner: Mutex::new(PoolInner { resources: restored }),
            store,
            config,
            geo,
            rotation_tx,
        });
        Ok((pool, rotation_rx))
    }

    /// Register one endpoint. Geolocation failure falls back to the
    /// supplier's country hint and the default timezone; registration
    /// itself never fails on lookup errors.
    pub async fn register(&self, spec: ResourceSpec) -> Result<Resource> {
        let profile = match self.geo.lookup(&spec.host).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!(host = %spec.host, %err, "Geolocation failed; using fallback profile");
                crate::geo::GeoProfile::fallback(&spec.country_hint, &self.config.default_timezone)
            }
        };
        let resource = Resource::from_spec(&spec, profile.country, profile.timezone, profile.isp);

        let mut inner = self.inner.lock().await;
        self.store
            .put(collections::RESOURCES, &resource.id, &resource)?;
        inner.resources.push(resource.clone());
        debug!(resource = %resource.id, country = %resource.country, "Registered resource");
        Ok(resource)
    }

    /// Register a whole supplier batch, returning the created resources.
    pub async fn register_all(&self, specs: Vec<ResourceSpec>) -> Result<Vec<Resource>> {
        let mut created = Vec::with_capacity(specs.len());
        for spec in specs {
            created.push(self.register(spec).await?);
        }
        Ok(created)
    }

    /// Remove a resource. Rejected while it is bound: the owning identity
    /// must release it first.
    pub async fn remove(&self, resource_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let idx = inner
            .resources
            .iter()
            .position(|r| r.id == resource_id)
            .ok_or_else(|| AppError::not_found("resource", resource_id))?;
        if let Some(owner) = inner.resources[idx].assignment.owner() {
            bail!(
                "Cannot delete resource '{}': bound to identity '{}'",
                resource_id,
                owner
            );
        }
        inner.resources.remove(idx);
        self.store.remove(collections::RESOURCES, resource_id)?;
        Ok(())
    }

    /// Free resources for a country whose status is not `Error`.
    pub async fn available(&self, country: &str) -> Vec<Resource> {
        let inner = self.inner.lock().await;
        inner
            .resources
            .iter()
            .filter(|r| Self::is_candidate(r, country))
            .cloned()
            .collect()
    }

    /// Free, non-errored resources for a country ranked by success rate
    /// (desc) then average latency (asc); ties stay in insertion order.
    pub async fn healthiest(&self, country: &str, limit: usize) -> Vec<Resource> {
        let inner = self.inner.lock().await;
        let mut candidates: Vec<&Resource> = inner
            .resources
            .iter()
            .filter(|r| Self::is_candidate(r, country))
            .collect();
        candidates.sort_by(|a, b| rank(a, b));
        candidates.into_iter().take(limit).cloned().collect()
    }

    fn is_candidate(resource: &Resource, country: &str) -> bool {
        resource.country == country
            && resource.status != ResourceStatus::Error
            && resource.assignment.is_free()
    }

    /// Bind a specific resource to an identity. Fails if the resource is
    /// missing or already bound (to anyone, including the same identity).
    pub async fn bind(&self, resource_id: &str, identity_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let resource = inner
            .resources
            .iter_mut()
            .find(|r| r.id == resource_id)
            .ok_or_else(|| AppError::not_found("resource", resource_id))?;
        if let Some(owner) = resource.assignment.owner() {
            bail!(
                "Resource '{}' is already bound to identity '{}'",
                resource_id,
                owner
            );
        }
        resource.assignment = Assignment::Bound(identity_id.to_string());
        let snapshot = resource.clone();
        self.store
            .put(collections::RESOURCES, resource_id, &snapshot)?;
        debug!(resource = %resource_id, identity = %identity_id, "Bound resource");
        Ok(())
    }

    /// Release a resource back to the pool. Only the bound owner may
    /// release; releasing a free resource is an error (it signals a
    /// bookkeeping bug in the caller).
    pub async fn release(&self, resource_id: &str, identity_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let resource = inner
            .resources
            .iter_mut()
            .find(|r| r.id == resource_id)
            .ok_or_else(|| AppError::not_found("resource", resource_id))?;
        match resource.assignment.owner() {
            Some(owner) if owner == identity_id => {
                resource.assignment = Assignment::Free;
            }
            Some(owner) => bail!(
                "Resource '{}' is bound to identity '{}', not '{}'",
                resource_id,
                owner,
                identity_id
            ),
            None => bail!("Resource '{}' is not bound", resource_id),
        }
        let snapshot = resource.clone();
        self.store
            .put(collections::RESOURCES, resource_id, &snapshot)?;
        debug!(resource = %resource_id, identity = %identity_id, "Released resource");
        Ok(())
    }

    /// Select the healthiest free resource for a country and bind it to
    /// `identity_id`, all inside one critical section.
    ///
    /// Returns `AppError::NoResourceAvailable` when nothing qualifies.
    pub async fn claim_healthy(&self, country: &str, identity_id: &str) -> Result<Resource> {
        let mut inner = self.inner.lock().await;
        let best_id = {
            let mut candidates: Vec<&Resource> = inner
                .resources
                .iter()
                .filter(|r| Self::is_candidate(r, country))
                .collect();
            candidates.sort_by(|a, b| rank(a, b));
            match candidates.first() {
                Some(r) => r.id.clone(),
                None => return Err(AppError::NoResourceAvailable(country.to_string()).into()),
            }
        };

        let resource = inner
            .resources
            .iter_mut()
            .find(|r| r.id == best_id)
            .expect("candidate id came from this vec");
        resource.assignment = Assignment::Bound(identity_id.to_string());
        let snapshot = resource.clone();
        self.store.put(collections::RESOURCES, &best_id, &snapshot)?;
        debug!(resource = %best_id, identity = %identity_id, country, "Claimed resource");
        Ok(snapshot)
    }

    /// Record one probe outcome: counters, rolling latency, and status.
    ///
    /// A bound resource crossing the failure threshold produces a
    /// rotation request instead of being touched here; force-unbinding
    /// from the sweep would race the bind/unbind invariant.
    pub async fn record_probe_outcome(&self, resource_id: &str, outcome: &ProbeOutcome) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let resource = inner
            .resources
            .iter_mut()
            .find(|r| r.id == resource_id)
            .ok_or_else(|| AppError::not_found("resource", resource_id))?;

        if outcome.healthy {
            resource.success_count += 1;
            resource.consecutive_failures = 0;
            resource.avg_latency_ms = if resource.avg_latency_ms == 0.0 {
                outcome.latency_ms
            } else {
                (resource.avg_latency_ms + outcome.latency_ms) / 2.0
            };
            resource.status = if resource.success_rate() < 0.5 {
                ResourceStatus::Degraded
            } else {
                ResourceStatus::Active
            };
        } else {
            resource.failure_count += 1;
            resource.consecutive_failures += 1;
            resource.status = ResourceStatus::Error;

            if resource.consecutive_failures >= self.config.failure_threshold {
                if let Some(owner) = resource.assignment.owner() {
                    let request = RotationRequest {
                        resource_id: resource.id.clone(),
                        identity_id: owner.to_string(),
                        consecutive_failures: resource.consecutive_failures,
                    };
                    // Receiver gone means nobody rotates; log and move on.
                    if self.rotation_tx.send(request).is_err() {
                        warn!(resource = %resource_id, "Rotation request dropped: no receiver");
                    }
                }
            }
        }

        let snapshot = resource.clone();
        self.store
            .put(collections::RESOURCES, resource_id, &snapshot)?;
        Ok(())
    }

    /// Probe every resource once and record the outcomes.
    ///
    /// Probes run outside the pool lock so a slow endpoint never blocks
    /// bind/unbind or worker dispatch.
    pub async fn sweep_once(&self) -> Result<()> {
        let snapshot: Vec<Resource> = {
            let inner = self.inner.lock().await;
            inner.resources.clone()
        };

        for resource in snapshot {
            let outcome = probe_resource(&resource, &self.config).await;
            // The resource may have been removed mid-sweep; that is fine.
            if let Err(err) = self.record_probe_outcome(&resource.id, &outcome).await {
                debug!(resource = %resource.id, %err, "Skipping probe record");
            }
        }
        Ok(())
    }

    /// Start the periodic health sweep. Cancel the returned token to stop.
    pub fn start_sweep(self: &Arc<Self>) -> CancellationToken {
        let cancel = CancellationToken::new();
        let pool = Arc::clone(self);
        let token = cancel.clone();
        let period = Duration::from_secs(self.config.health_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The immediate first tick would probe before anything is
            // registered; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = pool.sweep_once().await {
                            warn!(%err, "Health sweep failed");
                        }
                    }
                }
            }
        });
        cancel
    }

    /// Clone of the full resource list, for diagnostics and tests.
    pub async fn snapshot(&self) -> Vec<Resource> {
        let inner = self.inner.lock().await;
        inner.resources.clone()
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.resources.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Ranking for `healthiest`/`claim_healthy`: success rate descending,
/// then average latency ascending. The surrounding stable sort preserves
/// insertion order on exact ties.
fn rank(a: &Resource, b: &Resource) -> std::cmp::Ordering {
    b.success_rate()
        .partial_cmp(&a.success_rate())
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(
            a.avg_latency_ms
                .partial_cmp(&b.avg_latency_ms)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::FallbackGeoLookup;
    use avy_core::ProxyProtocol;
    use tempfile::tempdir;

    fn spec(host: &str, country: &str) -> ResourceSpec {
        ResourceSpec {
            host: host.into(),
            port: 8080,
            username: "u".into(),
            password: "p".into(),
            protocol: ProxyProtocol::Http,
            country_hint: country.into(),
        }
    }

    async fn pool_in(
        dir: &std::path::Path,
    ) -> (Arc<ResourcePool>, mpsc::UnboundedReceiver<RotationRequest>) {
        let store = RecordStore::open(dir).unwrap();
        let config = ResourcePoolConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        ResourcePool::open(store, config, Arc::new(FallbackGeoLookup)).unwrap()
    }

    #[tokio::test]
    async fn test_register_uses_fallback_geo() {
        let temp = tempdir().unwrap();
        let (pool, _rx) = pool_in(temp.path()).await;
        let resource = pool.register(spec("1.2.3.4", "us")).await.unwrap();
        assert_eq!(resource.country, "us");
        assert_eq!(resource.timezone, "UTC");
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_available_filters_by_country_and_assignment() {
        let temp = tempdir().unwrap();
        let (pool, _rx) = pool_in(temp.path()).await;
        let us = pool.register(spec("1.1.1.1", "us")).await.unwrap();
        pool.register(spec("2.2.2.2", "gb")).await.unwrap();

        assert_eq!(pool.available("us").await.len(), 1);
        assert_eq!(pool.available("gb").await.len(), 1);
        assert!(pool.available("de").await.is_empty());

        pool.bind(&us.id, "ident-1").await.unwrap();
        assert!(pool.available("us").await.is_empty());
    }

    #[tokio::test]
    async fn test_bind_rejects_double_bind() {
        let temp = tempdir().unwrap();
        let (pool, _rx) = pool_in(temp.path()).await;
        let r = pool.register(spec("1.1.1.1", "us")).await.unwrap();

        pool.bind(&r.id, "a").await.unwrap();
        let err = pool.bind(&r.id, "b").await.unwrap_err();
        assert!(err.to_string().contains("already bound"));

        // Still bound to the original owner.
        let snap = pool.snapshot().await;
        assert_eq!(snap[0].assignment.owner(), Some("a"));
    }

    #[tokio::test]
    async fn test_release_requires_owner() {
        let temp = tempdir().unwrap();
        let (pool, _rx) = pool_in(temp.path()).await;
        let r = pool.register(spec("1.1.1.1", "us")).await.unwrap();
        pool.bind(&r.id, "a").await.unwrap();

        assert!(pool.release(&r.id, "b").await.is_err());
        pool.release(&r.id, "a").await.unwrap();
        assert!(pool.release(&r.id, "a").await.is_err());
    }

    #[tokio::test]
    async fn test_claim_healthy_picks_best_and_binds() {
        let temp = tempdir().unwrap();
        let (pool, _rx) = pool_in(temp.path()).await;
        let slow = pool.register(spec("1.1.1.1", "us")).await.unwrap();
        let fast = pool.register(spec("2.2.2.2", "us")).await.unwrap();

        pool.record_probe_outcome(&slow.id, &ProbeOutcome::healthy(400.0))
            .await
            .unwrap();
        pool.record_probe_outcome(&fast.id, &ProbeOutcome::healthy(50.0))
            .await
            .unwrap();

        let claimed = pool.claim_healthy("us", "ident-1").await.unwrap();
        assert_eq!(claimed.id, fast.id);
        assert_eq!(claimed.assignment.owner(), Some("ident-1"));

        // Second claim gets the remaining resource.
        let second = pool.claim_healthy("us", "ident-2").await.unwrap();
        assert_eq!(second.id, slow.id);

        // Third claim finds nothing.
        let err = pool.claim_healthy("us", "ident-3").await.unwrap_err();
        let app = err.downcast_ref::<AppError>().unwrap();
        assert!(matches!(app, AppError::NoResourceAvailable(c) if c == "us"));
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_share_a_resource() {
        let temp = tempdir().unwrap();
        let (pool, _rx) = pool_in(temp.path()).await;
        for i in 0..4 {
            pool.register(spec(&format!("10.0.0.{i}"), "us")).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.claim_healthy("us", &format!("ident-{i}")).await
            }));
        }

        let mut claimed_ids = Vec::new();
        let mut failures = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(resource) => claimed_ids.push(resource.id),
                Err(_) => failures += 1,
            }
        }

        // 4 resources, 8 claimants: exactly 4 of each, no duplicates.
        assert_eq!(claimed_ids.len(), 4);
        assert_eq!(failures, 4);
        claimed_ids.sort();
        claimed_ids.dedup();
        assert_eq!(claimed_ids.len(), 4);
    }

    #[tokio::test]
    async fn test_probe_failure_flips_status_and_back() {
        let temp = tempdir().unwrap();
        let (pool, _rx) = pool_in(temp.path()).await;
        let r = pool.register(spec("1.1.1.1", "us")).await.unwrap();

        pool.record_probe_outcome(&r.id, &ProbeOutcome::unhealthy("refused"))
            .await
            .unwrap();
        assert_eq!(pool.snapshot().await[0].status, ResourceStatus::Error);
        // Errored resources disappear from selection.
        assert!(pool.available("us").await.is_empty());

        pool.record_probe_outcome(&r.id, &ProbeOutcome::healthy(10.0))
            .await
            .unwrap();
        let snap = &pool.snapshot().await[0];
        // 1 success / 2 probes = 0.5 rate, back off the error status.
        assert_ne!(snap.status, ResourceStatus::Error);
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_rolling_latency_average() {
        let temp = tempdir().unwrap();
        let (pool, _rx) = pool_in(temp.path()).await;
        let r = pool.register(spec("1.1.1.1", "us")).await.unwrap();

        pool.record_probe_outcome(&r.id, &ProbeOutcome::healthy(100.0))
            .await
            .unwrap();
        pool.record_probe_outcome(&r.id, &ProbeOutcome::healthy(50.0))
            .await
            .unwrap();
        let snap = &pool.snapshot().await[0];
        assert!((snap.avg_latency_ms - 75.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_bound_resource_crossing_threshold_requests_rotation() {
        let temp = tempdir().unwrap();
        let (pool, mut rx) = pool_in(temp.path()).await;
        let r = pool.register(spec("1.1.1.1", "us")).await.unwrap();
        pool.bind(&r.id, "ident-1").await.unwrap();

        // Threshold is 2 in the test config.
        pool.record_probe_outcome(&r.id, &ProbeOutcome::unhealthy("down"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        pool.record_probe_outcome(&r.id, &ProbeOutcome::unhealthy("down"))
            .await
            .unwrap();

        let request = rx.try_recv().unwrap();
        assert_eq!(request.resource_id, r.id);
        assert_eq!(request.identity_id, "ident-1");
        assert_eq!(request.consecutive_failures, 2);

        // Still bound: the sweep never unbinds.
        assert_eq!(pool.snapshot().await[0].assignment.owner(), Some("ident-1"));
    }

    #[tokio::test]
    async fn test_unbound_resource_crossing_threshold_stays_quiet() {
        let temp = tempdir().unwrap();
        let (pool, mut rx) = pool_in(temp.path()).await;
        let r = pool.register(spec("1.1.1.1", "us")).await.unwrap();

        for _ in 0..3 {
            pool.record_probe_outcome(&r.id, &ProbeOutcome::unhealthy("down"))
                .await
                .unwrap();
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_rejects_bound_resource() {
        let temp = tempdir().unwrap();
        let (pool, _rx) = pool_in(temp.path()).await;
        let r = pool.register(spec("1.1.1.1", "us")).await.unwrap();
        pool.bind(&r.id, "ident-1").await.unwrap();

        let err = pool.remove(&r.id).await.unwrap_err();
        assert!(err.to_string().contains("bound to identity"));

        pool.release(&r.id, "ident-1").await.unwrap();
        pool.remove(&r.id).await.unwrap();
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let temp = tempdir().unwrap();
        let id = {
            let (pool, _rx) = pool_in(temp.path()).await;
            let r = pool.register(spec("1.1.1.1", "us")).await.unwrap();
            pool.bind(&r.id, "ident-1").await.unwrap();
            r.id
        };

        // Reopen over the same directory.
        let (pool, _rx) = pool_in(temp.path()).await;
        let snap = pool.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id, id);
        assert_eq!(snap[0].assignment.owner(), Some("ident-1"));
    }

    #[tokio::test]
    async fn test_healthiest_tie_breaks_by_insertion_order() {
        let temp = tempdir().unwrap();
        let (pool, _rx) = pool_in(temp.path()).await;
        let first = pool.register(spec("1.1.1.1", "us")).await.unwrap();
        let _second = pool.register(spec("2.2.2.2", "us")).await.unwrap();

        // Identical stats: the earlier registration wins.
        let ranked = pool.healthiest("us", 2).await;
        assert_eq!(ranked[0].id, first.id);
    }
}
