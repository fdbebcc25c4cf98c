//! The identity pool: the only caller allowed to mutate resource
//! assignment state, always through the pool's atomic bind/release
//! operations. An identity that cannot get a resource is never created.

use crate::distribution::{country_distribution, draw_country};
use crate::identity::{Identity, RotationRecord};
use anyhow::{Result, bail};
use avy_config::IdentityPoolConfig;
use avy_core::{AppError, IdentityCategory};
use avy_resource::{ResourcePool, RotationRequest};
use avy_store::{RecordStore, collections};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-category population for invariant checks and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryCounts {
    pub new: usize,
    pub returning: usize,
    pub loyal: usize,
}

impl CategoryCounts {
    pub fn total(&self) -> usize {
        self.new + self.returning + self.loyal
    }
}

struct PoolInner {
    identities: Vec<Identity>,
    /// Next sequence number per country. Gaps are fine (a failed create
    /// consumes a number); duplicates are not.
    country_seq: HashMap<String, u32>,
}

/// Pool of identities, each bound to exactly one resource.
pub struct IdentityPool {
    inner: Mutex<PoolInner>,
    store: RecordStore,
    config: IdentityPoolConfig,
    resources: Arc<ResourcePool>,
}

/// Result of a best-effort bulk provision.
#[derive(Debug, Default)]
pub struct ProvisionOutcome {
    pub created: Vec<Identity>,
    /// One message per country slot that could not be filled.
    pub failures: Vec<String>,
}

impl IdentityPool {
    /// Create a pool, restoring persisted identities from the store.
    pub fn open(
        store: RecordStore,
        config: IdentityPoolConfig,
        resources: Arc<ResourcePool>,
    ) -> Result<Arc<Self>> {
        let identities: Vec<Identity> = store.list(collections::IDENTITIES)?;
        let mut country_seq: HashMap<String, u32> = HashMap::new();
        for identity in &identities {
            let next = country_seq.entry(identity.country.clone()).or_default();
            *next = (*next).max(identity.sequence);
        }
        if !identities.is_empty() {
            info!(count = identities.len(), "Restored identities from store");
        }
        Ok(Arc::new(Self {
            inner: Mutex::new(PoolInner {
                identities,
                country_seq,
            }),
            store,
            config,
            resources,
        }))
    }

    /// Create one identity: pick a country (explicit hint, else weighted
    /// draw), claim a healthy resource for it, and bind atomically.
    ///
    /// On `NoResourceAvailable` the identity is not created; the pool is
    /// left exactly as it was (no orphaned identities).
    pub async fn create(
        &self,
        category: IdentityCategory,
        country_hint: Option<&str>,
    ) -> Result<Identity> {
        let country = match country_hint {
            Some(c) => c.to_string(),
            None => {
                let mut rng = rand::thread_rng();
                draw_country(&self.config.country_weights, &mut rng)
                    .ok_or_else(|| AppError::Validation("empty country weight table".into()))?
            }
        };

        // Reserve the sequence number up front; a failed claim leaves a
        // gap, never a duplicate.
        let sequence = {
            let mut inner = self.inner.lock().await;
            let next = inner.country_seq.entry(country.clone()).or_default();
            *next += 1;
            *next
        };

        let mut identity = Identity::new(&country, sequence, category);
        let resource = self.resources.claim_healthy(&country, &identity.id).await?;
        identity.resource_id = Some(resource.id.clone());

        let mut inner = self.inner.lock().await;
        self.store
            .put(collections::IDENTITIES, &identity.id, &identity)?;
        inner.identities.push(identity.clone());
        debug!(identity = %identity.id, label = %identity.label(), resource = %resource.id, "Created identity");
        Ok(identity)
    }

    /// Bulk provision with exact geographic distribution. Best effort:
    /// slots without a free resource are reported, not fatal.
    pub async fn provision(
        &self,
        total: u32,
        category: IdentityCategory,
    ) -> Result<ProvisionOutcome> {
        let mut outcome = ProvisionOutcome::default();
        for (country, count) in country_distribution(total, &self.config.country_weights) {
            for _ in 0..count {
                match self.create(category, Some(&country)).await {
                    Ok(identity) => outcome.created.push(identity),
                    Err(err) => outcome.failures.push(format!("{country}: {err}")),
                }
            }
        }
        Ok(outcome)
    }

    /// Check out a non-active identity, preferring the requested category
    /// but falling back to any. The identity is marked active until
    /// `release` is called.
    pub async fn acquire(&self, category: Option<IdentityCategory>) -> Result<Identity> {
        let mut inner = self.inner.lock().await;
        let pick = {
            let preferred = category.and_then(|wanted| {
                inner
                    .identities
                    .iter()
                    .position(|i| !i.active && i.category == wanted)
            });
            preferred.or_else(|| inner.identities.iter().position(|i| !i.active))
        };
        let Some(idx) = pick else {
            return Err(AppError::PoolExhausted {
                category: category.map(|c| c.to_string()),
            }
            .into());
        };
        inner.identities[idx].active = true;
        let identity = inner.identities[idx].clone();
        self.store
            .put(collections::IDENTITIES, &identity.id, &identity)?;
        Ok(identity)
    }

    /// Return a checked-out identity to the pool.
    pub async fn release(&self, identity_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let identity = find_mut(&mut inner.identities, identity_id)?;
        identity.active = false;
        let snapshot = identity.clone();
        self.store
            .put(collections::IDENTITIES, identity_id, &snapshot)?;
        Ok(())
    }

    /// Record a visit outcome and evaluate the evolution rule.
    ///
    /// Categories only ever advance; regression requires an explicit
    /// `reset_category`.
    pub async fn record_outcome(&self, identity_id: &str, success: bool) -> Result<Identity> {
        let mut inner = self.inner.lock().await;
        let identity = find_mut(&mut inner.identities, identity_id)?;

        identity.metrics.visits += 1;
        if success {
            identity.metrics.successes += 1;
        }
        identity.metrics.evolution_score = identity.metrics.success_rate();

        if let Some(next) = identity.category.next() {
            let e = &self.config.evolution;
            let (min_visits, min_rate) = match next {
                IdentityCategory::Returning => (e.returning_min_visits, e.returning_min_success_rate),
                IdentityCategory::Loyal => (e.loyal_min_visits, e.loyal_min_success_rate),
                IdentityCategory::New => unreachable!("categories never advance to New"),
            };
            if identity.metrics.visits >= min_visits
                && identity.metrics.success_rate() >= min_rate
            {
                info!(identity = %identity.id, from = %identity.category, to = %next, "Identity evolved");
                identity.category = next;
            }
        }

        let snapshot = identity.clone();
        self.store
            .put(collections::IDENTITIES, identity_id, &snapshot)?;
        Ok(snapshot)
    }

    /// Explicitly reset an identity back to `New`. The only path by which
    /// a category ever regresses.
    pub async fn reset_category(&self, identity_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let identity = find_mut(&mut inner.identities, identity_id)?;
        identity.category = IdentityCategory::New;
        identity.metrics = Default::default();
        let snapshot = identity.clone();
        self.store
            .put(collections::IDENTITIES, identity_id, &snapshot)?;
        Ok(())
    }

    /// Swap the bound resource for a fresh healthy one of the same
    /// country. The old resource goes back to the pool (it is not
    /// deleted); a rotation record is appended for audit.
    pub async fn rotate_resource(&self, identity_id: &str) -> Result<Identity> {
        // The lock is held across the whole swap so a concurrent `remove`
        // cannot delete the identity between the claim and the rebind,
        // which would strand the freshly claimed resource.
        let mut inner = self.inner.lock().await;
        let country = find(&inner.identities, identity_id)?.country.clone();

        // Claim first: if no replacement exists the old binding stays.
        let new_resource = self.resources.claim_healthy(&country, identity_id).await?;

        let identity = find_mut(&mut inner.identities, identity_id)?;
        let old_resource = identity.resource_id.take();
        identity.rotations.push(RotationRecord {
            at: Utc::now(),
            from_resource: old_resource.clone().unwrap_or_default(),
            to_resource: new_resource.id.clone(),
        });
        identity.resource_id = Some(new_resource.id.clone());
        let snapshot = identity.clone();
        self.store
            .put(collections::IDENTITIES, identity_id, &snapshot)?;

        if let Some(old_id) = &old_resource {
            if let Err(err) = self.resources.release(old_id, identity_id).await {
                warn!(identity = %identity_id, resource = %old_id, %err, "Failed to release rotated resource");
            }
        }
        info!(identity = %identity_id, resource = %new_resource.id, "Rotated resource");
        Ok(snapshot)
    }

    /// Delete an identity. Rejected while it is checked out (open
    /// session); the bound resource is released first.
    pub async fn remove(&self, identity_id: &str) -> Result<()> {
        // Held across the release so the identity cannot be acquired (or
        // rotated) between the activity check and the deletion.
        let mut inner = self.inner.lock().await;
        let identity = find(&inner.identities, identity_id)?;
        if identity.active {
            bail!(
                "Cannot delete identity '{}' while it has an open session",
                identity_id
            );
        }

        if let Some(resource_id) = identity.resource_id.clone() {
            self.resources.release(&resource_id, identity_id).await?;
        }

        inner.identities.retain(|i| i.id != identity_id);
        self.store.remove(collections::IDENTITIES, identity_id)?;
        debug!(identity = %identity_id, "Removed identity");
        Ok(())
    }

    /// Drain rotation requests from the resource pool's sweep until the
    /// returned token is cancelled.
    pub fn start_rotation_worker(
        self: &Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<RotationRequest>,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    request = requests.recv() => {
                        let Some(request) = request else { break };
                        debug!(
                            identity = %request.identity_id,
                            resource = %request.resource_id,
                            failures = request.consecutive_failures,
                            "Rotation requested by health sweep"
                        );
                        if let Err(err) = pool.rotate_resource(&request.identity_id).await {
                            warn!(identity = %request.identity_id, %err, "Rotation failed; keeping current binding");
                        }
                    }
                }
            }
        });
        cancel
    }

    pub async fn get(&self, identity_id: &str) -> Option<Identity> {
        let inner = self.inner.lock().await;
        inner.identities.iter().find(|i| i.id == identity_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Identity> {
        let inner = self.inner.lock().await;
        inner.identities.clone()
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.identities.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Per-category population. `counts().total()` must always equal
    /// `len()`.
    pub async fn counts(&self) -> CategoryCounts {
        let inner = self.inner.lock().await;
        let mut counts = CategoryCounts {
            new: 0,
            returning: 0,
            loyal: 0,
        };
        for identity in &inner.identities {
            match identity.category {
                IdentityCategory::New => counts.new += 1,
                IdentityCategory::Returning => counts.returning += 1,
                IdentityCategory::Loyal => counts.loyal += 1,
            }
        }
        counts
    }
}

fn find<'a>(identities: &'a [Identity], id: &str) -> Result<&'a Identity> {
    identities
        .iter()
        .find(|i| i.id == id)
        .ok_or_else(|| AppError::not_found("identity", id).into())
}

fn find_mut<'a>(identities: &'a mut [Identity], id: &str) -> Result<&'a mut Identity> {
    identities
        .iter_mut()
        .find(|i| i.id == id)
        .ok_or_else(|| AppError::not_found("identity", id).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use avy_config::ResourcePoolConfig;
    use avy_core::ProxyProtocol;
    use avy_resource::{FallbackGeoLookup, ResourceSpec};
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

    async fn pools_in(dir: &std::path::Path) -> (Arc<IdentityPool>, Arc<ResourcePool>) {
        let store = RecordStore::open(dir).unwrap();
        let (resources, _rx) = ResourcePool::open(
            store.clone(),
            ResourcePoolConfig::default(),
            Arc::new(FallbackGeoLookup),
        )
        .unwrap();
        let identities = IdentityPool::open(
            store,
            IdentityPoolConfig::default(),
            Arc::clone(&resources),
        )
        .unwrap();
        (identities, resources)
    }

    #[tokio::test]
    async fn test_create_binds_resource() {
        let temp = tempdir().unwrap();
        let (identities, resources) = pools_in(temp.path()).await;
        resources.register(spec("1.1.1.1", "us")).await.unwrap();

        let identity = identities
            .create(IdentityCategory::New, Some("us"))
            .await
            .unwrap();
        assert_eq!(identity.country, "us");
        assert_eq!(identity.sequence, 1);
        assert!(identity.resource_id.is_some());

        // The bound resource names the identity back.
        let snap = resources.snapshot().await;
        assert_eq!(snap[0].assignment.owner(), Some(identity.id.as_str()));
    }

    #[tokio::test]
    async fn test_no_resource_means_no_identity() {
        let temp = tempdir().unwrap();
        let (identities, _resources) = pools_in(temp.path()).await;

        let err = identities
            .create(IdentityCategory::New, Some("de"))
            .await
            .unwrap_err();
        let app = err.downcast_ref::<AppError>().unwrap();
        assert!(matches!(app, AppError::NoResourceAvailable(c) if c == "de"));

        // Pool unchanged: size and counts both zero.
        assert!(identities.is_empty().await);
        assert_eq!(identities.counts().await.total(), 0);
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_per_country() {
        let temp = tempdir().unwrap();
        let (identities, resources) = pools_in(temp.path()).await;
        for i in 0..2 {
            resources.register(spec(&format!("1.1.1.{i}"), "us")).await.unwrap();
        }
        resources.register(spec("2.2.2.2", "gb")).await.unwrap();

        let us1 = identities.create(IdentityCategory::New, Some("us")).await.unwrap();
        let us2 = identities.create(IdentityCategory::New, Some("us")).await.unwrap();
        let gb1 = identities.create(IdentityCategory::New, Some("gb")).await.unwrap();

        assert_eq!(us1.sequence, 1);
        assert_eq!(us2.sequence, 2);
        assert_eq!(gb1.sequence, 1);
    }

    #[tokio::test]
    async fn test_isolation_invariant_under_concurrent_creation() {
        let temp = tempdir().unwrap();
        let (identities, resources) = pools_in(temp.path()).await;
        for i in 0..5 {
            resources.register(spec(&format!("1.1.1.{i}"), "us")).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..10 {
            let identities = Arc::clone(&identities);
            handles.push(tokio::spawn(async move {
                identities.create(IdentityCategory::New, Some("us")).await
            }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                created += 1;
            }
        }
        assert_eq!(created, 5);

        // Every resource has at most one owner, and owners are distinct.
        let mut owners: Vec<String> = resources
            .snapshot()
            .await
            .iter()
            .filter_map(|r| r.assignment.owner().map(String::from))
            .collect();
        assert_eq!(owners.len(), 5);
        owners.sort();
        owners.dedup();
        assert_eq!(owners.len(), 5);

        // Each identity's bound resource names it back.
        let resource_snap = resources.snapshot().await;
        for identity in identities.snapshot().await {
            let bound = identity.resource_id.as_deref().unwrap();
            let resource = resource_snap.iter().find(|r| r.id == bound).unwrap();
            assert_eq!(resource.assignment.owner(), Some(identity.id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_acquire_prefers_category_then_any() {
        let temp = tempdir().unwrap();
        let (identities, resources) = pools_in(temp.path()).await;
        for i in 0..2 {
            resources.register(spec(&format!("1.1.1.{i}"), "us")).await.unwrap();
        }
        identities.create(IdentityCategory::New, Some("us")).await.unwrap();
        let loyal = identities
            .create(IdentityCategory::Loyal, Some("us"))
            .await
            .unwrap();

        let picked = identities
            .acquire(Some(IdentityCategory::Loyal))
            .await
            .unwrap();
        assert_eq!(picked.id, loyal.id);
        assert!(picked.active);

        // No loyal identity left; falls back to the new one.
        let fallback = identities
            .acquire(Some(IdentityCategory::Loyal))
            .await
            .unwrap();
        assert_eq!(fallback.category, IdentityCategory::New);

        // Nothing left at all.
        let err = identities.acquire(None).await.unwrap_err();
        let app = err.downcast_ref::<AppError>().unwrap();
        assert!(matches!(app, AppError::PoolExhausted { category: None }));
    }

    #[tokio::test]
    async fn test_release_returns_identity_to_pool() {
        let temp = tempdir().unwrap();
        let (identities, resources) = pools_in(temp.path()).await;
        resources.register(spec("1.1.1.1", "us")).await.unwrap();
        let identity = identities.create(IdentityCategory::New, Some("us")).await.unwrap();

        identities.acquire(None).await.unwrap();
        identities.release(&identity.id).await.unwrap();
        let again = identities.acquire(None).await.unwrap();
        assert_eq!(again.id, identity.id);
    }

    #[tokio::test]
    async fn test_evolution_advances_and_never_regresses() {
        let temp = tempdir().unwrap();
        let (identities, resources) = pools_in(temp.path()).await;
        resources.register(spec("1.1.1.1", "us")).await.unwrap();
        let identity = identities.create(IdentityCategory::New, Some("us")).await.unwrap();

        // Default thresholds: returning needs 10 visits at 70%.
        for _ in 0..9 {
            let updated = identities.record_outcome(&identity.id, true).await.unwrap();
            assert_eq!(updated.category, IdentityCategory::New);
        }
        let updated = identities.record_outcome(&identity.id, true).await.unwrap();
        assert_eq!(updated.category, IdentityCategory::Returning);

        // A run of failures drops the rate but never the category.
        let mut last = updated;
        for _ in 0..20 {
            last = identities.record_outcome(&identity.id, false).await.unwrap();
        }
        assert_eq!(last.category, IdentityCategory::Returning);

        // Explicit reset is the only regression path.
        identities.reset_category(&identity.id).await.unwrap();
        let reset = identities.get(&identity.id).await.unwrap();
        assert_eq!(reset.category, IdentityCategory::New);
        assert_eq!(reset.metrics.visits, 0);
    }

    #[tokio::test]
    async fn test_evolution_to_loyal() {
        let temp = tempdir().unwrap();
        let (identities, resources) = pools_in(temp.path()).await;
        resources.register(spec("1.1.1.1", "us")).await.unwrap();
        let identity = identities.create(IdentityCategory::New, Some("us")).await.unwrap();

        for _ in 0..50 {
            identities.record_outcome(&identity.id, true).await.unwrap();
        }
        let evolved = identities.get(&identity.id).await.unwrap();
        assert_eq!(evolved.category, IdentityCategory::Loyal);
    }

    #[tokio::test]
    async fn test_category_sum_invariant_through_lifecycle() {
        let temp = tempdir().unwrap();
        let (identities, resources) = pools_in(temp.path()).await;
        for i in 0..3 {
            resources.register(spec(&format!("1.1.1.{i}"), "us")).await.unwrap();
        }

        let a = identities.create(IdentityCategory::New, Some("us")).await.unwrap();
        let _b = identities.create(IdentityCategory::Returning, Some("us")).await.unwrap();
        let c = identities.create(IdentityCategory::Loyal, Some("us")).await.unwrap();
        assert_eq!(identities.counts().await.total(), identities.len().await);

        for _ in 0..10 {
            identities.record_outcome(&a.id, true).await.unwrap();
        }
        assert_eq!(identities.counts().await.total(), identities.len().await);

        identities.remove(&c.id).await.unwrap();
        let counts = identities.counts().await;
        assert_eq!(counts.total(), identities.len().await);
        assert_eq!(counts.loyal, 0);
    }

    #[tokio::test]
    async fn test_rotate_swaps_resource_same_country() {
        let temp = tempdir().unwrap();
        let (identities, resources) = pools_in(temp.path()).await;
        resources.register(spec("1.1.1.1", "us")).await.unwrap();
        resources.register(spec("2.2.2.2", "us")).await.unwrap();

        let identity = identities.create(IdentityCategory::New, Some("us")).await.unwrap();
        let old_resource = identity.resource_id.clone().unwrap();

        let rotated = identities.rotate_resource(&identity.id).await.unwrap();
        let new_resource = rotated.resource_id.clone().unwrap();
        assert_ne!(old_resource, new_resource);
        assert_eq!(rotated.rotations.len(), 1);
        assert_eq!(rotated.rotations[0].from_resource, old_resource);
        assert_eq!(rotated.rotations[0].to_resource, new_resource);

        // The old resource is free again, not deleted.
        let snap = resources.snapshot().await;
        let old = snap.iter().find(|r| r.id == old_resource).unwrap();
        assert!(old.assignment.is_free());
        let new = snap.iter().find(|r| r.id == new_resource).unwrap();
        assert_eq!(new.assignment.owner(), Some(identity.id.as_str()));
    }

    #[tokio::test]
    async fn test_rotate_without_replacement_keeps_binding() {
        let temp = tempdir().unwrap();
        let (identities, resources) = pools_in(temp.path()).await;
        resources.register(spec("1.1.1.1", "us")).await.unwrap();
        let identity = identities.create(IdentityCategory::New, Some("us")).await.unwrap();

        let err = identities.rotate_resource(&identity.id).await.unwrap_err();
        assert!(err.downcast_ref::<AppError>().is_some());

        let current = identities.get(&identity.id).await.unwrap();
        assert_eq!(current.resource_id, identity.resource_id);
    }

    #[tokio::test]
    async fn test_remove_rejected_while_active() {
        let temp = tempdir().unwrap();
        let (identities, resources) = pools_in(temp.path()).await;
        resources.register(spec("1.1.1.1", "us")).await.unwrap();
        let identity = identities.create(IdentityCategory::New, Some("us")).await.unwrap();

        identities.acquire(None).await.unwrap();
        let err = identities.remove(&identity.id).await.unwrap_err();
        assert!(err.to_string().contains("open session"));

        identities.release(&identity.id).await.unwrap();
        identities.remove(&identity.id).await.unwrap();

        // The resource came back to the pool.
        assert!(resources.snapshot().await[0].assignment.is_free());
    }

    #[tokio::test]
    async fn test_provision_reports_shortfall() {
        let temp = tempdir().unwrap();
        let (identities, resources) = pools_in(temp.path()).await;
        // Only us resources; other countries in the default table fail.
        for i in 0..10 {
            resources.register(spec(&format!("1.1.1.{i}"), "us")).await.unwrap();
        }

        let outcome = identities.provision(10, IdentityCategory::New).await.unwrap();
        // Default weights give us 6 of 10; the rest cannot bind.
        assert_eq!(outcome.created.len() + outcome.failures.len(), 10);
        assert!(outcome.created.iter().all(|i| i.country == "us"));
        assert!(!outcome.failures.is_empty());
        assert_eq!(identities.len().await, outcome.created.len());
    }

    #[tokio::test]
    async fn test_concurrent_rotate_and_remove_leave_no_orphan_bindings() {
        let temp = tempdir().unwrap();
        let (identities, resources) = pools_in(temp.path()).await;
        for i in 0..12 {
            resources.register(spec(&format!("1.1.1.{i}"), "us")).await.unwrap();
        }
        let mut ids = Vec::new();
        for _ in 0..4 {
            let identity = identities.create(IdentityCategory::New, Some("us")).await.unwrap();
            ids.push(identity.id);
        }

        // Race rotations against removals of the same identities. Either
        // side may lose (NotFound, NoResourceAvailable); what must never
        // happen is a resource left bound to a deleted identity.
        let mut handles = Vec::new();
        for id in &ids {
            for _ in 0..3 {
                let pool = Arc::clone(&identities);
                let id = id.clone();
                handles.push(tokio::spawn(async move {
                    let _ = pool.rotate_resource(&id).await;
                }));
            }
            let pool = Arc::clone(&identities);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let _ = pool.remove(&id).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let live = identities.snapshot().await;
        let resource_snap = resources.snapshot().await;
        for resource in &resource_snap {
            if let Some(owner) = resource.assignment.owner() {
                let identity = live
                    .iter()
                    .find(|i| i.id == owner)
                    .expect("resource bound to a deleted identity");
                assert_eq!(identity.resource_id.as_deref(), Some(resource.id.as_str()));
            }
        }
        for identity in &live {
            let bound = identity.resource_id.as_deref().unwrap();
            let resource = resource_snap.iter().find(|r| r.id == bound).unwrap();
            assert_eq!(resource.assignment.owner(), Some(identity.id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_rotation_worker_handles_sweep_request() {
        let temp = tempdir().unwrap();
        let store = RecordStore::open(temp.path()).unwrap();
        let (resources, rotation_rx) = ResourcePool::open(
            store.clone(),
            ResourcePoolConfig {
                failure_threshold: 1,
                ..Default::default()
            },
            Arc::new(FallbackGeoLookup),
        )
        .unwrap();
        let identities =
            IdentityPool::open(store, IdentityPoolConfig::default(), Arc::clone(&resources))
                .unwrap();

        let bad = resources.register(spec("1.1.1.1", "us")).await.unwrap();
        resources.register(spec("2.2.2.2", "us")).await.unwrap();
        let identity = identities.create(IdentityCategory::New, Some("us")).await.unwrap();
        assert_eq!(identity.resource_id.as_deref(), Some(bad.id.as_str()));

        let cancel = identities.start_rotation_worker(rotation_rx);

        // One failed probe crosses the threshold and requests rotation.
        resources
            .record_probe_outcome(&bad.id, &avy_resource::ProbeOutcome::unhealthy("down"))
            .await
            .unwrap();

        // The worker runs asynchronously; poll briefly for the rotation.
        let mut rotated = false;
        for _ in 0..50 {
            let current = identities.get(&identity.id).await.unwrap();
            if current.resource_id.as_deref() != Some(bad.id.as_str()) {
                rotated = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(rotated, "sweep-triggered rotation should swap the resource");
        cancel.cancel();
    }
}
