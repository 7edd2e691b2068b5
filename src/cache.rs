use crate::{
    error::AppResult,
    models::CacheStats,
    resolver::{ResolvedPermissionSet, Resolver},
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

/// CacheState
///
/// Lifecycle of one user's entry: cold (nothing stored), warm (fresh), stale
/// (invalidated or past its TTL, recomputed on the next read).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Cold,
    Warm,
    Stale,
}

/// CacheLookup
///
/// A resolution plus whether it was served without calling the resolver.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub resolution: Arc<ResolvedPermissionSet>,
    pub from_cache: bool,
}

#[derive(Clone)]
struct CachedResolution {
    resolution: Arc<ResolvedPermissionSet>,
    /// When the oldest storage read behind `resolution` happened.
    stored_at: Instant,
}

/// Per-user slot. Warm reads only touch `current`; `refresh` serializes recomputation so
/// concurrent readers of a cold or stale entry wait for one resolver call instead of
/// each issuing their own.
#[derive(Default)]
struct Slot {
    stale: AtomicBool,
    current: RwLock<Option<CachedResolution>>,
    refresh: Mutex<()>,
}

impl Slot {
    fn read(&self) -> RwLockReadGuard<'_, Option<CachedResolution>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, value: Option<CachedResolution>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

/// ResolutionCache
///
/// Wraps the `Resolver` with a per-user cache. Entries go stale on explicit invalidation
/// or once `ttl` elapses, whichever comes first; a zero TTL disables caching.
pub struct ResolutionCache {
    resolver: Arc<Resolver>,
    ttl: Duration,
    slots: DashMap<Uuid, Arc<Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResolutionCache {
    pub fn new(resolver: Arc<Resolver>, ttl: Duration) -> Self {
        Self {
            resolver,
            ttl,
            slots: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn slot(&self, user_id: Uuid) -> Arc<Slot> {
        self.slots.entry(user_id).or_default().value().clone()
    }

    fn fresh(&self, slot: &Slot) -> Option<Arc<ResolvedPermissionSet>> {
        slot.read()
            .as_ref()
            .filter(|cached| cached.stored_at.elapsed() < self.ttl)
            .map(|cached| cached.resolution.clone())
    }

    fn hit(&self, resolution: Arc<ResolvedPermissionSet>) -> CacheLookup {
        self.hits.fetch_add(1, Ordering::Relaxed);
        CacheLookup {
            resolution,
            from_cache: true,
        }
    }

    /// get
    ///
    /// Returns the warm entry when there is one, otherwise resolves, stores and returns
    /// with `from_cache = false`. A resolver failure leaves the slot cold and propagates.
    pub async fn get(&self, user_id: Uuid) -> AppResult<CacheLookup> {
        let slot = self.slot(user_id);
        if !slot.stale.load(Ordering::Acquire) {
            if let Some(resolution) = self.fresh(&slot) {
                return Ok(self.hit(resolution));
            }
        }

        let _refresh = slot.refresh.lock().await;

        // Cleared before recomputing: an invalidation landing mid-resolution sets it again.
        let was_stale = slot.stale.swap(false, Ordering::AcqRel);
        if !was_stale {
            // Another reader refreshed it while this one waited.
            if let Some(resolution) = self.fresh(&slot) {
                return Ok(self.hit(resolution));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%user_id, was_stale, "permission cache miss");
        match self.resolver.resolve_as_of(user_id).await {
            Ok((resolution, as_of)) => {
                let resolution = Arc::new(resolution);
                slot.store(Some(CachedResolution {
                    resolution: resolution.clone(),
                    stored_at: as_of,
                }));
                Ok(CacheLookup {
                    resolution,
                    from_cache: false,
                })
            }
            Err(e) => {
                slot.store(None);
                Err(e)
            }
        }
    }

    /// Marks one user's entry stale. Use after the user's role set changes.
    pub fn invalidate(&self, user_id: Uuid) {
        if let Some(slot) = self.slots.get(&user_id) {
            slot.stale.store(true, Ordering::Release);
            tracing::debug!(%user_id, "permission cache entry invalidated");
        }
    }

    /// invalidate_users_of_role
    ///
    /// Marks stale every entry whose resolution includes `role_id`, and drops the
    /// resolver's memoized edge set for the role. Entries being recomputed right now are
    /// marked too, since their role set is not known yet. Returns the number marked.
    pub fn invalidate_users_of_role(&self, role_id: i64) -> usize {
        self.resolver.invalidate_role(role_id);

        let mut marked = 0;
        for slot in self.slots.iter() {
            let affected = match slot.refresh.try_lock() {
                Ok(_idle) => slot
                    .read()
                    .as_ref()
                    .is_some_and(|cached| cached.resolution.holds_role(role_id)),
                Err(_) => true,
            };
            if affected {
                slot.stale.store(true, Ordering::Release);
                marked += 1;
            }
        }
        tracing::info!(role_id, marked, "invalidated cached resolutions for role");
        marked
    }

    /// Marks every entry stale and forgets all memoized role edge sets.
    pub fn invalidate_all(&self) -> usize {
        self.resolver.invalidate_all_roles();
        for slot in self.slots.iter() {
            slot.stale.store(true, Ordering::Release);
        }
        let count = self.slots.len();
        tracing::info!(count, "invalidated all cached resolutions");
        count
    }

    pub fn state(&self, user_id: Uuid) -> CacheState {
        let Some(slot) = self.slots.get(&user_id).map(|s| s.value().clone()) else {
            return CacheState::Cold;
        };
        if slot.stale.load(Ordering::Acquire) {
            return CacheState::Stale;
        }
        if slot.refresh.try_lock().is_err() {
            // Someone is recomputing it.
            return CacheState::Stale;
        }
        match slot.read().as_ref() {
            None => CacheState::Cold,
            Some(cached) if cached.stored_at.elapsed() >= self.ttl => CacheState::Stale,
            Some(_) => CacheState::Warm,
        }
    }

    /// prune
    ///
    /// Removes slots that hold nothing fresh and are not in use. Called periodically so
    /// users who stop making requests do not pin memory. Returns the number removed.
    pub fn prune(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 || slot.refresh.try_lock().is_err() {
                return true;
            }
            !slot.stale.load(Ordering::Acquire) && self.fresh(slot).is_some()
        });
        before.saturating_sub(self.slots.len())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.slots.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
