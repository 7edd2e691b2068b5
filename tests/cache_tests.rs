mod common;

use async_trait::async_trait;
use common::*;
use permission_service::{
    AppConfig, AppError, AppResult, AssignmentLedger, AssignmentService, CacheState,
    CatalogState, DirectoryState, InMemoryRepository, LedgerState, ResolutionCache, Resolver,
    RoleDirectory,
    models::{GrantOutcome, Role, RolePermissionEdge},
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Role directory that counts lookups and answers slowly, so concurrent readers overlap.
struct CountingDirectory {
    inner: Arc<InMemoryRepository>,
    calls: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl RoleDirectory for CountingDirectory {
    async fn roles_of_user(&self, user_id: Uuid) -> AppResult<Vec<Role>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.roles_of_user(user_id).await
    }

    async fn list_roles(&self) -> AppResult<Vec<Role>> {
        self.inner.list_roles().await
    }
}

/// Ledger that can hold one role read open after it has loaded, so writes can land while
/// a resolution is in flight.
struct GatedLedger {
    inner: Arc<InMemoryRepository>,
    armed: AtomicBool,
    loaded: Notify,
    release: Notify,
}

impl GatedLedger {
    fn new(inner: Arc<InMemoryRepository>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            loaded: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl AssignmentLedger for GatedLedger {
    async fn role_exists(&self, role_id: i64) -> AppResult<bool> {
        self.inner.role_exists(role_id).await
    }

    async fn permission_ids_for_role(&self, role_id: i64) -> AppResult<Vec<i64>> {
        let ids = self.inner.permission_ids_for_role(role_id).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.loaded.notify_one();
            self.release.notified().await;
        }
        Ok(ids)
    }

    async fn edges_for_role(&self, role_id: i64) -> AppResult<Vec<RolePermissionEdge>> {
        self.inner.edges_for_role(role_id).await
    }

    async fn grant_many(
        &self,
        role_id: i64,
        permission_ids: &[i64],
        grantor_id: Option<Uuid>,
        notes: Option<String>,
    ) -> AppResult<Vec<GrantOutcome>> {
        self.inner
            .grant_many(role_id, permission_ids, grantor_id, notes)
            .await
    }

    async fn revoke(&self, role_id: i64, permission_id: i64) -> AppResult<bool> {
        self.inner.revoke(role_id, permission_id).await
    }
}

fn cache_over(
    repo: &Arc<InMemoryRepository>,
    directory: DirectoryState,
    config: &AppConfig,
) -> ResolutionCache {
    let resolver = Resolver::new(
        repo.clone() as CatalogState,
        repo.clone() as LedgerState,
        directory,
        config,
    );
    ResolutionCache::new(Arc::new(resolver), config.cache_ttl)
}

#[tokio::test]
async fn cold_then_warm() {
    let fx = seeded().await;
    let cache = &fx.state.cache;

    assert_eq!(cache.state(fx.teacher_user), CacheState::Cold);
    let first = cache.get(fx.teacher_user).await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(cache.state(fx.teacher_user), CacheState::Warm);

    let second = cache.get(fx.teacher_user).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(first.resolution, second.resolution);

    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
}

#[tokio::test]
async fn invalidate_marks_entry_stale_until_next_read() {
    let fx = seeded().await;
    let cache = &fx.state.cache;
    cache.get(fx.teacher_user).await.unwrap();

    // Role set changes outside the core, then the caller signals it.
    fx.repo.assign_user_role(fx.teacher_user, PARENT).unwrap();
    cache.invalidate(fx.teacher_user);
    assert_eq!(cache.state(fx.teacher_user), CacheState::Stale);

    let lookup = cache.get(fx.teacher_user).await.unwrap();
    assert!(!lookup.from_cache);
    assert!(lookup.resolution.contains_code("STUDENT_PAGE"));
    assert_eq!(cache.state(fx.teacher_user), CacheState::Warm);
}

#[tokio::test]
async fn role_invalidation_only_touches_holders_of_the_role() {
    let fx = seeded().await;
    let cache = &fx.state.cache;
    cache.get(fx.teacher_user).await.unwrap();
    cache.get(fx.parent_user).await.unwrap();
    cache.get(fx.multi_role_user).await.unwrap();

    let marked = cache.invalidate_users_of_role(TEACHER);

    assert_eq!(marked, 2);
    assert_eq!(cache.state(fx.teacher_user), CacheState::Stale);
    assert_eq!(cache.state(fx.multi_role_user), CacheState::Stale);
    assert_eq!(cache.state(fx.parent_user), CacheState::Warm);
}

#[tokio::test]
async fn invalidate_all_marks_every_entry() {
    let fx = seeded().await;
    let cache = &fx.state.cache;
    cache.get(fx.teacher_user).await.unwrap();
    cache.get(fx.parent_user).await.unwrap();

    assert_eq!(cache.invalidate_all(), 2);
    assert_eq!(cache.state(fx.teacher_user), CacheState::Stale);
    assert_eq!(cache.state(fx.parent_user), CacheState::Stale);
}

#[tokio::test(start_paused = true)]
async fn missed_invalidation_is_bounded_by_ttl() {
    let fx = seeded().await;
    let cache = &fx.state.cache;
    let ttl = fx.state.config.cache_ttl;
    cache.get(fx.teacher_user).await.unwrap();

    // Revoked directly on the ledger: no invalidation signal reaches the cache.
    fx.repo.revoke(TEACHER, EDIT_STUDENT).await.unwrap();

    tokio::time::advance(ttl - Duration::from_secs(1)).await;
    let before_expiry = cache.get(fx.teacher_user).await.unwrap();
    assert!(before_expiry.from_cache);
    assert!(before_expiry.resolution.contains_code("EDIT_STUDENT"));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(cache.state(fx.teacher_user), CacheState::Stale);
    let after_expiry = cache.get(fx.teacher_user).await.unwrap();
    assert!(!after_expiry.from_cache);
    assert!(!after_expiry.resolution.contains_code("EDIT_STUDENT"));
}

#[tokio::test]
async fn zero_ttl_disables_caching() {
    let repo = Arc::new(InMemoryRepository::new());
    seed_catalog(&repo);
    seed_edges(&repo).await;
    let user = Uuid::new_v4();
    repo.assign_user_role(user, TEACHER).unwrap();

    let config = AppConfig {
        cache_ttl: Duration::ZERO,
        ..AppConfig::default()
    };
    let cache = cache_over(&repo, repo.clone() as DirectoryState, &config);

    assert!(!cache.get(user).await.unwrap().from_cache);
    assert!(!cache.get(user).await.unwrap().from_cache);
}

#[tokio::test]
async fn concurrent_cold_reads_collapse_into_one_resolution() {
    let repo = Arc::new(InMemoryRepository::new());
    seed_catalog(&repo);
    seed_edges(&repo).await;
    let user = Uuid::new_v4();
    repo.assign_user_role(user, TEACHER).unwrap();

    let directory = Arc::new(CountingDirectory {
        inner: repo.clone(),
        calls: AtomicUsize::new(0),
        delay: Duration::from_millis(50),
    });
    let cache = Arc::new(cache_over(
        &repo,
        directory.clone() as DirectoryState,
        &AppConfig::default(),
    ));

    let mut readers = JoinSet::new();
    for _ in 0..16 {
        let cache = cache.clone();
        readers.spawn(async move { cache.get(user).await });
    }

    let mut computed = 0;
    while let Some(joined) = readers.join_next().await {
        let lookup = joined.unwrap().unwrap();
        assert_eq!(lookup.resolution.permissions.len(), 2);
        if !lookup.from_cache {
            computed += 1;
        }
    }

    assert_eq!(directory.calls.load(Ordering::SeqCst), 1);
    assert_eq!(computed, 1);
}

#[tokio::test]
async fn storage_failure_propagates_and_leaves_entry_cold() {
    let fx = seeded().await;
    let cache = &fx.state.cache;

    fx.repo.set_unavailable(true);
    let err = cache.get(fx.teacher_user).await.unwrap_err();
    assert!(matches!(err, AppError::Internal(_)));
    assert_eq!(cache.state(fx.teacher_user), CacheState::Cold);

    fx.repo.set_unavailable(false);
    let lookup = cache.get(fx.teacher_user).await.unwrap();
    assert!(!lookup.from_cache);
    assert_eq!(lookup.resolution.permissions.len(), 2);
}

#[tokio::test]
async fn prune_drops_stale_slots_and_keeps_warm_ones() {
    let fx = seeded().await;
    let cache = &fx.state.cache;
    cache.get(fx.teacher_user).await.unwrap();
    cache.get(fx.parent_user).await.unwrap();
    cache.invalidate(fx.parent_user);

    assert_eq!(cache.prune(), 1);
    assert_eq!(cache.state(fx.teacher_user), CacheState::Warm);
    assert_eq!(cache.state(fx.parent_user), CacheState::Cold);
}

#[tokio::test(start_paused = true)]
async fn cold_user_never_inherits_role_data_older_than_ttl() {
    let fx = seeded().await;
    let cache = &fx.state.cache;
    let ttl = fx.state.config.cache_ttl;
    cache.get(fx.teacher_user).await.unwrap();

    fx.repo.revoke(TEACHER, EDIT_STUDENT).await.unwrap();
    tokio::time::advance(ttl + Duration::from_secs(1)).await;

    let newcomer = Uuid::new_v4();
    fx.repo.assign_user_role(newcomer, TEACHER).unwrap();
    let lookup = cache.get(newcomer).await.unwrap();

    assert!(!lookup.from_cache);
    assert!(!lookup.resolution.contains_code("EDIT_STUDENT"));
}

#[tokio::test(start_paused = true)]
async fn entry_built_from_memoized_roles_ages_from_the_role_load() {
    let fx = seeded().await;
    let cache = &fx.state.cache;
    let ttl = fx.state.config.cache_ttl;
    cache.get(fx.teacher_user).await.unwrap();
    fx.repo.revoke(TEACHER, EDIT_STUDENT).await.unwrap();

    // Resolved from the role set memoized at the start.
    tokio::time::advance(ttl / 2).await;
    let newcomer = Uuid::new_v4();
    fx.repo.assign_user_role(newcomer, TEACHER).unwrap();
    assert!(
        cache
            .get(newcomer)
            .await
            .unwrap()
            .resolution
            .contains_code("EDIT_STUDENT")
    );

    // One TTL after the role load, not after the newcomer's store.
    tokio::time::advance(ttl / 2 + Duration::from_secs(1)).await;
    assert_eq!(cache.state(newcomer), CacheState::Stale);
    let lookup = cache.get(newcomer).await.unwrap();
    assert!(!lookup.resolution.contains_code("EDIT_STUDENT"));
}

#[tokio::test]
async fn revoke_during_in_flight_resolution_is_not_lost() {
    let repo = Arc::new(InMemoryRepository::new());
    seed_catalog(&repo);
    seed_edges(&repo).await;
    let user = Uuid::new_v4();
    repo.assign_user_role(user, TEACHER).unwrap();

    let config = AppConfig::default();
    let ledger = Arc::new(GatedLedger::new(repo.clone()));
    let resolver = Resolver::new(
        repo.clone() as CatalogState,
        ledger.clone() as LedgerState,
        repo.clone() as DirectoryState,
        &config,
    );
    let cache = Arc::new(ResolutionCache::new(Arc::new(resolver), config.cache_ttl));
    let assignments = AssignmentService::new(ledger.clone() as LedgerState, cache.clone());

    ledger.armed.store(true, Ordering::SeqCst);
    let reader = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get(user).await }
    });
    ledger.loaded.notified().await;

    assert!(assignments.revoke(TEACHER, EDIT_STUDENT).await.unwrap());
    ledger.release.notify_one();

    // The in-flight read started before the commit.
    let in_flight = reader.await.unwrap().unwrap();
    assert!(in_flight.resolution.contains_code("EDIT_STUDENT"));

    let after = cache.get(user).await.unwrap();
    assert!(!after.from_cache);
    assert!(!after.resolution.contains_code("EDIT_STUDENT"));
    assert!(cache.get(user).await.unwrap().from_cache);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn warm_reads_are_not_marked_by_unrelated_role_invalidation() {
    let fx = seeded().await;
    let cache = fx.state.cache.clone();
    cache.get(fx.teacher_user).await.unwrap();

    let mut readers = JoinSet::new();
    for _ in 0..4 {
        let cache = cache.clone();
        let user = fx.teacher_user;
        readers.spawn(async move {
            for _ in 0..500 {
                assert!(cache.get(user).await.unwrap().from_cache);
            }
        });
    }
    for _ in 0..500 {
        cache.invalidate_users_of_role(PARENT);
        tokio::task::yield_now().await;
    }
    while let Some(joined) = readers.join_next().await {
        joined.unwrap();
    }

    assert_eq!(cache.stats().misses, 1);
    assert_eq!(cache.state(fx.teacher_user), CacheState::Warm);
}
