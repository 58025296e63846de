//! Content-addressed cache of prebuilt execution environments.
//!
//! Each distinct dependency set maps to one image tagged with its
//! fingerprint. Builds are coalesced: at most one build per fingerprint is in
//! flight and concurrent requesters wait on it. A failed build is recorded
//! but not sticky, so the next request builds again.

use crate::config::{PruningConfig, SandboxConfig};
use crate::errors::{BuildError, SandboxError};
use crate::sandbox::{PruneReport, SandboxBackend};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::Builder;
use tokio::fs;
use tokio::sync::{watch, Mutex, OnceCell};

pub mod fingerprint;

pub use fingerprint::{DependencySet, Fingerprint};

const BASE_FINGERPRINT: &str = "base";

/// Image selected for a run. `fingerprint` is `None` for the base image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRef {
    pub image: String,
    pub fingerprint: Option<Fingerprint>,
}

impl EnvironmentRef {
    pub fn base(image: &str) -> Self {
        Self {
            image: image.to_string(),
            fingerprint: None,
        }
    }

    pub fn is_base(&self) -> bool {
        self.fingerprint.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Building,
    Ready,
    Failed,
}

/// Diagnostic view of one cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryInfo {
    pub fingerprint: Fingerprint,
    pub image: String,
    pub status: EntryStatus,
    pub error: Option<String>,
}

type BuildOutcome = Option<Result<EnvironmentRef, BuildError>>;

enum Entry {
    Building(watch::Receiver<BuildOutcome>),
    Ready(EnvironmentRef),
    Failed(BuildError),
}

pub struct EnvironmentCache {
    backend: Arc<dyn SandboxBackend>,
    base_image: String,
    base_recipe: String,
    repository: String,
    conflict_backoff: Duration,
    max_conflict_retries: u32,
    entries: Mutex<HashMap<Fingerprint, Entry>>,
    base_ready: OnceCell<()>,
}

impl EnvironmentCache {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        sandbox: &SandboxConfig,
        pruning: &PruningConfig,
    ) -> Self {
        Self {
            backend,
            base_image: sandbox.base_image.clone(),
            base_recipe: sandbox.base_recipe.clone(),
            repository: sandbox.cache_repository.clone(),
            conflict_backoff: Duration::from_secs(pruning.conflict_backoff_secs),
            max_conflict_retries: pruning.max_conflict_retries,
            entries: Mutex::new(HashMap::new()),
            base_ready: OnceCell::new(),
        }
    }

    /// Override the prune conflict backoff
    pub fn with_conflict_backoff(mut self, backoff: Duration) -> Self {
        self.conflict_backoff = backoff;
        self
    }

    pub fn base(&self) -> EnvironmentRef {
        EnvironmentRef::base(&self.base_image)
    }

    /// Environment for `dependencies`, building it on first use
    pub async fn resolve(&self, dependencies: &DependencySet) -> Result<EnvironmentRef, BuildError> {
        if dependencies.is_empty() {
            self.ensure_base().await?;
            return Ok(self.base());
        }

        let fingerprint = dependencies.fingerprint();

        loop {
            let mut entries = self.entries.lock().await;
            let in_flight = match entries.get(&fingerprint) {
                Some(Entry::Ready(env)) => return Ok(env.clone()),
                Some(Entry::Building(rx)) => Some(rx.clone()),
                Some(Entry::Failed(_)) | None => None,
            };

            let Some(mut waiter) = in_flight else {
                let (tx, rx) = watch::channel(None);
                entries.insert(fingerprint.clone(), Entry::Building(rx));
                drop(entries);

                let result = self.build(dependencies, &fingerprint).await;

                let entry = match &result {
                    Ok(env) => Entry::Ready(env.clone()),
                    Err(e) => Entry::Failed(e.clone()),
                };
                self.entries.lock().await.insert(fingerprint.clone(), entry);

                let _ = tx.send(Some(result.clone()));
                return result;
            };
            drop(entries);

            // Clone out of the watch guard before awaiting anything else
            let waited = waiter
                .wait_for(|outcome| outcome.is_some())
                .await
                .map(|outcome| (*outcome).clone());
            match waited {
                Ok(Some(result)) => return result,
                Ok(None) => {}
                Err(_) => {
                    // The builder went away without reporting; reclaim the slot
                    let mut entries = self.entries.lock().await;
                    if let Some(Entry::Building(rx)) = entries.get(&fingerprint) {
                        if rx.has_changed().is_err() {
                            log::warn!("Abandoned environment build for {}, retrying", fingerprint);
                            entries.remove(&fingerprint);
                        }
                    }
                }
            }
        }
    }

    async fn build(
        &self,
        dependencies: &DependencySet,
        fingerprint: &Fingerprint,
    ) -> Result<EnvironmentRef, BuildError> {
        let tag = fingerprint.image_tag(&self.repository);
        let env = EnvironmentRef {
            image: tag.clone(),
            fingerprint: Some(fingerprint.clone()),
        };

        match self.backend.image_exists(&tag).await {
            Ok(true) => {
                log::info!("Reusing existing environment image {}", tag);
                return Ok(env);
            }
            Ok(false) => {}
            Err(e) => log::warn!("Could not inspect image {}: {}", tag, e),
        }

        self.ensure_base().await.map_err(|e| BuildError {
            fingerprint: fingerprint.to_string(),
            reason: format!("base environment unavailable: {}", e.reason),
        })?;

        let dockerfile = format!(
            "FROM {}\nWORKDIR /app\nCOPY requirements.txt .\nRUN pip install --no-cache-dir -r requirements.txt\n",
            self.base_image
        );

        log::info!(
            "Building environment {} for [{}]",
            tag,
            dependencies.to_vec().join(", ")
        );

        self.build_from_recipe(
            &tag,
            fingerprint.as_str(),
            &dockerfile,
            Some(&dependencies.to_requirements()),
        )
        .await?;

        log::info!("Environment {} ready", tag);
        Ok(env)
    }

    async fn build_from_recipe(
        &self,
        tag: &str,
        fingerprint: &str,
        dockerfile: &str,
        requirements: Option<&str>,
    ) -> Result<(), BuildError> {
        let build_error = |reason: String| BuildError {
            fingerprint: fingerprint.to_string(),
            reason,
        };

        let context = Builder::new()
            .prefix("kiln-env-")
            .tempdir()
            .map_err(|e| build_error(format!("could not create build context: {}", e)))?;

        fs::write(context.path().join("Dockerfile"), dockerfile)
            .await
            .map_err(|e| build_error(format!("could not write Dockerfile: {}", e)))?;

        if let Some(requirements) = requirements {
            fs::write(context.path().join("requirements.txt"), requirements)
                .await
                .map_err(|e| build_error(format!("could not write requirements.txt: {}", e)))?;
        }

        self.backend
            .build_image(tag, context.path())
            .await
            .map_err(|e| build_error(e.to_string()))
    }

    /// Provision the base image once per process
    pub async fn ensure_base(&self) -> Result<(), BuildError> {
        self.base_ready
            .get_or_try_init(|| async move {
                match self.backend.image_exists(&self.base_image).await {
                    Ok(true) => Ok(()),
                    Ok(false) => {
                        log::info!("Base image {} missing, building it", self.base_image);
                        self.build_from_recipe(
                            &self.base_image,
                            BASE_FINGERPRINT,
                            &self.base_recipe,
                            None,
                        )
                        .await
                    }
                    Err(e) => Err(BuildError {
                        fingerprint: BASE_FINGERPRINT.to_string(),
                        reason: e.to_string(),
                    }),
                }
            })
            .await
            .map(|_| ())
    }

    pub fn base_ready(&self) -> bool {
        self.base_ready.initialized()
    }

    /// Remove dangling images and stopped containers
    pub async fn prune(&self) -> Result<PruneReport, SandboxError> {
        let mut conflicts = 0;
        loop {
            match self.backend.prune().await {
                Ok(report) => {
                    log::info!(
                        "Pruned {} containers and {} images ({} bytes reclaimed)",
                        report.containers_deleted,
                        report.images_deleted,
                        report.space_reclaimed
                    );
                    return Ok(report);
                }
                Err(SandboxError::PruneConflict) if conflicts < self.max_conflict_retries => {
                    conflicts += 1;
                    log::warn!(
                        "Prune already running, retrying in {:?} ({}/{})",
                        self.conflict_backoff,
                        conflicts,
                        self.max_conflict_retries
                    );
                    tokio::time::sleep(self.conflict_backoff).await;
                }
                Err(e) => {
                    log::warn!("Pruning failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    pub async fn status(&self, fingerprint: &Fingerprint) -> Option<EntryStatus> {
        let entries = self.entries.lock().await;
        entries.get(fingerprint).map(|entry| match entry {
            Entry::Building(_) => EntryStatus::Building,
            Entry::Ready(_) => EntryStatus::Ready,
            Entry::Failed(_) => EntryStatus::Failed,
        })
    }

    pub async fn entries(&self) -> Vec<CacheEntryInfo> {
        let entries = self.entries.lock().await;
        let mut infos: Vec<CacheEntryInfo> = entries
            .iter()
            .map(|(fingerprint, entry)| {
                let (status, error) = match entry {
                    Entry::Building(_) => (EntryStatus::Building, None),
                    Entry::Ready(_) => (EntryStatus::Ready, None),
                    Entry::Failed(e) => (EntryStatus::Failed, Some(e.reason.clone())),
                };
                CacheEntryInfo {
                    fingerprint: fingerprint.clone(),
                    image: fingerprint.image_tag(&self.repository),
                    status,
                    error,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockBackend, MockRun};

    fn cache(backend: &Arc<MockBackend>) -> EnvironmentCache {
        EnvironmentCache::new(
            backend.clone(),
            &SandboxConfig::default(),
            &PruningConfig::default(),
        )
        .with_conflict_backoff(Duration::from_millis(10))
    }

    fn backend() -> Arc<MockBackend> {
        let backend = Arc::new(MockBackend::new(|_| MockRun::exit(0)));
        backend.add_image("kiln_executor:latest");
        backend
    }

    #[tokio::test]
    async fn test_empty_set_uses_base_without_lookup() {
        let backend = backend();
        let cache = cache(&backend);

        let env = cache.resolve(&DependencySet::new()).await.unwrap();
        assert!(env.is_base());
        assert_eq!(env.image, "kiln_executor:latest");
        assert!(backend.state().builds.is_empty());
        assert!(cache.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_build_once_then_hit() {
        let backend = backend();
        let cache = cache(&backend);
        let deps = DependencySet::from_entries(["requests"]);

        let first = cache.resolve(&deps).await.unwrap();
        let second = cache
            .resolve(&DependencySet::parse(" Requests \n"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.image, deps.fingerprint().image_tag("kiln_cache"));
        assert_eq!(backend.state().builds, vec![first.image.clone()]);
        assert_eq!(cache.status(&deps.fingerprint()).await, Some(EntryStatus::Ready));
    }

    #[tokio::test]
    async fn test_build_context_contains_recipe_and_requirements() {
        let backend = backend();
        let cache = cache(&backend);

        cache
            .resolve(&DependencySet::from_entries(["pandas", "numpy"]))
            .await
            .unwrap();

        let state = backend.state();
        let dockerfile = &state.build_contexts[0]["Dockerfile"];
        assert!(dockerfile.starts_with("FROM kiln_executor:latest\nWORKDIR /app\n"));
        assert!(dockerfile.contains("COPY requirements.txt ."));
        assert!(dockerfile.contains("RUN pip install --no-cache-dir -r requirements.txt"));
        assert_eq!(state.build_contexts[0]["requirements.txt"], "numpy\npandas\n");
    }

    #[tokio::test]
    async fn test_concurrent_resolves_coalesce_into_one_build() {
        let backend = backend();
        backend.set_build_delay(Duration::from_millis(100));
        let cache = Arc::new(cache(&backend));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .resolve(&DependencySet::from_entries(["scipy", "numpy"]))
                    .await
            }));
        }

        let mut images = Vec::new();
        for handle in handles {
            images.push(handle.await.unwrap().unwrap().image);
        }

        assert!(images.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(backend.state().builds.len(), 1);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_waiter_receives_result_of_in_flight_build() {
        let backend = backend();
        backend.set_build_delay(Duration::from_millis(100));
        let cache = Arc::new(cache(&backend));
        let deps = DependencySet::from_entries(["pandas"]);

        let builder = {
            let cache = cache.clone();
            let deps = deps.clone();
            tokio::spawn(async move { cache.resolve(&deps).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            cache.status(&deps.fingerprint()).await,
            Some(EntryStatus::Building)
        );

        // Waiting on an in-flight build must stay spawnable
        let waiting = cache.resolve(&deps);
        assert_send(&waiting);
        let waited = waiting.await.unwrap();

        assert_eq!(builder.await.unwrap().unwrap(), waited);
        assert_eq!(backend.state().builds.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_is_retried_on_next_resolve() {
        let backend = backend();
        backend.fail_builds(true);
        let cache = cache(&backend);
        let deps = DependencySet::from_entries(["broken-package"]);

        let err = cache.resolve(&deps).await.unwrap_err();
        assert_eq!(err.fingerprint, deps.fingerprint().to_string());
        assert_eq!(cache.status(&deps.fingerprint()).await, Some(EntryStatus::Failed));

        backend.fail_builds(false);
        let env = cache.resolve(&deps).await.unwrap();
        assert!(!env.is_base());
        assert_eq!(backend.state().builds.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_all_receive_build_error() {
        let backend = backend();
        backend.fail_builds(true);
        backend.set_build_delay(Duration::from_millis(50));
        let cache = Arc::new(cache(&backend));

        let a = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.resolve(&DependencySet::from_entries(["x"])).await })
        };
        let b = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.resolve(&DependencySet::from_entries(["x"])).await })
        };

        assert!(a.await.unwrap().is_err());
        assert!(b.await.unwrap().is_err());
        assert_eq!(backend.state().builds.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_image_is_adopted_without_build() {
        let backend = backend();
        let deps = DependencySet::from_entries(["flask"]);
        backend.add_image(&deps.fingerprint().image_tag("kiln_cache"));
        let cache = cache(&backend);

        let env = cache.resolve(&deps).await.unwrap();
        assert_eq!(env.fingerprint, Some(deps.fingerprint()));
        assert!(backend.state().builds.is_empty());
    }

    #[tokio::test]
    async fn test_missing_base_is_built_once() {
        let backend = Arc::new(MockBackend::new(|_| MockRun::exit(0)));
        let cache = cache(&backend);

        cache.ensure_base().await.unwrap();
        cache.ensure_base().await.unwrap();
        assert!(cache.base_ready());

        let state = backend.state();
        assert_eq!(state.builds, vec!["kiln_executor:latest".to_string()]);
        assert!(state.build_contexts[0]["Dockerfile"].starts_with("FROM python:3.11-slim"));
    }

    #[tokio::test]
    async fn test_prune_retries_conflicts_then_succeeds() {
        let backend = backend();
        backend.set_prune_conflicts(2);
        let cache = cache(&backend);

        cache.prune().await.unwrap();
        assert_eq!(backend.state().prune_calls, 3);
    }

    #[tokio::test]
    async fn test_prune_gives_up_after_bounded_conflicts() {
        let backend = backend();
        backend.set_prune_conflicts(10);
        let cache = cache(&backend);

        let result = cache.prune().await;
        assert!(matches!(result, Err(SandboxError::PruneConflict)));
        // One initial call plus the configured retries
        assert_eq!(backend.state().prune_calls, 4);
    }
}
