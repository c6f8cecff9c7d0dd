//! Named, bounded-concurrency resource locks.
//!
//! A [`Resource`] stands for a shared on-chain subsystem with a hard capacity
//! (for example the runtime caps active proposals at 5). Flows borrow a slot
//! through [`ResourceManager::acquire`] and give it back through the returned
//! [`ReleaseHandle`]. Acquisition re-checks on a coarse interval because the
//! guarded state changes at block pace, not memory pace.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::LockTimeout;

/// Shared backend subsystems with a real capacity constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resource {
    /// Active proposals (runtime cap: 5).
    Proposals,
    /// Council election cycle; only one flow may drive stage transitions.
    CouncilElection,
    /// Forum category tree mutations.
    ForumCategories,
}

impl Resource {
    pub const ALL: [Resource; 3] = [
        Resource::Proposals,
        Resource::CouncilElection,
        Resource::ForumCategories,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposals => "proposals",
            Self::CouncilElection => "council_election",
            Self::ForumCategories => "forum_categories",
        }
    }

    /// Position in [`Resource::ALL`].
    pub const fn index(self) -> usize {
        match self {
            Self::Proposals => 0,
            Self::CouncilElection => 1,
            Self::ForumCategories => 2,
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Concurrency limit per resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    limits: HashMap<Resource, usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        let mut limits = HashMap::new();
        limits.insert(Resource::Proposals, 5);
        limits.insert(Resource::CouncilElection, 1);
        limits.insert(Resource::ForumCategories, 1);
        Self { limits }
    }
}

impl ResourceLimits {
    /// Override one limit. Zero is raised to one.
    pub fn with_limit(mut self, resource: Resource, limit: usize) -> Self {
        self.limits.insert(resource, limit.max(1));
        self
    }

    pub fn limit(&self, resource: Resource) -> usize {
        self.limits.get(&resource).copied().unwrap_or(1)
    }
}

#[derive(Debug)]
struct ResourceLock {
    resource: Resource,
    limit: usize,
    held: Mutex<usize>,
}

impl ResourceLock {
    fn try_take(&self) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if *held < self.limit {
            *held += 1;
            true
        } else {
            false
        }
    }

    fn give_back(&self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        *held = held.saturating_sub(1);
    }

    fn held(&self) -> usize {
        *self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
struct ManagerInner {
    locks: [Arc<ResourceLock>; 3],
    poll_interval: Duration,
    default_timeout: Duration,
}

/// Owns every named resource lock for the lifetime of a scenario.
#[derive(Debug, Clone)]
pub struct ResourceManager {
    inner: Arc<ManagerInner>,
}

impl ResourceManager {
    pub fn new(limits: &ResourceLimits, poll_interval: Duration, default_timeout: Duration) -> Self {
        let locks = Resource::ALL.map(|resource| {
            Arc::new(ResourceLock {
                resource,
                limit: limits.limit(resource),
                held: Mutex::new(0),
            })
        });
        Self {
            inner: Arc::new(ManagerInner {
                locks,
                poll_interval,
                default_timeout,
            }),
        }
    }

    fn lock_for(&self, resource: Resource) -> Arc<ResourceLock> {
        self.inner.locks[resource.index()].clone()
    }

    /// Current number of holders of `resource`.
    pub fn held(&self, resource: Resource) -> usize {
        self.lock_for(resource).held()
    }

    pub fn limit(&self, resource: Resource) -> usize {
        self.lock_for(resource).limit
    }

    /// Block until a slot of `resource` is free, then take it.
    ///
    /// `timeout` defaults to the manager's configured timeout. Fails with
    /// [`LockTimeout`] when no slot frees up in time; other holders are not
    /// affected.
    pub async fn acquire(
        &self,
        resource: Resource,
        timeout: Option<Duration>,
    ) -> Result<ReleaseHandle, LockTimeout> {
        let lock = self.lock_for(resource);
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if lock.try_take() {
                debug!(%resource, held = lock.held(), limit = lock.limit, "resource lock acquired");
                return Ok(ReleaseHandle {
                    lock,
                    released: AtomicBool::new(false),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(%resource, waited = ?timeout, "resource lock timed out");
                return Err(LockTimeout {
                    resource,
                    waited: now - started,
                });
            }

            info!(%resource, limit = lock.limit, "resource busy, waiting");
            let remaining = deadline - now;
            tokio::time::sleep(self.inner.poll_interval.min(remaining)).await;
        }
    }

    /// A fresh locker owned by `owner` (a job or flow label).
    pub fn locker(&self, owner: impl Into<String>) -> Locker {
        Locker {
            owner: Arc::from(owner.into()),
            manager: self.clone(),
            held: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// One held slot of a resource.
///
/// `release` gives the slot back exactly once; later calls are no-ops.
/// Dropping an unreleased handle releases it.
#[derive(Debug)]
pub struct ReleaseHandle {
    lock: Arc<ResourceLock>,
    released: AtomicBool,
}

impl ReleaseHandle {
    pub fn resource(&self) -> Resource {
        self.lock.resource
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.lock.give_back();
            debug!(resource = %self.lock.resource, held = self.lock.held(), "resource lock released");
        }
    }
}

impl Drop for ReleaseHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Bundles the acquisitions made by one job or flow so its owner can
/// release them all at teardown.
#[derive(Debug, Clone)]
pub struct Locker {
    owner: Arc<str>,
    manager: ResourceManager,
    held: Arc<Mutex<Vec<Arc<ReleaseHandle>>>>,
}

impl Locker {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Acquire `resource` with the default timeout.
    pub async fn lock(&self, resource: Resource) -> Result<Arc<ReleaseHandle>, LockTimeout> {
        self.lock_with_timeout(resource, None).await
    }

    pub async fn lock_with_timeout(
        &self,
        resource: Resource,
        timeout: Option<Duration>,
    ) -> Result<Arc<ReleaseHandle>, LockTimeout> {
        debug!(owner = %self.owner, %resource, "locking resource");
        let handle = Arc::new(self.manager.acquire(resource, timeout).await?);
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle.clone());
        Ok(handle)
    }

    /// Number of handles taken through this locker that are still held.
    pub fn outstanding(&self) -> usize {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| !h.is_released())
            .count()
    }

    /// Release everything this locker acquired. Already released handles are
    /// skipped.
    pub fn release_all(&self) {
        let handles: Vec<_> = self
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let leaked = handles.iter().filter(|h| !h.is_released()).count();
        if leaked > 0 {
            debug!(owner = %self.owner, leaked, "releasing locks left held by owner");
        }
        for handle in handles {
            handle.release();
        }
    }
}
