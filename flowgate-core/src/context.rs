//! Shared context handed to flows and fixtures.

use std::future::Future;
use std::sync::Arc;

use crate::accounts::KeyRegistry;
use crate::backend::{Backend, QueryClient};
use crate::config::HarnessConfig;
use crate::error::ConvergenceTimeout;
use crate::poll::{poll_until, PollConfig};
use crate::resources::Locker;

/// Backend access shared by every job of a scenario.
#[derive(Clone)]
pub struct Context {
    pub backend: Arc<dyn Backend>,
    pub query: Arc<dyn QueryClient>,
    pub env: Arc<HarnessConfig>,
    pub keys: KeyRegistry,
}

impl Context {
    pub fn new(
        backend: Arc<dyn Backend>,
        query: Arc<dyn QueryClient>,
        env: Arc<HarnessConfig>,
        keys: KeyRegistry,
    ) -> Self {
        Self {
            backend,
            query,
            env,
            keys,
        }
    }

    pub fn poll_config(&self) -> PollConfig {
        self.env.query_poll
    }

    /// [`poll_until`] with the configured interval and attempt budget.
    pub async fn poll_until<T, F, Fut>(&self, condition: &str, probe: F) -> Result<T, ConvergenceTimeout>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        poll_until(condition, self.poll_config(), probe).await
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("env", &self.env)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

/// What a flow receives: the shared context plus a locker scoped to the
/// flow's lifetime.
#[derive(Debug, Clone)]
pub struct FlowProps {
    pub ctx: Context,
    pub lock: Locker,
    /// `job:flow-N`, used for log correlation.
    pub label: String,
}
