//! Flowgate: orchestration for end-to-end test scenarios against an
//! eventually consistent backend.
//!
//! A scenario declares [`Job`]s, each wrapping one or more concurrent flows,
//! and wires them with `requires` (gate on success) or `after` (order only).
//! Flows draw bounded shared capacity through a per-flow [`Locker`], drive
//! [`Fixture`]s that submit actions, and poll the lagging read side with
//! [`poll_until`] until it converges.
//!
//! ```no_run
//! use std::sync::Arc;
//! use flowgate_core::{flow, HarnessConfig, MemoryChain, ScenarioRunner};
//!
//! # async fn demo() -> Result<(), flowgate_core::ScenarioError> {
//! let chain = Arc::new(MemoryChain::new());
//! let outcome = ScenarioRunner::new("demo", chain.clone(), chain, HarnessConfig::default())
//!     .run(|s| {
//!         let setup = s.job("setup", vec![flow(|_| async { Ok(()) })])?;
//!         let check = s.job("check", vec![flow(|_| async { Ok(()) })])?;
//!         check.requires(&setup)?;
//!         Ok(())
//!     })
//!     .await?;
//! std::process::exit(outcome.exit_code());
//! # }
//! ```

pub mod accounts;
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod fixture;
pub mod job;
pub mod memory;
pub mod poll;
pub mod report;
pub mod resources;
pub mod scenario;
pub mod scheduler;
pub mod snapshot;

pub use accounts::KeyRegistry;
pub use backend::{Backend, ChainEvent, InclusionResult, QueryClient, SignedAction};
pub use config::HarnessConfig;
pub use context::{Context, FlowProps};
pub use error::{AssertionFailure, ConvergenceTimeout, LockTimeout, ScenarioError, UsageError};
pub use fixture::{
    apply_decremental_tips, ActionFixture, ConvergenceCheck, Expectation, Fixture, FixtureRunner,
    FnFixture,
};
pub use job::{flow, Flow, Job, JobOutcome};
pub use memory::{ChainState, MemoryChain, MAX_ACTIVE_PROPOSALS};
pub use poll::{poll_until, PollConfig};
pub use report::{JobReport, ScheduleReport};
pub use resources::{Locker, ReleaseHandle, Resource, ResourceLimits, ResourceManager};
pub use scenario::{ScenarioBuilder, ScenarioOutcome, ScenarioRunner};
pub use scheduler::Scheduler;
pub use snapshot::{OutputSnapshot, SnapshotWriter};
