//! Fixture execution protocol.
//!
//! A fixture is one logical test action: `execute` changes backend state and
//! checks that the backend behaved as expected, `verify_convergence`
//! optionally proves the read side caught up. [`FixtureRunner`] drives the
//! single-shot state machine `Created -> Executing -> Executed{error?}`.
//!
//! Only [`AssertionFailure`]s raised during `execute` are contained on the
//! runner. Any other error is treated as an infrastructure failure and
//! propagates to the calling flow.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::{ChainEvent, InclusionResult, SignedAction};
use crate::context::Context;
use crate::error::{AssertionFailure, UsageError};

/// One test action with an optional read-side convergence check.
#[async_trait]
pub trait Fixture: Send {
    fn name(&self) -> &str;

    async fn execute(&mut self, ctx: &Context) -> Result<()>;

    async fn verify_convergence(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FixtureState {
    Created,
    Executing,
    Executed { error: Option<AssertionFailure> },
    /// `execute` raised an infrastructure error.
    Aborted,
}

/// Runs a fixture exactly once and holds its result.
pub struct FixtureRunner<F: Fixture> {
    fixture: F,
    state: FixtureState,
}

impl<F: Fixture> FixtureRunner<F> {
    pub fn new(fixture: F) -> Self {
        Self {
            fixture,
            state: FixtureState::Created,
        }
    }

    pub fn fixture(&self) -> &F {
        &self.fixture
    }

    pub fn into_inner(self) -> F {
        self.fixture
    }

    pub fn is_executed(&self) -> bool {
        matches!(self.state, FixtureState::Executed { .. })
    }

    /// Execute the fixture. A second call fails without touching the backend.
    ///
    /// Returns `Ok` when execution finished, including when it finished with a
    /// contained assertion failure; check [`Self::did_fail`].
    pub async fn run(&mut self, ctx: &Context) -> Result<()> {
        if self.state != FixtureState::Created {
            return Err(UsageError::FixtureAlreadyRun {
                fixture: self.fixture.name().to_string(),
            }
            .into());
        }
        self.state = FixtureState::Executing;
        debug!(fixture = self.fixture.name(), "executing fixture");

        match self.fixture.execute(ctx).await {
            Ok(()) => {
                info!(fixture = self.fixture.name(), "fixture executed");
                self.state = FixtureState::Executed { error: None };
                Ok(())
            }
            Err(err) => match err.downcast::<AssertionFailure>() {
                Ok(failure) => {
                    warn!(fixture = self.fixture.name(), %failure, "fixture failed");
                    self.state = FixtureState::Executed {
                        error: Some(failure),
                    };
                    Ok(())
                }
                Err(err) => {
                    self.state = FixtureState::Aborted;
                    Err(err.context(format!("fixture '{}' aborted", self.fixture.name())))
                }
            },
        }
    }

    pub fn did_fail(&self) -> Result<bool, UsageError> {
        self.execution_error().map(|e| e.is_some())
    }

    pub fn execution_error(&self) -> Result<Option<&AssertionFailure>, UsageError> {
        match &self.state {
            FixtureState::Executed { error } => Ok(error.as_ref()),
            _ => Err(UsageError::NotExecuted {
                fixture: self.fixture.name().to_string(),
            }),
        }
    }

    /// Run the fixture's convergence check. Must follow a successful execution.
    pub async fn verify_convergence(&mut self, ctx: &Context) -> Result<()> {
        if let Some(failure) = self.execution_error()? {
            return Err(failure.clone().into());
        }
        self.fixture.verify_convergence(ctx).await
    }

    /// `run`, surface a contained failure as an error, then verify convergence.
    /// This is what flows normally call.
    pub async fn run_and_verify(&mut self, ctx: &Context) -> Result<()> {
        self.run(ctx).await?;
        self.verify_convergence(ctx).await
    }
}

/// Give each action a strictly decreasing tip so fee-priority ordering puts
/// them in submission order across distinct signers.
///
/// This is a best-effort hint: the backend is free to order differently, and
/// checks that depend on it may be flaky. The largest tip is
/// `actions.len() * step`; if that does not fit in a `u64` nothing is changed.
pub fn apply_decremental_tips(actions: &mut [SignedAction], step: u64) -> Result<(), UsageError> {
    let count = actions.len();
    if (count as u64).checked_mul(step).is_none() {
        return Err(UsageError::TipOverflow { count, step });
    }
    for (i, action) in actions.iter_mut().enumerate() {
        action.tip = (count - i) as u64 * step;
    }
    Ok(())
}

/// What the backend is expected to do with every action of a fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    Success,
    /// Rejected with this named dispatch error.
    Rejected(String),
}

type ConvergencePredicate = Arc<dyn Fn(&Value, &[InclusionResult]) -> Result<()> + Send + Sync>;

/// Read-side check for an [`ActionFixture`]: `query` is re-run until
/// `predicate` accepts its result.
#[derive(Clone)]
pub struct ConvergenceCheck {
    condition: String,
    query: String,
    variables: Value,
    predicate: ConvergencePredicate,
}

impl ConvergenceCheck {
    pub fn new<P>(condition: impl Into<String>, query: impl Into<String>, variables: Value, predicate: P) -> Self
    where
        P: Fn(&Value, &[InclusionResult]) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            condition: condition.into(),
            query: query.into(),
            variables,
            predicate: Arc::new(predicate),
        }
    }
}

/// Submit a batch of signed actions and check each inclusion result against
/// an [`Expectation`].
pub struct ActionFixture {
    name: String,
    actions: Vec<SignedAction>,
    expectation: Expectation,
    ordered: bool,
    convergence: Option<ConvergenceCheck>,
    results: Vec<InclusionResult>,
}

impl ActionFixture {
    pub fn new(name: impl Into<String>, actions: Vec<SignedAction>) -> Self {
        Self {
            name: name.into(),
            actions,
            expectation: Expectation::Success,
            ordered: false,
            convergence: None,
            results: Vec::new(),
        }
    }

    /// Expect every action to be rejected with `error`.
    pub fn expect_rejection(mut self, error: impl Into<String>) -> Self {
        self.expectation = Expectation::Rejected(error.into());
        self
    }

    /// Ask for inclusion in submission order via decremental tips.
    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    pub fn with_convergence(mut self, check: ConvergenceCheck) -> Self {
        self.convergence = Some(check);
        self
    }

    pub fn results(&self) -> &[InclusionResult] {
        &self.results
    }

    /// Every event of the given kind across all results, in submission order.
    pub fn events(&self, section: &str, method: &str) -> Vec<&ChainEvent> {
        self.results
            .iter()
            .flat_map(|r| r.events.iter())
            .filter(|e| e.is(section, method))
            .collect()
    }

    fn check_result(&self, index: usize, result: &InclusionResult) -> Result<(), AssertionFailure> {
        let call = &self.actions[index].call;
        match (&self.expectation, &result.dispatch_error) {
            (Expectation::Success, None) => Ok(()),
            (Expectation::Success, Some(error)) => Err(AssertionFailure::new(format!(
                "action #{index} ({call}) was rejected with {error}"
            ))),
            (Expectation::Rejected(expected), None) => Err(AssertionFailure::new(format!(
                "action #{index} ({call}) succeeded, expected rejection with {expected}"
            ))),
            (Expectation::Rejected(expected), Some(actual)) if expected == actual => Ok(()),
            (Expectation::Rejected(expected), Some(actual)) => Err(AssertionFailure::new(format!(
                "action #{index} ({call}) rejected with {actual}, expected {expected}"
            ))),
        }
    }
}

#[async_trait]
impl Fixture for ActionFixture {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self, ctx: &Context) -> Result<()> {
        let mut actions = self.actions.clone();
        if self.ordered {
            apply_decremental_tips(&mut actions, ctx.env.tip_step)?;
        }
        let count = actions.len();
        let results = ctx.backend.submit(actions).await?;
        if results.len() != count {
            return Err(anyhow!(
                "backend returned {} results for {} actions",
                results.len(),
                count
            ));
        }
        self.results = results;

        for (index, result) in self.results.iter().enumerate() {
            self.check_result(index, result)?;
        }
        Ok(())
    }

    async fn verify_convergence(&mut self, ctx: &Context) -> Result<()> {
        let Some(check) = self.convergence.clone() else {
            return Ok(());
        };
        let results = &self.results;
        ctx.poll_until(&check.condition, || {
            let query = ctx.query.clone();
            let check = check.clone();
            async move {
                let value = query.query(&check.query, check.variables.clone()).await?;
                (check.predicate)(&value, results.as_slice())
            }
        })
        .await?;
        Ok(())
    }
}

type FixtureFn = Box<dyn FnMut(Context) -> BoxFuture<'static, Result<()>> + Send>;

/// Fixture built from closures: an `execute` body and an optional
/// convergence check.
pub struct FnFixture {
    name: String,
    execute: FixtureFn,
    convergence: Option<FixtureFn>,
}

impl FnFixture {
    pub fn new<E>(name: impl Into<String>, execute: E) -> Self
    where
        E: FnMut(Context) -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Box::new(execute),
            convergence: None,
        }
    }

    pub fn with_convergence<C>(mut self, check: C) -> Self
    where
        C: FnMut(Context) -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        self.convergence = Some(Box::new(check));
        self
    }
}

#[async_trait]
impl Fixture for FnFixture {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self, ctx: &Context) -> Result<()> {
        (self.execute)(ctx.clone()).await
    }

    async fn verify_convergence(&mut self, ctx: &Context) -> Result<()> {
        match self.convergence.as_mut() {
            Some(check) => check(ctx.clone()).await,
            None => Ok(()),
        }
    }
}
