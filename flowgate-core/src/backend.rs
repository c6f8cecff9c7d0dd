//! Collaborator traits for the write side (chain) and the read side (indexer).
//!
//! The orchestrator never talks to a node directly; scenarios inject
//! implementations of [`Backend`] and [`QueryClient`].

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A signed call submitted by one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedAction {
    pub signer: String,
    /// Dotted call name, e.g. `proposal.create`.
    pub call: String,
    pub args: Value,
    /// Fee priority. Higher tips are included first within a block.
    #[serde(default)]
    pub tip: u64,
}

impl SignedAction {
    pub fn new(signer: impl Into<String>, call: impl Into<String>, args: Value) -> Self {
        Self {
            signer: signer.into(),
            call: call.into(),
            args,
            tip: 0,
        }
    }

    pub fn with_tip(mut self, tip: u64) -> Self {
        self.tip = tip;
        self
    }
}

/// An event emitted while applying an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub section: String,
    pub method: String,
    pub data: Value,
}

impl ChainEvent {
    pub fn new(section: impl Into<String>, method: impl Into<String>, data: Value) -> Self {
        Self {
            section: section.into(),
            method: method.into(),
            data,
        }
    }

    pub fn is(&self, section: &str, method: &str) -> bool {
        self.section == section && self.method == method
    }
}

/// Inclusion outcome of one submitted action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InclusionResult {
    pub block: u64,
    /// Position inside the block after fee-priority ordering.
    pub index_in_block: usize,
    pub events: Vec<ChainEvent>,
    /// Named dispatch error when the runtime rejected the action.
    pub dispatch_error: Option<String>,
}

impl InclusionResult {
    pub fn is_success(&self) -> bool {
        self.dispatch_error.is_none()
    }

    pub fn find_event(&self, section: &str, method: &str) -> Option<&ChainEvent> {
        self.events.iter().find(|e| e.is(section, method))
    }
}

/// Write side: submits signed actions and reads chain state.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Submit actions and wait for their inclusion. Results are returned in
    /// submission order. An `Err` is an infrastructure failure; runtime
    /// rejections are reported through [`InclusionResult::dispatch_error`].
    async fn submit(&self, actions: Vec<SignedAction>) -> Result<Vec<InclusionResult>>;

    async fn read_state(&self, key: &str) -> Result<Option<Value>>;

    async fn best_block(&self) -> Result<u64>;

    /// Wait until the chain reaches `height`.
    async fn wait_until_block(&self, height: u64, poll: Duration) -> Result<u64> {
        loop {
            let best = self.best_block().await?;
            if best >= height {
                return Ok(best);
            }
            tokio::time::sleep(poll).await;
        }
    }
}

/// Read side: answers parameterised queries from indexed data, which may lag
/// behind the chain.
#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn query(&self, name: &str, variables: Value) -> Result<Value>;
}
