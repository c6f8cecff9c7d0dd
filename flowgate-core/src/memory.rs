//! In-memory chain and lagging indexer.
//!
//! `MemoryChain` implements both collaborator traits so scenarios can run
//! without a node: every `submit` seals one block, actions inside a block are
//! applied in descending tip order, and the indexer only sees a block once
//! `indexer_lag` has passed since it was sealed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::debug;

use crate::backend::{Backend, ChainEvent, InclusionResult, QueryClient, SignedAction};

/// Runtime cap on simultaneously active proposals.
pub const MAX_ACTIVE_PROPOSALS: u64 = 5;

const ACTIVE_PROPOSALS_KEY: &str = "proposals/active";
const NEXT_PROPOSAL_KEY: &str = "proposals/next_id";

/// Dispatch function for one call name. Returns emitted events or a named
/// dispatch error; state changes of a rejected action are rolled back.
pub type CallHandler =
    Arc<dyn Fn(&mut ChainState, &SignedAction) -> Result<Vec<ChainEvent>, String> + Send + Sync>;

/// Mutable chain storage with a write journal for the current block.
#[derive(Debug, Clone, Default)]
pub struct ChainState {
    storage: BTreeMap<String, Value>,
    journal: Vec<(String, Option<Value>)>,
}

impl ChainState {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.storage.get(key)
    }

    pub fn get_u64(&self, key: &str) -> u64 {
        self.get(key).and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.journal.push((key.clone(), Some(value.clone())));
        self.storage.insert(key, value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let old = self.storage.remove(key);
        if old.is_some() {
            self.journal.push((key.to_string(), None));
        }
        old
    }
}

#[derive(Debug)]
struct SealedBlock {
    number: u64,
    sealed_at: Instant,
    writes: Vec<(String, Option<Value>)>,
    events: Vec<ChainEvent>,
}

#[derive(Debug, Default)]
struct ChainInner {
    state: ChainState,
    best_block: u64,
    blocks: Vec<SealedBlock>,
}

/// Simulated chain plus indexer.
pub struct MemoryChain {
    inner: Mutex<ChainInner>,
    handlers: HashMap<String, CallHandler>,
    block_time: Duration,
    indexer_lag: Duration,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChain {
    /// Chain with the default call set, 6 s blocks and a 12 s indexer lag.
    pub fn new() -> Self {
        let mut chain = Self {
            inner: Mutex::new(ChainInner::default()),
            handlers: HashMap::new(),
            block_time: Duration::from_secs(6),
            indexer_lag: Duration::from_secs(12),
        };
        chain.register("kv.set", kv_set);
        chain.register("kv.remove", kv_remove);
        chain.register("proposal.create", proposal_create);
        chain.register("proposal.finalize", proposal_finalize);
        chain
    }

    pub fn with_block_time(mut self, block_time: Duration) -> Self {
        self.block_time = block_time;
        self
    }

    pub fn with_indexer_lag(mut self, lag: Duration) -> Self {
        self.indexer_lag = lag;
        self
    }

    /// Register (or replace) the dispatch function for `call`.
    pub fn with_handler<F>(mut self, call: &str, handler: F) -> Self
    where
        F: Fn(&mut ChainState, &SignedAction) -> Result<Vec<ChainEvent>, String>
            + Send
            + Sync
            + 'static,
    {
        self.register(call, handler);
        self
    }

    fn register<F>(&mut self, call: &str, handler: F)
    where
        F: Fn(&mut ChainState, &SignedAction) -> Result<Vec<ChainEvent>, String>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(call.to_string(), Arc::new(handler));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Events of every sealed block, in inclusion order. Ignores indexer lag.
    pub fn all_events(&self) -> Vec<(u64, ChainEvent)> {
        self.lock()
            .blocks
            .iter()
            .flat_map(|b| b.events.iter().cloned().map(move |e| (b.number, e)))
            .collect()
    }

    fn seal_block(&self, actions: &[SignedAction]) -> Result<Vec<InclusionResult>> {
        if let Some(unknown) = actions
            .iter()
            .find(|a| !self.handlers.contains_key(&a.call))
        {
            bail!("malformed call: unknown call '{}'", unknown.call);
        }

        // Fee priority: higher tip first, submission order breaks ties.
        let mut order: Vec<usize> = (0..actions.len()).collect();
        order.sort_by(|&a, &b| actions[b].tip.cmp(&actions[a].tip).then(a.cmp(&b)));

        let mut inner = self.lock();
        let number = inner.best_block + 1;
        let mut results: Vec<Option<InclusionResult>> = vec![None; actions.len()];
        let mut block_events = Vec::new();

        for (position, &idx) in order.iter().enumerate() {
            let action = &actions[idx];
            let handler = &self.handlers[&action.call];
            let checkpoint = inner.state.clone();
            let result = match handler(&mut inner.state, action) {
                Ok(events) => {
                    block_events.extend(events.iter().cloned());
                    InclusionResult {
                        block: number,
                        index_in_block: position,
                        events,
                        dispatch_error: None,
                    }
                }
                Err(error) => {
                    inner.state = checkpoint;
                    InclusionResult {
                        block: number,
                        index_in_block: position,
                        events: vec![ChainEvent::new(
                            "system",
                            "ExtrinsicFailed",
                            json!({ "error": error }),
                        )],
                        dispatch_error: Some(error),
                    }
                }
            };
            results[idx] = Some(result);
        }

        let writes = std::mem::take(&mut inner.state.journal);
        inner.best_block = number;
        inner.blocks.push(SealedBlock {
            number,
            sealed_at: Instant::now(),
            writes,
            events: block_events,
        });
        debug!(block = number, actions = actions.len(), "sealed block");

        results
            .into_iter()
            .map(|r| r.ok_or_else(|| anyhow!("action missing from block {number}")))
            .collect()
    }

    /// Height and storage as seen by the indexer right now.
    fn indexed_view(&self) -> (u64, BTreeMap<String, Value>, Vec<(u64, ChainEvent)>) {
        let now = Instant::now();
        let inner = self.lock();
        let mut height = 0;
        let mut storage = BTreeMap::new();
        let mut events = Vec::new();
        for block in inner
            .blocks
            .iter()
            .take_while(|b| b.sealed_at + self.indexer_lag <= now)
        {
            height = block.number;
            for (key, value) in &block.writes {
                match value {
                    Some(v) => storage.insert(key.clone(), v.clone()),
                    None => storage.remove(key),
                };
            }
            events.extend(block.events.iter().cloned().map(|e| (block.number, e)));
        }
        (height, storage, events)
    }
}

#[async_trait]
impl Backend for MemoryChain {
    async fn submit(&self, actions: Vec<SignedAction>) -> Result<Vec<InclusionResult>> {
        if actions.is_empty() {
            return Ok(Vec::new());
        }
        tokio::time::sleep(self.block_time).await;
        self.seal_block(&actions)
    }

    async fn read_state(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock().state.get(key).cloned())
    }

    async fn best_block(&self) -> Result<u64> {
        Ok(self.lock().best_block)
    }
}

#[async_trait]
impl QueryClient for MemoryChain {
    /// Supported queries: `state {key}`, `proposal {id}`, `events {section, method}`, `height`.
    async fn query(&self, name: &str, variables: Value) -> Result<Value> {
        let (height, storage, events) = self.indexed_view();
        match name {
            "height" => Ok(json!(height)),
            "state" => {
                let key = str_arg(&variables, "key")?;
                Ok(storage.get(key).cloned().unwrap_or(Value::Null))
            }
            "proposal" => {
                let id = variables
                    .get("id")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| anyhow!("missing numeric argument 'id'"))?;
                Ok(storage
                    .get(&format!("proposals/{id}"))
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            "events" => {
                let section = str_arg(&variables, "section")?;
                let method = str_arg(&variables, "method")?;
                let matching: Vec<Value> = events
                    .into_iter()
                    .filter(|(_, e)| e.is(section, method))
                    .map(|(block, e)| json!({ "block": block, "data": e.data }))
                    .collect();
                Ok(Value::Array(matching))
            }
            other => bail!("unknown query '{other}'"),
        }
    }
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing string argument '{name}'"))
}

fn call_arg<'a>(action: &'a SignedAction, name: &str) -> Result<&'a Value, String> {
    action
        .args
        .get(name)
        .ok_or_else(|| format!("MissingArgument({name})"))
}

fn kv_set(state: &mut ChainState, action: &SignedAction) -> Result<Vec<ChainEvent>, String> {
    let key = call_arg(action, "key")?
        .as_str()
        .ok_or("InvalidKey")?
        .to_string();
    let value = call_arg(action, "value")?.clone();
    state.set(key.clone(), value.clone());
    Ok(vec![ChainEvent::new(
        "kv",
        "ValueSet",
        json!({ "key": key, "value": value, "signer": action.signer }),
    )])
}

fn kv_remove(state: &mut ChainState, action: &SignedAction) -> Result<Vec<ChainEvent>, String> {
    let key = call_arg(action, "key")?.as_str().ok_or("InvalidKey")?;
    state.remove(key).ok_or("KeyNotFound")?;
    Ok(vec![ChainEvent::new("kv", "ValueRemoved", json!({ "key": key }))])
}

fn proposal_create(
    state: &mut ChainState,
    action: &SignedAction,
) -> Result<Vec<ChainEvent>, String> {
    let title = call_arg(action, "title")?.clone();
    let active = state.get_u64(ACTIVE_PROPOSALS_KEY);
    if active >= MAX_ACTIVE_PROPOSALS {
        return Err("TooManyActiveProposals".to_string());
    }
    let id = state.get_u64(NEXT_PROPOSAL_KEY);
    state.set(NEXT_PROPOSAL_KEY, json!(id + 1));
    state.set(ACTIVE_PROPOSALS_KEY, json!(active + 1));
    state.set(
        format!("proposals/{id}"),
        json!({ "title": title, "proposer": action.signer, "status": "active" }),
    );
    Ok(vec![ChainEvent::new(
        "proposals",
        "ProposalCreated",
        json!({ "id": id, "proposer": action.signer }),
    )])
}

fn proposal_finalize(
    state: &mut ChainState,
    action: &SignedAction,
) -> Result<Vec<ChainEvent>, String> {
    let id = call_arg(action, "id")?.as_u64().ok_or("InvalidProposalId")?;
    let key = format!("proposals/{id}");
    let mut proposal = state.get(&key).cloned().ok_or("ProposalNotFound")?;
    if proposal["status"] != "active" {
        return Err("ProposalNotActive".to_string());
    }
    proposal["status"] = json!("executed");
    state.set(key, proposal);
    let active = state.get_u64(ACTIVE_PROPOSALS_KEY);
    state.set(ACTIVE_PROPOSALS_KEY, json!(active.saturating_sub(1)));
    Ok(vec![ChainEvent::new(
        "proposals",
        "ProposalExecuted",
        json!({ "id": id }),
    )])
}
