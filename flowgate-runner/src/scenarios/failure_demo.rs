//! Failure propagation demo.
//!
//! Job `a` runs two flows; one trips a contained assertion. `b` requires `a`
//! and is skipped without running. `c` only orders after `a` and still runs.
//! The scenario therefore exits non-zero.

use anyhow::Result;
use futures::FutureExt;
use serde_json::json;

use flowgate_core::{
    ensure_that, flow, ActionFixture, Context, FixtureRunner, FlowProps, FnFixture,
    ScenarioBuilder, SignedAction, UsageError,
};

const GREETING_KEY: &str = "demo/greeting";

pub fn define(s: &mut ScenarioBuilder<'_>) -> Result<(), UsageError> {
    let a = s.job("a", vec![flow(write_greeting), flow(remove_missing_key)])?;
    let b = s.job("b", vec![flow(read_greeting)])?;
    let c = s.job("c", vec![flow(read_greeting)])?;

    b.requires(&a)?;
    c.after(&a)?;
    Ok(())
}

async fn write_greeting(props: FlowProps) -> Result<()> {
    let signer = props.ctx.keys.create_account();
    let set = SignedAction::new(signer, "kv.set", json!({ "key": GREETING_KEY, "value": "hello" }));
    FixtureRunner::new(ActionFixture::new("write-greeting", vec![set]))
        .run_and_verify(&props.ctx)
        .await
}

/// Expects success, but the key was never written: the chain rejects the
/// removal with `KeyNotFound` and the fixture records an assertion failure.
async fn remove_missing_key(props: FlowProps) -> Result<()> {
    let signer = props.ctx.keys.create_account();
    let remove = SignedAction::new(signer, "kv.remove", json!({ "key": "demo/never-written" }));
    FixtureRunner::new(ActionFixture::new("remove-missing-key", vec![remove]))
        .run_and_verify(&props.ctx)
        .await
}

/// Reads the greeting back from the chain, then waits for the indexer.
async fn read_greeting(props: FlowProps) -> Result<()> {
    let fixture = FnFixture::new("read-greeting", |ctx: Context| {
        async move {
            let stored = ctx.backend.read_state(GREETING_KEY).await?;
            ensure_that!(
                stored == Some(json!("hello")),
                "greeting on chain is {:?}",
                stored
            );
            Ok::<_, anyhow::Error>(())
        }
        .boxed()
    })
    .with_convergence(|ctx: Context| {
        async move {
            ctx.poll_until("greeting indexed", || {
                let query = ctx.query.clone();
                async move {
                    let greeting = query.query("state", json!({ "key": GREETING_KEY })).await?;
                    ensure_that!(greeting == "hello", "greeting indexed as {}", greeting);
                    Ok(())
                }
            })
            .await?;
            Ok::<_, anyhow::Error>(())
        }
        .boxed()
    });
    FixtureRunner::new(fixture).run_and_verify(&props.ctx).await
}
