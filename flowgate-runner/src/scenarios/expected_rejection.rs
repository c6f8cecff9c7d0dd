//! Expected-failure fixtures: actions the runtime must reject with a named
//! dispatch error.

use anyhow::Result;
use serde_json::json;

use flowgate_core::{
    ensure_that, flow, ActionFixture, FixtureRunner, FlowProps, Resource, ScenarioBuilder,
    SignedAction, UsageError, MAX_ACTIVE_PROPOSALS,
};

use super::proposal_status_check;

pub fn define(s: &mut ScenarioBuilder<'_>) -> Result<(), UsageError> {
    s.job("proposal-cap", vec![flow(exceed_proposal_cap)])?;
    s.job("missing-key", vec![flow(remove_missing_key)])?;
    Ok(())
}

/// Fill every proposal slot, check the next one is refused, then execute
/// the filled proposals so the slots free up again.
async fn exceed_proposal_cap(props: FlowProps) -> Result<()> {
    let slots = props.ctx.env.resource_limits.limit(Resource::Proposals);
    for _ in 0..slots {
        props.lock.lock(Resource::Proposals).await?;
    }

    let proposers = props.ctx.keys.create_accounts(MAX_ACTIVE_PROPOSALS as usize + 1);
    let actions: Vec<_> = proposers
        .iter()
        .enumerate()
        .map(|(i, proposer)| {
            SignedAction::new(proposer.clone(), "proposal.create", json!({ "title": format!("cap {i}") }))
        })
        .collect();
    let (fill, overflow) = actions.split_at(MAX_ACTIVE_PROPOSALS as usize);

    let mut filled = FixtureRunner::new(ActionFixture::new("fill-proposals", fill.to_vec()).ordered());
    filled.run_and_verify(&props.ctx).await?;
    let ids: Vec<u64> = filled
        .fixture()
        .events("proposals", "ProposalCreated")
        .iter()
        .filter_map(|e| e.data["id"].as_u64())
        .collect();
    ensure_that!(
        ids.len() == MAX_ACTIVE_PROPOSALS as usize,
        "expected {} created proposals, got {}",
        MAX_ACTIVE_PROPOSALS,
        ids.len()
    );

    FixtureRunner::new(
        ActionFixture::new("proposal-over-cap", overflow.to_vec())
            .expect_rejection("TooManyActiveProposals"),
    )
    .run_and_verify(&props.ctx)
    .await?;

    for (id, proposer) in ids.iter().zip(&proposers) {
        let execute = SignedAction::new(proposer.clone(), "proposal.finalize", json!({ "id": id }));
        FixtureRunner::new(
            ActionFixture::new("execute-proposal", vec![execute])
                .with_convergence(proposal_status_check(*id, "executed")),
        )
        .run_and_verify(&props.ctx)
        .await?;
    }
    Ok(())
}

async fn remove_missing_key(props: FlowProps) -> Result<()> {
    let signer = props.ctx.keys.create_account();
    let remove = SignedAction::new(signer, "kv.remove", json!({ "key": "absent/key" }));
    FixtureRunner::new(ActionFixture::new("remove-missing-key", vec![remove]).expect_rejection("KeyNotFound"))
        .run_and_verify(&props.ctx)
        .await
}
