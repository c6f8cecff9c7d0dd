//! Smoke scenario: register members, push more proposals than the runtime
//! allows at once through the `Proposals` lock, then check tip ordering.

use anyhow::{anyhow, Result};
use serde_json::{json, Value};

use flowgate_core::{
    ensure_that, flow, ActionFixture, ConvergenceCheck, FixtureRunner, FlowProps, Resource,
    ScenarioBuilder, SignedAction, UsageError,
};

use super::{created_proposal_id, proposal_status_check};

const MEMBERS: usize = 4;
/// Deliberately above the active-proposal cap.
const PROPOSALS: usize = 7;
const ORDERED_WRITERS: usize = 3;
const LAST_WRITER_KEY: &str = "ordering/last-writer";

pub fn define(s: &mut ScenarioBuilder<'_>) -> Result<(), UsageError> {
    let members = s.job("create-members", vec![flow(create_members)])?;
    let proposals = s.job(
        "proposals",
        (0..PROPOSALS).map(|_| flow(propose_and_execute)).collect(),
    )?;
    let ordering = s.job("tip-ordering", vec![flow(ordered_writes)])?;

    proposals.requires(&members)?;
    ordering.after(&proposals)?;
    Ok(())
}

async fn create_members(props: FlowProps) -> Result<()> {
    let members = props.ctx.keys.create_accounts(MEMBERS);
    let last = members
        .last()
        .map(|m| format!("members/{m}"))
        .ok_or_else(|| anyhow!("no members created"))?;
    let actions = members
        .iter()
        .map(|member| {
            SignedAction::new(
                member.clone(),
                "kv.set",
                json!({ "key": format!("members/{member}"), "value": { "active": true } }),
            )
        })
        .collect();

    let check = ConvergenceCheck::new(
        "members indexed",
        "state",
        json!({ "key": last }),
        |member: &Value, _| {
            ensure_that!(member["active"] == true, "member not indexed yet: {}", member);
            Ok(())
        },
    );
    FixtureRunner::new(ActionFixture::new("register-members", actions).with_convergence(check))
        .run_and_verify(&props.ctx)
        .await
}

async fn propose_and_execute(props: FlowProps) -> Result<()> {
    let slot = props.lock.lock(Resource::Proposals).await?;
    let proposer = props.ctx.keys.create_account();

    let create = SignedAction::new(
        proposer.clone(),
        "proposal.create",
        json!({ "title": format!("smoke {}", props.label) }),
    );
    let mut created = FixtureRunner::new(ActionFixture::new("create-proposal", vec![create]));
    created.run_and_verify(&props.ctx).await?;
    let id = created_proposal_id(created.fixture().results())?;

    props
        .ctx
        .poll_until(&format!("proposal {id} active"), || {
            let query = props.ctx.query.clone();
            async move {
                let proposal = query.query("proposal", json!({ "id": id })).await?;
                ensure_that!(
                    proposal["status"] == "active",
                    "proposal {} indexed as {}",
                    id,
                    proposal["status"]
                );
                Ok(())
            }
        })
        .await?;

    let execute = SignedAction::new(proposer, "proposal.finalize", json!({ "id": id }));
    FixtureRunner::new(
        ActionFixture::new("execute-proposal", vec![execute])
            .with_convergence(proposal_status_check(id, "executed")),
    )
    .run_and_verify(&props.ctx)
    .await?;

    slot.release();
    Ok(())
}

/// Writers from distinct accounts in one block, ordered by decremental tips.
/// Tip ordering is a hint to the block author; against a live network this
/// check can be flaky.
async fn ordered_writes(props: FlowProps) -> Result<()> {
    let writers = props.ctx.keys.create_accounts(ORDERED_WRITERS);
    let last = writers
        .last()
        .cloned()
        .ok_or_else(|| anyhow!("no writers created"))?;
    let actions = writers
        .iter()
        .map(|writer| {
            SignedAction::new(
                writer.clone(),
                "kv.set",
                json!({ "key": LAST_WRITER_KEY, "value": writer }),
            )
        })
        .collect();

    let check = ConvergenceCheck::new(
        "last writer indexed",
        "state",
        json!({ "key": LAST_WRITER_KEY }),
        move |indexed: &Value, _| {
            ensure_that!(
                indexed.as_str() == Some(last.as_str()),
                "last writer indexed as {}, expected {}",
                indexed,
                last
            );
            Ok(())
        },
    );
    let mut fixture = FixtureRunner::new(
        ActionFixture::new("ordered-writes", actions)
            .ordered()
            .with_convergence(check),
    );
    fixture.run(&props.ctx).await?;

    let positions: Vec<usize> = fixture
        .fixture()
        .results()
        .iter()
        .map(|r| r.index_in_block)
        .collect();
    ensure_that!(
        positions.windows(2).all(|pair| pair[0] < pair[1]),
        "actions included out of submission order: {:?}",
        positions
    );
    fixture.verify_convergence(&props.ctx).await
}
