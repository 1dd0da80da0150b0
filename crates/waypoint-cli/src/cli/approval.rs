//! CLI approval subcommands: approve, reject, expire.

use std::collections::HashSet;

use anyhow::Result;
use console::style;

use waypoint_core::workflow::ApprovalProgress;

use crate::cli::output::{print_state, print_state_list};
use crate::cli::workflow::{final_state, wait_settled};
use crate::state::AppState;

pub async fn handle_approve(state: &AppState, id: &str, approver: &str, json: bool) -> Result<()> {
    let mut events = state.engine.subscribe();
    let progress = state.engine.approve(id, approver).await?;

    match progress {
        ApprovalProgress::Pending { votes, remaining } => {
            if json {
                let out = serde_json::json!({
                    "id": id,
                    "approved_by": votes,
                    "remaining": remaining,
                    "resolved": false,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!();
                println!(
                    "  {} Approval by '{}' recorded",
                    style("*").green().bold(),
                    style(approver).cyan()
                );
                println!("  Still waiting on: {}", remaining.join(", "));
                println!();
            }
            Ok(())
        }
        ApprovalProgress::Resolved(_) => {
            if !json {
                println!();
                println!(
                    "  {} Approved by '{}', continuing {}",
                    style("*").green().bold(),
                    style(approver).cyan(),
                    style(id).dim()
                );
            }
            wait_settled(state, &mut events, HashSet::from([id.to_string()])).await;
            print_state(&final_state(state, id).await?, json)
        }
    }
}

pub async fn handle_reject(
    state: &AppState,
    id: &str,
    approver: &str,
    reason: &str,
    json: bool,
) -> Result<()> {
    let mut events = state.engine.subscribe();
    state.engine.reject(id, approver, reason).await?;

    if !json {
        println!();
        println!(
            "  {} Rejected by '{}', rolling back {}",
            style("x").red().bold(),
            style(approver).cyan(),
            style(id).dim()
        );
    }
    wait_settled(state, &mut events, HashSet::from([id.to_string()])).await;
    print_state(&final_state(state, id).await?, json)
}

pub async fn handle_expire(state: &AppState, json: bool) -> Result<()> {
    let mut events = state.engine.subscribe();
    let ids = state.engine.expire_approvals(chrono::Utc::now()).await;
    wait_settled(state, &mut events, ids.iter().cloned().collect()).await;

    if !json && ids.is_empty() {
        println!();
        println!("  No expired approvals.");
        println!();
        return Ok(());
    }

    let mut states = Vec::with_capacity(ids.len());
    for id in &ids {
        states.push(final_state(state, id).await?);
    }
    print_state_list(&states, json)
}
