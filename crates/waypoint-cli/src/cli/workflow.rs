//! CLI workflow subcommands.
//!
//! Provides workflows, run, show, list, resume, recover, and delete.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result, anyhow, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use waypoint_core::repository::StateRepository;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{WorkflowState, WorkflowStatus};

use crate::cli::output::{print_state, print_state_list};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

pub fn handle_workflows(state: &AppState, json: bool) -> Result<()> {
    let workflows: Vec<_> = state
        .engine
        .workflows()
        .into_iter()
        .filter_map(|name| state.engine.workflow(&name))
        .collect();

    if json {
        let out: Vec<_> = workflows
            .iter()
            .map(|w| {
                serde_json::json!({
                    "name": w.name(),
                    "steps": w.steps().iter().map(|s| s.name()).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Steps"),
            Cell::new("Sequence"),
        ]);

    for w in &workflows {
        let sequence: Vec<String> = w
            .steps()
            .iter()
            .map(|s| format!("{} ({})", s.name(), s.kind()))
            .collect();
        table.add_row(vec![
            Cell::new(w.name()),
            Cell::new(w.step_count()),
            Cell::new(sequence.join(" -> ")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    workflow: &str,
    input: Option<&str>,
    json: bool,
) -> Result<()> {
    let input = parse_input(input)?;

    let mut events = state.engine.subscribe();
    let id = state
        .engine
        .start(CancellationToken::new(), workflow, input)
        .await?;

    if !json {
        println!();
        println!(
            "  {} Started '{}' as {}",
            style("*").green().bold(),
            style(workflow).cyan(),
            style(&id).dim()
        );
    }

    wait_settled(state, &mut events, HashSet::from([id.clone()])).await;
    print_state(&final_state(state, &id).await?, json)
}

/// Parse `--input` into the initial data map.
fn parse_input(raw: Option<&str>) -> Result<HashMap<String, Value>> {
    let Some(raw) = raw else {
        return Ok(HashMap::new());
    };
    match serde_json::from_str::<Value>(raw).context("Invalid JSON input")? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => bail!("Input must be a JSON object, got: {other}"),
    }
}

// ---------------------------------------------------------------------------
// Show / List
// ---------------------------------------------------------------------------

pub async fn handle_show(state: &AppState, id: &str, json: bool) -> Result<()> {
    print_state(&final_state(state, id).await?, json)
}

pub async fn handle_list(
    state: &AppState,
    status: Option<&str>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let states = match status {
        Some(raw) => {
            let status: WorkflowStatus = raw.parse().map_err(|e: String| anyhow!(e))?;
            let mut states = state
                .repo
                .list_by_status(status)
                .await
                .map_err(|e| anyhow!("Failed to list workflows: {e}"))?;
            states.reverse();
            states.truncate(limit as usize);
            states
        }
        None => state
            .repo
            .list_recent(limit)
            .await
            .map_err(|e| anyhow!("Failed to list workflows: {e}"))?,
    };
    print_state_list(&states, json)
}

// ---------------------------------------------------------------------------
// Resume / Recover
// ---------------------------------------------------------------------------

pub async fn handle_resume(
    state: &AppState,
    id: &str,
    checkpoint: Option<&str>,
    json: bool,
) -> Result<()> {
    let mut events = state.engine.subscribe();
    let cancel = CancellationToken::new();
    match checkpoint {
        Some(label) => state.engine.resume_from_checkpoint(cancel, id, label).await?,
        None => state.engine.resume(cancel, id).await?,
    }

    if !json {
        println!();
        println!(
            "  {} Resumed {}{}",
            style("*").green().bold(),
            style(id).cyan(),
            checkpoint
                .map(|label| format!(" from checkpoint '{label}'"))
                .unwrap_or_default()
        );
    }

    wait_settled(state, &mut events, HashSet::from([id.to_string()])).await;
    print_state(&final_state(state, id).await?, json)
}

pub async fn handle_recover(state: &AppState, json: bool) -> Result<()> {
    let mut events = state.engine.subscribe();
    let ids = state.engine.recover(CancellationToken::new()).await?;

    if !json && !ids.is_empty() {
        println!();
        println!(
            "  {} Recovering {} interrupted instance(s)",
            style("*").green().bold(),
            ids.len()
        );
    }
    wait_settled(state, &mut events, ids.iter().cloned().collect()).await;

    let mut states = Vec::with_capacity(ids.len());
    for id in &ids {
        states.push(final_state(state, id).await?);
    }
    if !json && states.is_empty() {
        println!();
        println!("  Nothing to recover.");
        println!();
        return Ok(());
    }
    print_state_list(&states, json)
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

pub async fn handle_delete(state: &AppState, id: &str, force: bool, json: bool) -> Result<()> {
    let stored = final_state(state, id).await?;
    if !deletable(stored.status, force) {
        bail!(
            "Workflow instance '{id}' is {}; finish it first or pass --force",
            stored.status
        );
    }

    let removed = state
        .repo
        .delete(id)
        .await
        .map_err(|e| anyhow!("Failed to delete workflow: {e}"))?;
    tracing::info!(state_id = id, status = %stored.status, removed, "workflow instance deleted");

    if json {
        let out = serde_json::json!({ "id": id, "deleted": removed });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!("  {} Deleted {}", style("x").red().bold(), style(id).cyan());
        println!();
    }
    Ok(())
}

/// Unfinished instances are only removed on request.
fn deletable(status: WorkflowStatus, force: bool) -> bool {
    force || status.is_terminal()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) async fn final_state(state: &AppState, id: &str) -> Result<WorkflowState> {
    state
        .engine
        .load_state(id)
        .await?
        .ok_or_else(|| anyhow!("Workflow instance '{id}' not found"))
}

/// Block until every id in `ids` completes, fails, or pauses.
///
/// Ctrl+C cancels the instances still executing and keeps waiting for them
/// to settle.
pub(crate) async fn wait_settled(
    state: &AppState,
    events: &mut broadcast::Receiver<WorkflowEvent>,
    ids: HashSet<String>,
) {
    let mut waiting = ids;
    let mut interrupted = false;

    while !waiting.is_empty() {
        tokio::select! {
            result = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if result.is_ok() {
                    eprintln!("  {} cancelling...", style("!").yellow().bold());
                    for id in &waiting {
                        state.engine.cancel(id);
                    }
                }
            }
            event = events.recv() => match event {
                Ok(event) if event.is_settled() => {
                    waiting.remove(event.state_id());
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event stream lagged, re-checking instances");
                    waiting.retain(|id| {
                        state.engine.get_state(id).is_some_and(|s| {
                            matches!(
                                s.status,
                                WorkflowStatus::Pending
                                    | WorkflowStatus::Running
                                    | WorkflowStatus::Compensating
                            )
                        })
                    });
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
