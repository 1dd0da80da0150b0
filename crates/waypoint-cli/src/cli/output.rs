//! Styled and JSON rendering of workflow states.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use waypoint_types::workflow::{WorkflowState, WorkflowStatus};

fn status_color(status: WorkflowStatus) -> Color {
    match status {
        WorkflowStatus::Pending => Color::White,
        WorkflowStatus::Running => Color::Blue,
        WorkflowStatus::Paused => Color::Yellow,
        WorkflowStatus::Compensating => Color::Magenta,
        WorkflowStatus::Completed => Color::Green,
        WorkflowStatus::Failed => Color::Red,
    }
}

pub fn status_cell(status: WorkflowStatus) -> Cell {
    Cell::new(status.as_str()).fg(status_color(status))
}

/// One-line colored status for plain output.
pub fn styled_status(status: WorkflowStatus) -> String {
    let text = status.as_str();
    match status {
        WorkflowStatus::Completed => style(text).green().bold().to_string(),
        WorkflowStatus::Failed => style(text).red().bold().to_string(),
        WorkflowStatus::Paused => style(text).yellow().bold().to_string(),
        WorkflowStatus::Compensating => style(text).magenta().to_string(),
        _ => style(text).blue().to_string(),
    }
}

/// Print a single state in full.
pub fn print_state(state: &WorkflowState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(state)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} ({})",
        style("Instance").bold(),
        style(&state.id).cyan(),
        state.workflow_id
    );
    println!("  Status:       {}", styled_status(state.status));
    println!("  Current step: {}", state.current_step);
    println!("  Started:      {}", state.started_at.to_rfc3339());
    if let Some(completed) = state.completed_at {
        println!("  Completed:    {}", completed.to_rfc3339());
    }

    if !state.step_results.is_empty() {
        let mut results: Vec<_> = state.step_results.iter().collect();
        results.sort_by(|a, b| a.0.cmp(b.0));

        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![Cell::new("Step").fg(Color::Cyan), Cell::new("Result")]);
        for (step, value) in results {
            table.add_row(vec![Cell::new(step), Cell::new(value.to_string())]);
        }
        println!();
        println!("{table}");
    }

    if !state.checkpoints.is_empty() {
        let mut labels: Vec<_> = state.checkpoints.iter().collect();
        labels.sort_by_key(|(_, index)| **index);
        let labels: Vec<String> = labels
            .into_iter()
            .map(|(label, index)| format!("{label}@{index}"))
            .collect();
        println!();
        println!("  Checkpoints: {}", labels.join(", "));
    }

    if let Some(pending) = &state.pending_approval {
        println!();
        println!(
            "  {} Waiting on '{}'",
            style("!").yellow().bold(),
            style(&pending.step_name).cyan()
        );
        println!(
            "  Approved by: {}",
            if pending.votes.is_empty() {
                "-".to_string()
            } else {
                pending.votes.iter().cloned().collect::<Vec<_>>().join(", ")
            }
        );
        println!("  Remaining:   {}", pending.remaining().join(", "));
        if let Some(expires) = pending.expires_at {
            println!("  Expires:     {}", expires.to_rfc3339());
        }
    }

    if !state.errors.is_empty() {
        println!();
        println!("  {}", style("Errors").red().bold());
        for error in &state.errors {
            println!("    {} {error}", style("x").red());
        }
    }
    println!();
    Ok(())
}

/// Print a list of states as a table.
pub fn print_state_list(states: &[WorkflowState], json: bool) -> Result<()> {
    if json {
        let out: Vec<_> = states
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.id,
                    "workflow": s.workflow_id,
                    "status": s.status,
                    "current_step": s.current_step,
                    "started_at": s.started_at.to_rfc3339(),
                    "errors": s.errors.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if states.is_empty() {
        println!();
        println!("  No workflow instances found.");
        println!("  Start one with: {}", style("wp run <workflow>").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Step"),
            Cell::new("Started"),
            Cell::new("Errors"),
        ]);

    for s in states {
        table.add_row(vec![
            Cell::new(&s.id),
            Cell::new(&s.workflow_id),
            status_cell(s.status),
            Cell::new(s.current_step),
            Cell::new(s.started_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(s.errors.len()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
