//! Built-in demo workflows registered by the `wp` binary.
//!
//! Every demo step honours a `fail_at` input naming the step that should
//! fail, which makes it easy to watch compensation and resume from the CLI:
//!
//! ```text
//! wp run order-fulfillment --input '{"items": 3, "total": 250, "fail_at": "ship"}'
//! ```

use std::time::Duration;

use serde_json::{Value, json};
use waypoint_core::workflow::{
    ActionBuilder, Branch, DefinitionError, JoinPolicy, RetryPolicy, StateHandle, StepContext,
    StepError, Workflow, WorkflowBuilder,
};

pub const ORDER_FULFILLMENT: &str = "order-fulfillment";
pub const EXPENSE_APPROVAL: &str = "expense-approval";

/// All demo workflows.
pub fn workflows() -> Result<Vec<Workflow>, DefinitionError> {
    Ok(vec![order_fulfillment()?, expense_approval()?])
}

/// Fail when the run's `fail_at` input names this step.
fn injected_failure(ctx: &StepContext, state: &StateHandle) -> Result<(), StepError> {
    match state.get("fail_at") {
        Some(Value::String(step)) if step == ctx.step_name() => Err(StepError::failed(format!(
            "injected failure at '{step}'"
        ))),
        _ => Ok(()),
    }
}

fn number(state: &StateHandle, key: &str) -> f64 {
    state.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0)
}

/// Step that only reports what it did.
async fn announce(ctx: StepContext, state: StateHandle) -> Result<(), StepError> {
    injected_failure(&ctx, &state)?;
    tracing::info!(state_id = ctx.state_id(), step = ctx.step_name(), "step done");
    ctx.set_result(json!({ "done": true }));
    Ok(())
}

/// Compensation that records the rollback under `rolled_back`.
async fn roll_back(ctx: StepContext, state: StateHandle) -> Result<(), StepError> {
    tracing::info!(state_id = ctx.state_id(), step = ctx.step_name(), "rolling back");
    let mut undone = match state.get("rolled_back") {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    undone.push(json!(ctx.step_name()));
    state.set("rolled_back", Value::Array(undone));
    Ok(())
}

// ---------------------------------------------------------------------------
// order-fulfillment
// ---------------------------------------------------------------------------

async fn validate_order(ctx: StepContext, state: StateHandle) -> Result<(), StepError> {
    injected_failure(&ctx, &state)?;
    let items = number(&state, "items");
    if items < 1.0 {
        return Err(StepError::failed("order has no items"));
    }
    ctx.set_result(json!({ "items": items }));
    Ok(())
}

async fn charge_payment(ctx: StepContext, state: StateHandle) -> Result<(), StepError> {
    injected_failure(&ctx, &state)?;
    if state.get("card") == Some(json!("declined")) {
        return Err(StepError::failed("card declined"));
    }
    let total = number(&state, "total");
    ctx.set_result(json!({ "charged": total, "attempt": ctx.attempt() }));
    Ok(())
}

/// validate -> reserve -> charge -> shipping method -> notify in parallel.
pub fn order_fulfillment() -> Result<Workflow, DefinitionError> {
    WorkflowBuilder::new(ORDER_FULFILLMENT)
        .action("validate", validate_order)
        .action("reserve-inventory", announce)
        .compensate(roll_back)
        .action_with(
            ActionBuilder::new("charge-payment", charge_payment)
                .retry(RetryPolicy::new(3).with_backoff(
                    Duration::from_millis(200),
                    2.0,
                    Duration::from_secs(2),
                ))
                .timeout(Duration::from_secs(10))
                .compensate(roll_back),
        )
        .conditional(
            "shipping",
            |s| s.get("total").and_then(|v| v.as_f64()).unwrap_or(0.0) > 100.0,
            |b| b.action("express-ship", announce),
            |b| b.action("standard-ship", announce),
        )
        .parallel(
            "notify",
            JoinPolicy::WaitAll,
            [
                Branch::new().action("email-customer", announce),
                Branch::new().action("update-crm", announce),
            ],
        )
        .build()
}

// ---------------------------------------------------------------------------
// expense-approval
// ---------------------------------------------------------------------------

async fn submit_expense(ctx: StepContext, state: StateHandle) -> Result<(), StepError> {
    injected_failure(&ctx, &state)?;
    let amount = number(&state, "amount");
    if amount <= 0.0 {
        return Err(StepError::failed("expense amount must be positive"));
    }
    ctx.set_result(json!({ "amount": amount }));
    Ok(())
}

/// submit -> review gate (manager + finance, 72h) -> payout -> notify.
pub fn expense_approval() -> Result<Workflow, DefinitionError> {
    WorkflowBuilder::new(EXPENSE_APPROVAL)
        .action("submit", submit_expense)
        .compensate(roll_back)
        .approval(
            "review",
            ["manager", "finance"],
            Some(Duration::from_secs(72 * 60 * 60)),
        )
        .action("payout", announce)
        .compensate(roll_back)
        .action("notify", announce)
        .build()
}
