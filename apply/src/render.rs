use std::fmt::Write;

use veld_diff::{DiffAction, Plan, ReplaceOrder};
use veld_engine::ApplyReport;
use veld_graph::Input;

/// Render a plan for the terminal, one resource per line, secrets
/// redacted.
pub fn render_plan(plan: &Plan) -> String {
    let mut out = String::new();
    for planned in plan.resources() {
        match &planned.action {
            DiffAction::Create => {
                let _ = writeln!(out, "+ {}", planned.id);
                for (property, input) in &planned.definition.inputs {
                    let _ = writeln!(out, "    {property}: {}", render_input(input));
                }
            }
            DiffAction::NoOp => {
                let _ = writeln!(out, "= {}", planned.id);
            }
            DiffAction::Update { changed } => {
                let _ = writeln!(out, "~ {} ({})", planned.id, join(changed));
            }
            DiffAction::Replace { changed, order } => {
                let order = match order {
                    ReplaceOrder::CreateBeforeDelete => "create-before-delete",
                    ReplaceOrder::DeleteBeforeCreate => "delete-before-create",
                };
                let _ = writeln!(out, "± {} ({}) [{order}]", planned.id, join(changed));
            }
        }
    }
    for step in plan.deletes.iter().flatten() {
        let _ = writeln!(out, "- {}", step.id);
    }
    out
}

pub fn render_report(report: &ApplyReport) -> String {
    let mut out = String::new();
    for (id, status) in &report.statuses {
        let _ = writeln!(out, "{id}: {status}");
    }
    out
}

fn render_input(input: &Input) -> String {
    match input {
        Input::Value { secret: true, .. } => "[secret]".to_string(),
        Input::Value { value, .. } => value.to_string(),
        Input::Output(output) if output.is_secret() => "[secret]".to_string(),
        Input::Output(_) => "<computed>".to_string(),
    }
}

fn join(changed: &std::collections::BTreeSet<String>) -> String {
    changed.iter().cloned().collect::<Vec<_>>().join(", ")
}
