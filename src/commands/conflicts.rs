use anyhow::{Context, Result};
use billsync_core::{ConflictChoice, ConflictId};
use owo_colors::OwoColorize;

use super::App;
use crate::render::Render;

pub fn list(app: &App) -> Result<()> {
    let conflicts = app.engine.conflicts();
    if app.json {
        return app.print_json(&conflicts);
    }
    if conflicts.is_empty() {
        println!("{}", "No conflicts".dimmed());
        return Ok(());
    }
    for conflict in &conflicts {
        println!("{}", conflict.render());
    }
    println!(
        "\n{}",
        "Resolve with `billsync resolve <id> --keep local|remote`".dimmed()
    );
    Ok(())
}

pub fn resolve(app: &App, id: ConflictId, choice: ConflictChoice) -> Result<()> {
    app.engine
        .resolve_conflict(id, choice)
        .with_context(|| format!("Failed to resolve conflict {id}"))?;
    if app.json {
        return app.print_json(&serde_json::json!({ "resolved": id, "choice": choice }));
    }
    let kept = match choice {
        ConflictChoice::KeepLocal => "bill",
        ConflictChoice::KeepRemote => "calendar",
    };
    println!("{} Resolved {} keeping the {} version", "✓".green(), id, kept);
    Ok(())
}
