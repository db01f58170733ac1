use anyhow::Result;
use owo_colors::OwoColorize;

use super::App;
use crate::render::Render;

/// Recent results shown below the summary.
const RECENT_SHOWN: usize = 10;

pub fn run(app: &App) -> Result<()> {
    let status = app.engine.get_status();
    if app.json {
        return app.print_json(&status);
    }

    println!("{}", status.render());

    let failed = app.engine.failed_operations();
    if !failed.is_empty() {
        println!("\n{}", "Needs attention:".bold());
        for op in &failed {
            println!("   {}", op.render());
        }
        println!("   {}", "Run `billsync retry` to try again.".dimmed());
    }

    if !status.recent.is_empty() {
        println!("\n{}", "Recent:".bold());
        let skip = status.recent.len().saturating_sub(RECENT_SHOWN);
        for result in status.recent.iter().skip(skip) {
            println!("   {}", result.render());
        }
    }
    Ok(())
}
