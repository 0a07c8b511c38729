use super::Runtime;
use crate::Target;
use colored::Colorize;
use tfbridge_exec::OpContext;

pub async fn handle(runtime: &Runtime, target: &Target) -> anyhow::Result<()> {
    let ctx = OpContext::background();
    let ws = runtime.open(target, &ctx).await?;

    let result = ws.refresh(&ctx).await?;
    if result.async_in_progress {
        println!("{}", "An async operation is still running".yellow());
        return Ok(());
    }
    if let Some(state) = &result.state {
        runtime.observe(target, state);
    }

    if result.exists {
        println!("{} {}", "✓".green().bold(), "Resource exists".green());
        if let Some(id) = result.state.as_ref().and_then(|s| s.id()) {
            println!("  id: {}", id.cyan());
        }
    } else {
        println!("{} {}", "✗".yellow().bold(), "Resource does not exist".yellow());
    }
    Ok(())
}
