use super::Runtime;
use crate::Target;
use colored::Colorize;
use std::sync::Arc;
use tfbridge_exec::OpContext;

pub async fn handle(runtime: &Runtime, target: &Target, run_async: bool) -> anyhow::Result<()> {
    println!("{}", format!("Applying {}...", target.resource).blue());

    let ctx = OpContext::background();
    let ws = runtime.open(target, &ctx).await?;

    if run_async {
        let async_ws = Arc::clone(&ws);
        super::run_async(runtime, target, "apply", move |callback| {
            async_ws.apply_async(callback)
        })
        .await?;
        return Ok(());
    }

    let result = ws.apply(&ctx).await?;
    runtime.observe(target, &result.state);
    println!("{}", "✓ Apply complete".green().bold());
    if let Some(id) = result.state.id() {
        println!("  id: {}", id.cyan());
    }
    Ok(())
}
