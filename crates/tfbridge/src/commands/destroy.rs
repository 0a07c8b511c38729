use super::Runtime;
use crate::Target;
use colored::Colorize;
use std::sync::Arc;
use tfbridge_core::ResourceId;
use tfbridge_exec::OpContext;

pub async fn handle(runtime: &Runtime, target: &Target, run_async: bool) -> anyhow::Result<()> {
    println!("{}", format!("Destroying {}...", target.resource).blue());

    let ctx = OpContext::background();
    let ws = runtime.open(target, &ctx).await?;

    if run_async {
        let async_ws = Arc::clone(&ws);
        super::run_async(runtime, target, "destroy", move |callback| {
            async_ws.destroy_async(callback)
        })
        .await?;
    } else {
        ws.destroy(&ctx).await?;
    }

    let id = ResourceId::new(&target.resource);
    runtime.store.remove(&id).await?;
    runtime.trackers.remove_tracker(&id);
    println!("{}", "✓ Destroy complete".green().bold());
    Ok(())
}
