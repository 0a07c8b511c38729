use super::Runtime;
use crate::Target;
use colored::Colorize;
use tfbridge_exec::OpContext;

pub async fn handle(runtime: &Runtime, target: &Target) -> anyhow::Result<()> {
    let ctx = OpContext::background();
    let ws = runtime.open(target, &ctx).await?;

    let result = ws.plan(&ctx).await?;
    let exists = if result.exists { "yes".green() } else { "no".yellow() };
    let up_to_date = if result.up_to_date { "yes".green() } else { "no".yellow() };
    println!("  exists:     {}", exists);
    println!("  up to date: {}", up_to_date);
    Ok(())
}
