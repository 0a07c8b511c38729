use super::Runtime;
use crate::Target;
use colored::Colorize;
use tfbridge_exec::OpContext;

pub async fn handle(
    runtime: &Runtime,
    target: &Target,
    resource_type: &str,
    name: &str,
    id: Option<&str>,
) -> anyhow::Result<()> {
    println!(
        "{}",
        format!("Importing {}.{}...", resource_type, name).blue()
    );

    let ctx = OpContext::background();
    let ws = runtime.open(target, &ctx).await?;

    let result = ws.import(&ctx, resource_type, name, id).await?;
    match &result.state {
        Some(state) if result.exists => {
            runtime.observe(target, state);
            println!("{}", "✓ Import complete".green().bold());
            if let Some(id) = state.id() {
                println!("  id: {}", id.cyan());
            }
        }
        _ => println!("{}", "Remote object does not exist".yellow()),
    }
    Ok(())
}
