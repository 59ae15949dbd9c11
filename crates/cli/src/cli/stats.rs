use anyhow::Result;
use engine::Engine;

pub async fn cmd(engine: &Engine) -> Result<i32> {
    engine.start().await?;
    let stats = engine.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(0)
}
