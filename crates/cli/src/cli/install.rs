use anyhow::Result;
use engine::Engine;

pub async fn cmd(engine: &Engine) -> Result<i32> {
    engine.ensure_installed().await?;
    println!("installed into {}", engine.pool().layout().doc_root);
    Ok(0)
}
