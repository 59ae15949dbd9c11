use anyhow::Result;
use engine::Engine;

/// Run a script by path, or the configured entry when no path is given.
pub async fn cmd(engine: &Engine, path: Option<String>) -> Result<i32> {
    engine.start().await?;
    let output = match path {
        Some(path) => engine.run(path).await?,
        None => engine.run_entry().await?,
    };
    print_output(&output);
    Ok(0)
}

pub async fn eval(engine: &Engine, code: String) -> Result<i32> {
    engine.start().await?;
    let output = engine.run_inline(code).await?;
    print_output(&output);
    Ok(0)
}

fn print_output(output: &str) {
    if output.ends_with('\n') {
        print!("{output}");
    } else {
        println!("{output}");
    }
}
