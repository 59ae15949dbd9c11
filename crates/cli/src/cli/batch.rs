use std::path::Path;

use anyhow::{Context, Result};
use engine::{Engine, PoolError, Request};
use futures_util::future::join_all;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct BatchResult {
    line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Parse a JSON-lines request file. Blank lines are skipped; every other
/// line yields a request or the reason it was rejected.
fn parse_batch(contents: &str) -> Vec<(usize, Result<Request, PoolError>)> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            let request = serde_json::from_str(line)
                .map_err(|err| PoolError::Protocol(format!("invalid JSON: {err}")))
                .and_then(Request::from_json);
            (index + 1, request)
        })
        .collect()
}

/// Every request is queued before any result is awaited, so the pool admits
/// them in file order.
pub async fn cmd(engine: &Engine, file: &Path) -> Result<i32> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let parsed = parse_batch(&contents);
    engine.start().await?;

    let pending: Vec<_> = parsed
        .into_iter()
        .map(|(line, request)| {
            let execution = request.map(|request| engine.dispatch(request));
            async move {
                let outcome = match execution {
                    Ok(execution) => execution.await,
                    Err(err) => Err(err),
                };
                (line, outcome)
            }
        })
        .collect();

    let mut failures = 0;
    for (line, outcome) in join_all(pending).await {
        let result = match outcome {
            Ok(output) => BatchResult {
                line,
                output: Some(output),
                error: None,
            },
            Err(err) => {
                failures += 1;
                BatchResult {
                    line,
                    output: None,
                    error: Some(err.to_string()),
                }
            }
        };
        println!("{}", serde_json::to_string(&result)?);
    }
    tracing::debug!("batch finished with {} failures", failures);
    Ok(if failures == 0 { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_batch_reports_bad_lines_by_number() {
        let contents = concat!(
            "{\"type\":\"run\",\"path\":\"index.php\"}\n",
            "\n",
            "{\"type\":\"runInline\",\"code\":\"<?php echo 1;\"}\n",
            "{\"type\":\"evalJs\"}\n",
            "not json\n",
        );
        let parsed = parse_batch(contents);
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed[0], (1, Ok(Request::run("index.php"))));
        assert_eq!(parsed[1], (3, Ok(Request::inline("<?php echo 1;"))));
        assert_eq!(
            parsed[2],
            (
                4,
                Err(PoolError::Protocol(
                    "unsupported message type: evalJs".to_string()
                ))
            )
        );
        assert!(matches!(&parsed[3], (5, Err(PoolError::Protocol(message))) if message.starts_with("invalid JSON")));
    }

    #[test]
    fn test_result_lines_omit_empty_fields() {
        let result = BatchResult {
            line: 2,
            output: Some("ok".to_string()),
            error: None,
        };
        assert_eq!(
            serde_json::to_string(&result).unwrap(),
            r#"{"line":2,"output":"ok"}"#
        );
    }
}
