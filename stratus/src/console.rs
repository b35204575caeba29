//! The operator console: the interop client from the command grammar,
//! bundled into the binary so an in-process cluster can be driven at all.
//!
//! Reads command lines from stdin and prints everything that arrives on
//! `client_responses`. The cluster core never depends on this module.

use broker::MessageBus;
use cluster::client::{self, ClusterClient};
use observability_deps::tracing::warn;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] client::ClientError),

    #[error("failed to read stdin: {0}")]
    Stdin(#[from] std::io::Error),
}

/// Serve the console until EXIT or end of stdin.
pub async fn run(bus: Arc<dyn MessageBus>) -> Result<(), Error> {
    let mut client = ClusterClient::connect(Arc::clone(&bus)).await?;

    let printer = tokio::spawn(async move {
        loop {
            match client.next_response().await {
                Ok(response) => println!("{}", render(&response)),
                Err(e) => {
                    warn!(%e, "response stream ended");
                    break;
                }
            }
        }
    });

    println!(
        "commands: LOAD <file> | GET <date> | KILL <id> | \
         temp_range <d1> <d2> | temp_range_avg <d1> <d2> | EXIT"
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("EXIT") {
            break;
        }
        if let Err(e) = client::send_line(&bus, line).await {
            eprintln!("{e}");
        }
    }

    printer.abort();
    Ok(())
}

/// Human-readable rendering of one response envelope.
fn render(response: &Value) -> String {
    // node replies carry node_id/queue_name; showcase replies carry `from`;
    // everything else is a manager status reply
    if let (Some(node_id), Some(queue)) = (response.get("node_id"), response.get("queue_name")) {
        if response.get("total_chunks").is_some() {
            return format!(
                "[recovery] {}",
                response["message"].as_str().unwrap_or_default()
            );
        }
        return format!("[storage {node_id} via {queue}] {}", response["data"]);
    }

    if response.get("from").is_some() {
        return match response["status"].as_str() {
            Some("404") => "[showcase] no data in the requested range".to_string(),
            Some("204") => "[showcase] the showcase holds no data yet".to_string(),
            Some("500") => format!(
                "[showcase] request failed: {}",
                response["message"].as_str().unwrap_or_default()
            ),
            _ if response.get("avg_temperature").is_some() => {
                format!("[showcase] {}", response["avg_temperature"])
            }
            _ => {
                let data = response["data"].as_object();
                let mut out = String::from("[showcase]");
                if let Some(data) = data {
                    for (date, mean) in data {
                        out.push_str(&format!("\n{date}: {mean}"));
                    }
                }
                out
            }
        };
    }

    format!(
        "[manager] {}: {}",
        response["status"].as_str().unwrap_or("?"),
        response["message"].as_str().unwrap_or_default()
    )
}
