//! A thin client speaking the documented command grammar.
//!
//! The cluster core never depends on this module; it exists for the
//! operator console and the end-to-end tests, both of which act as external
//! clients: publish command lines, consume `client_responses`.

use broker::{BusError, MessageBus, QueueConsumer};
use data_types::{CLIENT_RESPONSES, MANAGER_COMMANDS, SHOWCASE_REQUESTS};
use protocol::{ClientRequest, CodecError, ShowcaseRequest};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("broker failure: {0}")]
    Broker(#[from] BusError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("usage: {usage}")]
    Usage { usage: &'static str },
}

/// A connected client: publishes commands, consumes responses.
#[derive(Debug)]
pub struct ClusterClient {
    bus: Arc<dyn MessageBus>,
    responses: Box<dyn QueueConsumer>,
}

impl ClusterClient {
    /// Attach to the client-facing queues of a running cluster.
    pub async fn connect(bus: Arc<dyn MessageBus>) -> Result<Self, ClientError> {
        bus.declare(MANAGER_COMMANDS, false).await?;
        bus.declare(SHOWCASE_REQUESTS, false).await?;
        bus.declare(CLIENT_RESPONSES, false).await?;
        let responses = bus.consumer(CLIENT_RESPONSES).await?;
        Ok(Self { bus, responses })
    }

    /// Publish one command line to whichever service owns it.
    pub async fn send(&self, line: &str) -> Result<(), ClientError> {
        send_line(&self.bus, line).await
    }

    /// Await the next response envelope, as raw JSON.
    pub async fn next_response(&mut self) -> Result<Value, ClientError> {
        let payload = self.responses.recv().await?;
        Ok(protocol::decode(&payload)?)
    }
}

/// Publish one command line to whichever service owns it.
///
/// `temp_range`/`temp_range_avg` go to the showcase, everything else is a
/// manager command line.
pub async fn send_line(bus: &Arc<dyn MessageBus>, line: &str) -> Result<(), ClientError> {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some(verb @ ("temp_range" | "temp_range_avg")) => {
            let (date1, date2) = match (parts.next(), parts.next()) {
                (Some(date1), Some(date2)) => (date1.to_string(), date2.to_string()),
                _ => {
                    return Err(ClientError::Usage {
                        usage: "temp_range/temp_range_avg <date1> <date2>",
                    })
                }
            };
            let reply_to = CLIENT_RESPONSES.to_string();
            let request = if verb == "temp_range" {
                ShowcaseRequest::TempRange {
                    date1,
                    date2,
                    reply_to,
                }
            } else {
                ShowcaseRequest::TempRangeAvg {
                    date1,
                    date2,
                    reply_to,
                }
            };
            bus.publish(SHOWCASE_REQUESTS, protocol::encode(&request)?)
                .await?;
        }
        Some(_) => {
            let request = ClientRequest {
                command: line.to_string(),
                reply_to: CLIENT_RESPONSES.to_string(),
            };
            bus.publish(MANAGER_COMMANDS, protocol::encode(&request)?)
                .await?;
        }
        None => {
            return Err(ClientError::Usage {
                usage: "LOAD <file> | GET <date> | KILL <id> | temp_range <d1> <d2> | temp_range_avg <d1> <d2>",
            })
        }
    }
    Ok(())
}
