//! Bulk CSV ingestion: normalize each row's date, route it on the ring, and
//! publish it to its owning storage.

use crate::liveness::ClusterView;
use broker::{BusError, MessageBus};
use data_types::{storage_queue, Date, DateError, Record};
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use protocol::{CodecError, NodeCommand};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Known date column names, probed in priority order.
pub const DATE_COLUMNS: [&str; 4] = ["date", "datetime_utc", "Date.Full", "DATE"];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read '{path}': {source}")]
    Csv { path: String, source: csv::Error },

    #[error("'{path}' has no known date column")]
    NoDateColumn { path: String },

    #[error("row {row}: {source}")]
    BadDate { row: usize, source: DateError },

    #[error(transparent)]
    Routing(#[from] sharder::Error),

    #[error("broker failure: {0}")]
    Broker(#[from] BusError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Ingest the CSV at `path`, returning how many rows were routed.
pub async fn load_csv(
    bus: &Arc<dyn MessageBus>,
    view: &Mutex<ClusterView>,
    path: &str,
) -> Result<usize, IngestError> {
    let mut reader = csv::Reader::from_path(path).map_err(|source| IngestError::Csv {
        path: path.to_string(),
        source,
    })?;
    let headers = reader
        .headers()
        .map_err(|source| IngestError::Csv {
            path: path.to_string(),
            source,
        })?
        .clone();

    let date_column = DATE_COLUMNS
        .iter()
        .find_map(|wanted| headers.iter().position(|header| header == *wanted))
        .ok_or_else(|| IngestError::NoDateColumn {
            path: path.to_string(),
        })?;

    let mut routed = 0;
    for (row_index, row) in reader.records().enumerate() {
        let row = row.map_err(|source| IngestError::Csv {
            path: path.to_string(),
            source,
        })?;

        let date = Date::normalize(row.get(date_column).unwrap_or_default()).map_err(
            |source| IngestError::BadDate {
                row: row_index + 1,
                source,
            },
        )?;

        let mut record: Record = headers
            .iter()
            .zip(row.iter())
            .map(|(header, field)| (header.to_string(), Value::String(field.to_string())))
            .collect();
        record.set_date_parsed(date);

        let target = view.lock().route(&date.to_string())?;
        let envelope = protocol::encode(&NodeCommand::Load { data: record })?;
        bus.publish(&storage_queue(target), envelope).await?;
        debug!(%date, %target, "routed ingest row");
        routed += 1;
    }
    Ok(routed)
}
