//! Error taxonomy shared by the extraction and signature stages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PamError {
    /// A requested anomaly name is not in the source's vocabulary.
    #[error("unknown anomaly for {source_name}: {names:?}")]
    UnknownAnomaly {
        source_name: &'static str,
        names: Vec<String>,
    },

    #[error("unknown column kind '{kind}' for column {column}")]
    UnknownColumnKind { column: String, kind: String },

    #[error("unknown special column {0}")]
    UnknownSpecialColumn(String),

    #[error("n_jobs == 0 has no meaning")]
    ZeroParallelism,

    /// The canonical table is missing columns a classifier depends on.
    #[error("{missing:?} missing from {table} columns")]
    MissingColumns { table: String, missing: Vec<String> },

    #[error("malformed {table} record at row {row}: {source}")]
    Decode {
        table: String,
        row: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("run `transform` before adding new targets")]
    NotBuilt,

    #[error("run `extract` before exporting anomalies")]
    NotExtracted,
}

pub type Result<T, E = PamError> = std::result::Result<T, E>;
