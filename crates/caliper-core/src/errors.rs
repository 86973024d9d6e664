//! Error types for the Caliper core library.

/// Top-level error enum for the Caliper core library.
///
/// Variants map to the failure taxonomy surfaced to callers: `Parse` means
/// "fix your input", `Database`/`Index`/`Io`/`Sqlite` are store-side, `Query`
/// covers bad caller arguments, `Provider` covers the LLM boundary, and
/// `Grounding` means an answer was rejected because a citation did not
/// resolve to a retrieved document.
#[derive(Debug, thiserror::Error)]
pub enum CaliperError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Grounding error: {0}")]
    Grounding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<quick_xml::Error> for CaliperError {
    fn from(err: quick_xml::Error) -> Self {
        CaliperError::Parse(err.to_string())
    }
}

pub type CaliperResult<T> = Result<T, CaliperError>;
