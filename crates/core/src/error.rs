use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("unsupported file: {0}")]
    UnsupportedFile(String),

    #[error("file is {size} bytes, limit is {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("no text could be extracted from {0}")]
    EmptyDocument(String),

    #[error("index build failed: {0}")]
    Index(#[from] SearchError),

    #[error("document store error: {0}")]
    Documents(#[from] DocumentError),

    #[error("extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("embedding service returned no usable vectors: {0}")]
    EmbeddingUnavailable(String),

    #[error("vector dimension {found} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("corrupt index at {path}: {details}")]
    Corrupt { path: String, details: String },
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{backend} returned {status}: {message}")]
    Api {
        backend: String,
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("invalid response from {backend}: {details}")]
    InvalidResponse { backend: String, details: String },

    #[error("missing configuration: {0}")]
    Config(String),
}

// Transport errors never carry the request URL.
impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        ProviderError::Http(error.without_url())
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("document {0} not found")]
    NotFound(i64),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport closed")]
    TransportClosed,
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
