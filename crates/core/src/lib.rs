pub mod auth;
pub mod chunking;
pub mod documents;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod flat_index;
pub mod generation;
pub mod index_store;
pub mod ingest;
pub mod models;
pub mod providers;
pub mod session;
pub mod traits;

pub use auth::JwtPrincipalResolver;
pub use chunking::chunk_text;
pub use documents::JsonDocumentStore;
pub use embeddings::{EmbeddingClient, HashingEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{DocumentError, IngestError, ProviderError, SearchError, SessionError};
pub use extractor::{extract_page_texts, extract_text};
pub use flat_index::{FlatL2Index, Neighbor};
pub use generation::{compose_prompt, ResponseGenerator};
pub use index_store::{IndexHandle, IndexStore};
pub use ingest::{delete_document, digest_bytes, validate_upload, DocumentIngestor};
pub use models::{
    ChunkingConfig, DocumentRecord, EmbeddingOptions, EmbeddingPurpose, GenerationOptions,
    GenerationRequest, NewDocument, Principal, RetrievalOptions, UploadLimits,
};
pub use providers::{GeminiChatModel, GeminiEmbeddingBackend};
pub use session::{
    ClientMessage, OpenOutcome, ServerEvent, Session, SessionHandler, SessionState,
    CLOSE_AUTH_FAILED, CLOSE_SETUP_FAILED,
};
pub use traits::{
    ChatModel, DocumentRepository, EmbeddingBackend, EventSink, FragmentStream,
    PrincipalResolver,
};
