use crate::error::{DocumentError, ProviderError, SessionError};
use crate::models::{DocumentRecord, EmbeddingPurpose, GenerationRequest, NewDocument, Principal};
use crate::session::ServerEvent;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub type FragmentStream = BoxStream<'static, Result<String, ProviderError>>;

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Embeds one batch; the result must be position-aligned with `texts`.
    async fn embed_batch(
        &self,
        texts: &[String],
        purpose: EmbeddingPurpose,
    ) -> Result<Vec<Vec<f32>>, ProviderError>;
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream_generate(
        &self,
        request: GenerationRequest,
    ) -> Result<FragmentStream, ProviderError>;
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn get(
        &self,
        owner_id: i64,
        document_id: i64,
    ) -> Result<Option<DocumentRecord>, DocumentError>;

    async fn latest_processed(
        &self,
        owner_id: i64,
    ) -> Result<Option<DocumentRecord>, DocumentError>;

    async fn list(&self, owner_id: i64) -> Result<Vec<DocumentRecord>, DocumentError>;

    async fn insert(&self, document: NewDocument) -> Result<DocumentRecord, DocumentError>;

    async fn mark_processed(
        &self,
        document_id: i64,
        index_path: String,
        chunk_count: usize,
    ) -> Result<DocumentRecord, DocumentError>;

    async fn remove(&self, document_id: i64) -> Result<Option<DocumentRecord>, DocumentError>;
}

#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    async fn resolve(&self, token: Option<&str>) -> Principal;
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ServerEvent) -> Result<(), SessionError>;
}

#[async_trait]
impl EventSink for tokio::sync::mpsc::Sender<ServerEvent> {
    async fn emit(&self, event: ServerEvent) -> Result<(), SessionError> {
        self.send(event)
            .await
            .map_err(|_| SessionError::TransportClosed)
    }
}
