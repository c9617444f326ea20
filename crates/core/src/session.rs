use crate::error::{DocumentError, SessionError};
use crate::generation::ResponseGenerator;
use crate::index_store::{IndexHandle, IndexStore};
use crate::models::{DocumentRecord, Principal, RetrievalOptions};
use crate::traits::{DocumentRepository, EventSink};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CLOSE_AUTH_FAILED: u16 = 4001;
pub const CLOSE_SETUP_FAILED: u16 = 4000;

pub const MSG_CONNECTED: &str = "Connected successfully. You can now send queries.";
pub const MSG_AUTH_FAILED: &str = "Authentication failed. Please provide a valid token.";
pub const MSG_RETRIEVING: &str = "Retrieving relevant context...";
pub const MSG_GENERATING: &str = "Generating response...";
pub const MSG_NO_CONTEXT: &str =
    "No relevant context found in the document. Answering from general knowledge.";
pub const MSG_COMPLETE: &str = "Response complete.";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub document_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connection { message: String },
    Error { message: String },
    Status { message: String },
    Info { message: String },
    Stream { content: String },
    End { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        ServerEvent::Status {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Connection { .. } => "connection",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Status { .. } => "status",
            ServerEvent::Info { .. } => "info",
            ServerEvent::Stream { .. } => "stream",
            ServerEvent::End { .. } => "end",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Connected,
    Active,
    Closed,
}

#[derive(Debug)]
pub struct Session {
    id: Uuid,
    principal: Principal,
    state: SessionState,
}

impl Session {
    pub fn new(principal: Principal) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Connected | SessionState::Active)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    Accepted(ServerEvent),
    Rejected { event: ServerEvent, close_code: u16 },
}

#[derive(Debug, Error)]
enum QueryError {
    #[error("Invalid message format. Expected JSON with a 'query' field.")]
    Malformed,

    #[error("Query cannot be empty.")]
    EmptyQuery,

    #[error("Session is not open.")]
    NotOpen,

    #[error("Document not found.")]
    DocumentNotFound,

    #[error("No processed documents found. Please upload a PDF first.")]
    NoProcessedDocument,

    #[error("Document is still being processed. Please try again shortly.")]
    DocumentNotProcessed,

    #[error("An error occurred while processing your query: {0}")]
    Documents(#[from] DocumentError),

    #[error(transparent)]
    Transport(#[from] SessionError),
}

/// Drives one connection: authentication outcome, then one query at a time.
pub struct SessionHandler<D> {
    documents: Arc<D>,
    index: Arc<IndexStore>,
    generator: Arc<ResponseGenerator>,
    retrieval: RetrievalOptions,
}

impl<D> SessionHandler<D>
where
    D: DocumentRepository,
{
    pub fn new(
        documents: Arc<D>,
        index: Arc<IndexStore>,
        generator: Arc<ResponseGenerator>,
        retrieval: RetrievalOptions,
    ) -> Self {
        Self {
            documents,
            index,
            generator,
            retrieval,
        }
    }

    pub fn open(&self, session: &mut Session) -> OpenOutcome {
        if session.principal.is_anonymous() {
            session.state = SessionState::Closed;
            warn!(session = %session.id, "rejected anonymous session");
            return OpenOutcome::Rejected {
                event: ServerEvent::error(MSG_AUTH_FAILED),
                close_code: CLOSE_AUTH_FAILED,
            };
        }

        session.state = SessionState::Connected;
        info!(session = %session.id, user_id = ?session.principal.user_id(), "session connected");
        OpenOutcome::Accepted(ServerEvent::Connection {
            message: MSG_CONNECTED.to_string(),
        })
    }

    pub fn close(&self, session: &mut Session) {
        if session.state != SessionState::Closed {
            info!(session = %session.id, user_id = ?session.principal.user_id(), "session closed");
        }
        session.state = SessionState::Closed;
    }

    /// Handles one inbound frame. Query failures are reported to the client as `error`
    /// events; the only error returned is a closed transport.
    pub async fn handle_message(
        &self,
        session: &mut Session,
        raw: &str,
        sink: &dyn EventSink,
    ) -> Result<(), SessionError> {
        let outcome = self.answer(session, raw, sink).await;
        if session.is_open() {
            session.state = SessionState::Active;
        }

        match outcome {
            Ok(()) => Ok(()),
            Err(QueryError::Transport(closed)) => Err(closed),
            Err(failure) => {
                warn!(session = %session.id, error = %failure, "query rejected");
                sink.emit(ServerEvent::error(failure.to_string())).await
            }
        }
    }

    async fn answer(
        &self,
        session: &Session,
        raw: &str,
        sink: &dyn EventSink,
    ) -> Result<(), QueryError> {
        let Some(owner_id) = session.principal.user_id().filter(|_| session.is_open()) else {
            return Err(QueryError::NotOpen);
        };

        let message: ClientMessage =
            serde_json::from_str(raw).map_err(|_| QueryError::Malformed)?;
        let query = message.query.trim();
        if query.is_empty() {
            return Err(QueryError::EmptyQuery);
        }

        let document = self.resolve_document(owner_id, message.document_id).await?;
        let Some(index_path) = document.index_path.as_deref().filter(|_| document.processed)
        else {
            return Err(QueryError::DocumentNotProcessed);
        };
        let handle = IndexHandle::from_index_path(index_path);

        sink.emit(ServerEvent::status(MSG_RETRIEVING)).await?;
        let chunks = self.index.search(&handle, query, self.retrieval.top_k).await;
        if chunks.is_empty() {
            warn!(session = %session.id, document_id = document.id, "no context retrieved");
            sink.emit(ServerEvent::Info {
                message: MSG_NO_CONTEXT.to_string(),
            })
            .await?;
        }
        let context = chunks.join("\n\n");

        sink.emit(ServerEvent::status(MSG_GENERATING)).await?;
        let mut fragments = self.generator.stream(query, &context);
        while let Some(content) = fragments.next().await {
            sink.emit(ServerEvent::Stream { content }).await?;
        }

        sink.emit(ServerEvent::End {
            message: MSG_COMPLETE.to_string(),
        })
        .await?;

        info!(
            session = %session.id,
            document_id = document.id,
            context_chunks = chunks.len(),
            "query answered"
        );
        Ok(())
    }

    async fn resolve_document(
        &self,
        owner_id: i64,
        document_id: Option<i64>,
    ) -> Result<DocumentRecord, QueryError> {
        match document_id {
            Some(document_id) => self
                .documents
                .get(owner_id, document_id)
                .await?
                .ok_or(QueryError::DocumentNotFound),
            None => self
                .documents
                .latest_processed(owner_id)
                .await?
                .ok_or(QueryError::NoProcessedDocument),
        }
    }
}
