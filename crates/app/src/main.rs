mod server;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use pdf_chat_core::models::DEFAULT_GEMINI_BASE_URL;
use pdf_chat_core::{
    delete_document, ChunkingConfig, DocumentIngestor, DocumentRepository, EmbeddingBackend,
    EmbeddingClient, EmbeddingOptions, GeminiChatModel, GeminiEmbeddingBackend, GenerationOptions,
    HashingEmbedder, IndexStore, JsonDocumentStore, JwtPrincipalResolver, OpenOutcome, Principal,
    ResponseGenerator, RetrievalOptions, ServerEvent, Session, SessionHandler, UploadLimits,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-chat-server", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the document catalog and similarity indexes.
    #[arg(long, env = "PDF_CHAT_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    gemini_api_key: Option<String>,

    /// Gemini API base URL
    #[arg(long, env = "GEMINI_BASE_URL", default_value = DEFAULT_GEMINI_BASE_URL)]
    gemini_base_url: String,

    /// Where chunk and query embeddings come from.
    #[arg(long, value_enum, default_value_t = EmbeddingProvider::Gemini)]
    embedding_provider: EmbeddingProvider,

    /// Embedding model identifier.
    #[arg(long, default_value = "text-embedding-004")]
    embedding_model: String,

    /// Texts per embedding request.
    #[arg(long, default_value_t = 100)]
    embedding_batch_size: usize,

    /// Per-request timeout for the model service, in seconds.
    #[arg(long)]
    request_timeout_secs: Option<u64>,

    /// Chat model identifier.
    #[arg(long, default_value = "gemini-2.5-flash")]
    chat_model: String,

    #[arg(long, default_value_t = 1_000)]
    max_output_tokens: u32,

    #[arg(long, default_value_t = 0.7)]
    temperature: f32,

    /// Target chunk length in characters.
    #[arg(long, default_value_t = 1_000)]
    chunk_size: usize,

    /// Characters shared by consecutive chunks.
    #[arg(long, default_value_t = 200)]
    chunk_overlap: usize,

    /// Context chunks retrieved per query.
    #[arg(long, default_value_t = 3)]
    top_k: usize,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EmbeddingProvider {
    Gemini,
    /// Offline hashing embedder, no network calls.
    Local,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the chat WebSocket at /ws/chat/.
    Serve {
        #[arg(long, env = "PDF_CHAT_BIND", default_value = "127.0.0.1:8000")]
        bind: String,
        /// HS256 secret used to verify access tokens.
        #[arg(long, env = "PDF_CHAT_JWT_SECRET", hide_env_values = true)]
        jwt_secret: String,
    },
    /// Upload a PDF for a user and build its similarity index.
    Ingest {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        owner: i64,
        #[arg(long)]
        title: Option<String>,
    },
    /// List a user's documents, newest first.
    List {
        #[arg(long)]
        owner: i64,
    },
    /// Delete a document and its index.
    Delete {
        #[arg(long)]
        owner: i64,
        #[arg(long)]
        document_id: i64,
    },
    /// Ask one question and print the session events.
    Ask {
        #[arg(long)]
        owner: i64,
        #[arg(long)]
        query: String,
        #[arg(long)]
        document_id: Option<i64>,
    },
}

impl Cli {
    fn embedding_options(&self) -> EmbeddingOptions {
        let defaults = EmbeddingOptions::default();
        EmbeddingOptions {
            base_url: self.gemini_base_url.clone(),
            model: self.embedding_model.clone(),
            batch_size: self.embedding_batch_size,
            timeout: self
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }

    fn generation_options(&self) -> GenerationOptions {
        let defaults = GenerationOptions::default();
        GenerationOptions {
            base_url: self.gemini_base_url.clone(),
            model: self.chat_model.clone(),
            max_output_tokens: self.max_output_tokens,
            temperature: self.temperature,
            timeout: self
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            ..defaults
        }
    }

    fn api_key(&self) -> anyhow::Result<&str> {
        match self.gemini_api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(key),
            _ => bail!("GEMINI_API_KEY is required for this command"),
        }
    }

    /// Catalog-only commands (`list`, `delete`) never build an embedding backend.
    fn index_store(&self) -> anyhow::Result<Arc<IndexStore>> {
        let options = self.embedding_options();
        let backend: Arc<dyn EmbeddingBackend> = match self.embedding_provider {
            EmbeddingProvider::Gemini => {
                Arc::new(GeminiEmbeddingBackend::new(self.api_key()?, options.clone())?)
            }
            EmbeddingProvider::Local => Arc::new(HashingEmbedder::default()),
        };
        let embeddings = Arc::new(EmbeddingClient::new(backend, options.batch_size));
        let root = self.data_dir.join("vector_stores");
        Ok(Arc::new(IndexStore::new(root, embeddings)))
    }

    async fn documents(&self) -> anyhow::Result<Arc<JsonDocumentStore>> {
        let documents = JsonDocumentStore::open(self.data_dir.join("documents.json"))
            .await
            .with_context(|| format!("failed to open catalog in {}", self.data_dir.display()))?;
        Ok(Arc::new(documents))
    }

    fn session_handler(
        &self,
        documents: Arc<JsonDocumentStore>,
    ) -> anyhow::Result<SessionHandler<JsonDocumentStore>> {
        let model = GeminiChatModel::new(self.api_key()?, self.generation_options())?;
        let generator = ResponseGenerator::new(Arc::new(model), self.generation_options());
        Ok(SessionHandler::new(
            documents,
            self.index_store()?,
            Arc::new(generator),
            RetrievalOptions { top_k: self.top_k },
        ))
    }

    fn ingestor(
        &self,
        documents: Arc<JsonDocumentStore>,
    ) -> anyhow::Result<DocumentIngestor<JsonDocumentStore>> {
        Ok(DocumentIngestor::new(
            documents,
            self.index_store()?,
            ChunkingConfig {
                chunk_size: self.chunk_size,
                chunk_overlap: self.chunk_overlap,
            },
            UploadLimits::default(),
        ))
    }
}

fn print_event(event: &ServerEvent) {
    match event {
        ServerEvent::Stream { content } => {
            print!("{content}");
            let _ = std::io::stdout().flush();
        }
        ServerEvent::End { message } => println!("\n[end] {message}"),
        ServerEvent::Connection { message }
        | ServerEvent::Error { message }
        | ServerEvent::Status { message }
        | ServerEvent::Info { message } => println!("[{}] {message}", event.kind()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let documents = cli.documents().await?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        data_dir = %cli.data_dir.display(),
        "pdf-chat-server boot"
    );

    match &cli.command {
        Command::Serve { bind, jwt_secret } => {
            let state = server::AppState {
                sessions: Arc::new(cli.session_handler(documents)?),
                principals: Arc::new(JwtPrincipalResolver::new(jwt_secret.as_bytes())),
            };
            server::serve(bind, state).await?;
        }
        Command::Ingest { file, owner, title } => {
            let record = cli
                .ingestor(documents)?
                .ingest_pdf(*owner, file, title.clone())
                .await?;
            println!(
                "document {} processed: {} chunks, index at {}",
                record.id,
                record.chunk_count,
                record.index_path.as_deref().unwrap_or("-")
            );
        }
        Command::List { owner } => {
            let listed = documents.list(*owner).await?;
            if listed.is_empty() {
                println!("no documents for user {owner}");
            }
            for document in listed {
                println!(
                    "{}\t{}\tprocessed={}\tchunks={}\tuploaded_at={}",
                    document.id,
                    document.title,
                    document.processed,
                    document.chunk_count,
                    document.uploaded_at.to_rfc3339()
                );
            }
        }
        Command::Delete { owner, document_id } => {
            if delete_document(documents.as_ref(), *owner, *document_id).await? {
                println!("document {document_id} deleted");
            } else {
                bail!("document {document_id} not found for user {owner}");
            }
        }
        Command::Ask {
            owner,
            query,
            document_id,
        } => {
            let sessions = cli.session_handler(documents)?;
            let mut session = Session::new(Principal::User {
                id: *owner,
                username: None,
            });
            if let OpenOutcome::Rejected { event, .. } = sessions.open(&mut session) {
                print_event(&event);
                return Ok(());
            }

            let (events_tx, mut events_rx) = mpsc::channel::<ServerEvent>(64);
            let printer = tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    print_event(&event);
                }
            });

            let raw = serde_json::json!({ "query": query, "document_id": document_id });
            sessions
                .handle_message(&mut session, &raw.to_string(), &events_tx)
                .await?;
            sessions.close(&mut session);
            drop(events_tx);
            printer.await?;
        }
    }

    Ok(())
}
