use crate::chunking::chunk_text;
use crate::error::IngestError;
use crate::extractor::extract_text;
use crate::index_store::{IndexHandle, IndexStore};
use crate::models::{ChunkingConfig, DocumentRecord, NewDocument, UploadLimits};
use crate::traits::DocumentRepository;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn validate_upload(
    file_name: &str,
    size: u64,
    limits: UploadLimits,
) -> Result<(), IngestError> {
    let is_pdf = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

    if !is_pdf {
        return Err(IngestError::UnsupportedFile(format!(
            "{file_name}: only PDF files are allowed"
        )));
    }

    if size > limits.max_file_bytes {
        return Err(IngestError::FileTooLarge {
            size,
            limit: limits.max_file_bytes,
        });
    }

    Ok(())
}

/// Turns uploaded documents into processed records with a persisted similarity index.
pub struct DocumentIngestor<D> {
    documents: Arc<D>,
    index: Arc<IndexStore>,
    chunking: ChunkingConfig,
    limits: UploadLimits,
}

impl<D> DocumentIngestor<D>
where
    D: DocumentRepository,
{
    pub fn new(
        documents: Arc<D>,
        index: Arc<IndexStore>,
        chunking: ChunkingConfig,
        limits: UploadLimits,
    ) -> Self {
        Self {
            documents,
            index,
            chunking,
            limits,
        }
    }

    pub async fn ingest_pdf(
        &self,
        owner_id: i64,
        path: &Path,
        title: Option<String>,
    ) -> Result<DocumentRecord, IngestError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?
            .to_string();

        let metadata = tokio::fs::metadata(path).await?;
        validate_upload(&file_name, metadata.len(), self.limits)?;

        let bytes = tokio::fs::read(path).await?;
        let record = self
            .documents
            .insert(NewDocument {
                owner_id,
                title: title.unwrap_or_else(|| file_name.clone()),
                source_path: path.to_string_lossy().to_string(),
                checksum: digest_bytes(&bytes),
            })
            .await?;

        let text = match extract_text(path).await {
            Ok(text) => text,
            Err(extract_error) => {
                self.rollback(&record).await;
                return Err(extract_error);
            }
        };

        self.process(record, &text).await
    }

    pub async fn ingest_text(
        &self,
        owner_id: i64,
        title: &str,
        text: &str,
    ) -> Result<DocumentRecord, IngestError> {
        let record = self
            .documents
            .insert(NewDocument {
                owner_id,
                title: title.to_string(),
                source_path: String::new(),
                checksum: digest_bytes(text.as_bytes()),
            })
            .await?;

        self.process(record, text).await
    }

    async fn process(
        &self,
        record: DocumentRecord,
        text: &str,
    ) -> Result<DocumentRecord, IngestError> {
        let built = match chunk_text(text, self.chunking) {
            Ok(chunks) => self
                .index
                .build(&chunks, record.id)
                .await
                .map(|handle| (handle, chunks.len()))
                .map_err(IngestError::from),
            Err(chunk_error) => Err(chunk_error),
        };

        let (handle, chunk_count) = match built {
            Ok((Some(handle), chunk_count)) => (handle, chunk_count),
            Ok((None, _)) => {
                self.rollback(&record).await;
                return Err(IngestError::EmptyDocument(record.title));
            }
            Err(build_error) => {
                self.rollback(&record).await;
                return Err(build_error);
            }
        };

        let updated = match self
            .documents
            .mark_processed(record.id, handle.to_string(), chunk_count)
            .await
        {
            Ok(updated) => updated,
            Err(mark_error) => {
                if let Err(cleanup_error) = self.index.delete(&handle).await {
                    warn!(
                        document_id = record.id,
                        path = %handle,
                        error = %cleanup_error,
                        "orphaned index not removed"
                    );
                }
                self.rollback(&record).await;
                return Err(mark_error.into());
            }
        };

        info!(
            document_id = updated.id,
            owner_id = updated.owner_id,
            chunks = chunk_count,
            "document processed"
        );
        Ok(updated)
    }

    async fn rollback(&self, record: &DocumentRecord) {
        if let Err(remove_error) = self.documents.remove(record.id).await {
            warn!(document_id = record.id, error = %remove_error, "document rollback failed");
        }
    }

    pub async fn delete_document(
        &self,
        owner_id: i64,
        document_id: i64,
    ) -> Result<bool, IngestError> {
        delete_document(self.documents.as_ref(), owner_id, document_id).await
    }
}

/// Deletes the document's index first, then the record itself. Needs no embedding backend.
pub async fn delete_document<D>(
    documents: &D,
    owner_id: i64,
    document_id: i64,
) -> Result<bool, IngestError>
where
    D: DocumentRepository + ?Sized,
{
    let Some(record) = documents.get(owner_id, document_id).await? else {
        return Ok(false);
    };

    if let Some(index_path) = &record.index_path {
        IndexHandle::from_index_path(index_path).remove().await?;
    }
    documents.remove(record.id).await?;

    info!(document_id, owner_id, "document deleted");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::JsonDocumentStore;
    use crate::embeddings::{EmbeddingClient, HashingEmbedder};
    use crate::error::DocumentError;
    use async_trait::async_trait;
    use tempfile::tempdir;

    /// Accepts every change except marking a document processed.
    struct UnmarkableStore {
        inner: JsonDocumentStore,
    }

    #[async_trait]
    impl DocumentRepository for UnmarkableStore {
        async fn get(
            &self,
            owner_id: i64,
            document_id: i64,
        ) -> Result<Option<DocumentRecord>, DocumentError> {
            self.inner.get(owner_id, document_id).await
        }

        async fn latest_processed(
            &self,
            owner_id: i64,
        ) -> Result<Option<DocumentRecord>, DocumentError> {
            self.inner.latest_processed(owner_id).await
        }

        async fn list(&self, owner_id: i64) -> Result<Vec<DocumentRecord>, DocumentError> {
            self.inner.list(owner_id).await
        }

        async fn insert(&self, document: NewDocument) -> Result<DocumentRecord, DocumentError> {
            self.inner.insert(document).await
        }

        async fn mark_processed(
            &self,
            document_id: i64,
            _index_path: String,
            _chunk_count: usize,
        ) -> Result<DocumentRecord, DocumentError> {
            Err(DocumentError::NotFound(document_id))
        }

        async fn remove(&self, document_id: i64) -> Result<Option<DocumentRecord>, DocumentError> {
            self.inner.remove(document_id).await
        }
    }

    fn ingestor(root: &Path) -> (DocumentIngestor<JsonDocumentStore>, Arc<JsonDocumentStore>) {
        let documents = Arc::new(JsonDocumentStore::in_memory());
        let client = EmbeddingClient::new(Arc::new(HashingEmbedder { dimensions: 32 }), 16);
        let index = Arc::new(IndexStore::new(root, Arc::new(client)));
        let ingestor = DocumentIngestor::new(
            documents.clone(),
            index,
            ChunkingConfig {
                chunk_size: 60,
                chunk_overlap: 10,
            },
            UploadLimits::default(),
        );
        (ingestor, documents)
    }

    #[test]
    fn uploads_must_be_small_pdfs() {
        let limits = UploadLimits::default();
        assert!(validate_upload("manual.PDF", 1_024, limits).is_ok());
        assert!(matches!(
            validate_upload("notes.txt", 1_024, limits),
            Err(IngestError::UnsupportedFile(_))
        ));
        assert!(matches!(
            validate_upload("big.pdf", 11 * 1024 * 1024, limits),
            Err(IngestError::FileTooLarge { .. })
        ));
    }

    #[test]
    fn checksum_is_reproducible() {
        assert_eq!(digest_bytes(b"abc"), digest_bytes(b"abc"));
        assert_ne!(digest_bytes(b"abc"), digest_bytes(b"abd"));
    }

    #[tokio::test]
    async fn text_ingestion_marks_the_document_processed() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempdir()?;
        let (ingestor, documents) = ingestor(dir.path());
        let text = "Refunds are issued within 30 days. Shipping takes five days.\n\
                    Warranty covers defects for a year. Support answers email daily.";

        let record = ingestor.ingest_text(4, "policy", text).await?;

        assert!(record.processed);
        assert!(record.chunk_count >= 2);
        let index_path = record.index_path.clone().expect("index path recorded");
        assert!(Path::new(&index_path).exists());
        assert_eq!(documents.latest_processed(4).await?.map(|d| d.id), Some(record.id));
        Ok(())
    }

    #[tokio::test]
    async fn empty_text_rolls_the_record_back() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (ingestor, documents) = ingestor(dir.path());

        let result = ingestor.ingest_text(4, "blank", "   \n  ").await;

        assert!(matches!(result, Err(IngestError::EmptyDocument(_))));
        assert!(documents.list(4).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_pdf_rolls_the_record_back() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (ingestor, documents) = ingestor(&dir.path().join("indexes"));
        let pdf = dir.path().join("broken.pdf");
        std::fs::write(&pdf, b"%PDF-1.4\n%broken")?;

        assert!(ingestor.ingest_pdf(4, &pdf, None).await.is_err());
        assert!(documents.list(4).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_index_then_record() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (ingestor, documents) = ingestor(dir.path());
        let record = ingestor
            .ingest_text(4, "policy", "Refunds are issued within 30 days.")
            .await?;
        let index_path = record.index_path.clone().expect("index path recorded");

        assert!(!ingestor.delete_document(5, record.id).await?);
        assert!(ingestor.delete_document(4, record.id).await?);

        assert!(!Path::new(&index_path).exists());
        assert!(documents.get(4, record.id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn delete_works_from_the_catalog_alone() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let (ingestor, documents) = ingestor(dir.path());
        let record = ingestor
            .ingest_text(4, "policy", "Refunds are issued within 30 days.")
            .await?;
        let index_path = record.index_path.clone().expect("index path recorded");

        assert!(delete_document(documents.as_ref(), 4, record.id).await?);
        assert!(!delete_document(documents.as_ref(), 4, record.id).await?);
        assert!(!Path::new(&index_path).exists());
        Ok(())
    }

    #[tokio::test]
    async fn failed_mark_removes_the_fresh_index() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let documents = Arc::new(UnmarkableStore {
            inner: JsonDocumentStore::in_memory(),
        });
        let client = EmbeddingClient::new(Arc::new(HashingEmbedder { dimensions: 32 }), 16);
        let index = Arc::new(IndexStore::new(dir.path(), Arc::new(client)));
        let ingestor = DocumentIngestor::new(
            documents.clone(),
            index.clone(),
            ChunkingConfig::default(),
            UploadLimits::default(),
        );

        let result = ingestor
            .ingest_text(4, "policy", "Refunds are issued within 30 days.")
            .await;

        assert!(matches!(result, Err(IngestError::Documents(_))));
        assert!(!index.handle_for(1).index_path().exists());
        assert!(documents.list(4).await?.is_empty());
        Ok(())
    }
}
