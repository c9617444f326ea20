use crate::embeddings::EmbeddingClient;
use crate::error::SearchError;
use crate::flat_index::FlatL2Index;
use crate::models::EmbeddingPurpose;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const INDEX_FILE_NAME: &str = "index.json";
pub const CHUNKS_FILE_NAME: &str = "chunks.json";

/// Location of a persisted index: the path of its `index.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHandle {
    index_path: PathBuf,
}

impl IndexHandle {
    pub fn from_index_path(index_path: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn chunks_path(&self) -> PathBuf {
        self.index_path.with_file_name(CHUNKS_FILE_NAME)
    }

    pub fn directory(&self) -> Option<&Path> {
        self.index_path.parent()
    }

    /// Removes the index directory. An index that is already gone is not an error.
    pub async fn remove(&self) -> Result<(), SearchError> {
        let Some(directory) = self.directory() else {
            return Ok(());
        };

        match tokio::fs::remove_dir_all(directory).await {
            Ok(()) => {
                info!(path = %directory.display(), "similarity index deleted");
                Ok(())
            }
            Err(io_error) if io_error.kind() == ErrorKind::NotFound => {
                warn!(path = %directory.display(), "similarity index already gone");
                Ok(())
            }
            Err(io_error) => Err(io_error.into()),
        }
    }
}

impl std::fmt::Display for IndexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.index_path.display())
    }
}

pub struct IndexStore {
    root: PathBuf,
    embeddings: Arc<EmbeddingClient>,
}

impl IndexStore {
    pub fn new(root: impl Into<PathBuf>, embeddings: Arc<EmbeddingClient>) -> Self {
        Self {
            root: root.into(),
            embeddings,
        }
    }

    pub fn handle_for(&self, index_id: i64) -> IndexHandle {
        IndexHandle::from_index_path(self.root.join(index_id.to_string()).join(INDEX_FILE_NAME))
    }

    /// Embeds and persists `chunks`. Returns `Ok(None)` for an empty chunk list.
    pub async fn build(
        &self,
        chunks: &[String],
        index_id: i64,
    ) -> Result<Option<IndexHandle>, SearchError> {
        if chunks.is_empty() {
            return Ok(None);
        }

        let vectors = self
            .embeddings
            .embed(chunks, EmbeddingPurpose::Document)
            .await;

        if vectors.is_empty() {
            return Err(SearchError::EmbeddingUnavailable(format!(
                "{} chunks for index {} could not be embedded",
                chunks.len(),
                index_id
            )));
        }

        if vectors.len() != chunks.len() {
            return Err(SearchError::Corrupt {
                path: self.handle_for(index_id).to_string(),
                details: format!(
                    "{} vectors for {} chunks",
                    vectors.len(),
                    chunks.len()
                ),
            });
        }

        let index = FlatL2Index::from_vectors(vectors)?;
        let handle = self.handle_for(index_id);

        if let Err(write_error) = self.write(&handle, &index, chunks).await {
            if let Some(directory) = handle.directory() {
                if let Err(cleanup_error) = tokio::fs::remove_dir_all(directory).await {
                    warn!(
                        path = %directory.display(),
                        error = %cleanup_error,
                        "partial index not removed"
                    );
                }
            }
            return Err(write_error);
        }

        info!(
            index_id,
            chunks = chunks.len(),
            dimension = index.dimension(),
            path = %handle,
            "similarity index built"
        );

        Ok(Some(handle))
    }

    async fn write(
        &self,
        handle: &IndexHandle,
        index: &FlatL2Index,
        chunks: &[String],
    ) -> Result<(), SearchError> {
        if let Some(directory) = handle.directory() {
            tokio::fs::create_dir_all(directory).await?;
        }
        tokio::fs::write(handle.index_path(), serde_json::to_vec(index)?).await?;
        tokio::fs::write(handle.chunks_path(), serde_json::to_vec(chunks)?).await?;
        Ok(())
    }

    async fn load(&self, handle: &IndexHandle) -> Result<(FlatL2Index, Vec<String>), SearchError> {
        let index_bytes = tokio::fs::read(handle.index_path()).await?;
        let chunk_bytes = tokio::fs::read(handle.chunks_path()).await?;

        let index: FlatL2Index = serde_json::from_slice(&index_bytes)?;
        let chunks: Vec<String> = serde_json::from_slice(&chunk_bytes)?;

        index.validate()?;
        if index.len() != chunks.len() {
            return Err(SearchError::Corrupt {
                path: handle.to_string(),
                details: format!("{} vectors for {} chunks", index.len(), chunks.len()),
            });
        }

        Ok((index, chunks))
    }

    /// Nearest chunks for `query`, closest first. Failures surface as errors.
    pub async fn try_search(
        &self,
        handle: &IndexHandle,
        query: &str,
        k: usize,
    ) -> Result<Vec<String>, SearchError> {
        let (index, chunks) = self.load(handle).await?;

        let query_vector = self
            .embeddings
            .embed(&[query.to_string()], EmbeddingPurpose::Query)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| {
                SearchError::EmbeddingUnavailable("query embedding failed".to_string())
            })?;

        let neighbors = index.search(&query_vector, k)?;

        Ok(neighbors
            .into_iter()
            .filter_map(|neighbor| chunks.get(neighbor.position).cloned())
            .collect())
    }

    /// Like [`IndexStore::try_search`], but any failure is logged and yields no chunks.
    pub async fn search(&self, handle: &IndexHandle, query: &str, k: usize) -> Vec<String> {
        match self.try_search(handle, query, k).await {
            Ok(chunks) => chunks,
            Err(search_error) => {
                error!(path = %handle, error = %search_error, "similarity search failed");
                Vec::new()
            }
        }
    }

    pub async fn delete(&self, handle: &IndexHandle) -> Result<(), SearchError> {
        handle.remove().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::error::ProviderError;
    use crate::traits::EmbeddingBackend;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct BrokenBackend;

    #[async_trait]
    impl EmbeddingBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn embed_batch(
            &self,
            _texts: &[String],
            _purpose: EmbeddingPurpose,
        ) -> Result<Vec<Vec<f32>>, ProviderError> {
            Err(ProviderError::InvalidResponse {
                backend: "broken".to_string(),
                details: "offline".to_string(),
            })
        }
    }

    fn store(root: &Path) -> IndexStore {
        let client = EmbeddingClient::new(Arc::new(HashingEmbedder { dimensions: 64 }), 2);
        IndexStore::new(root, Arc::new(client))
    }

    fn chunks() -> Vec<String> {
        vec![
            "Refunds are issued within 30 days of purchase.".to_string(),
            "Shipping takes five business days.".to_string(),
            "Warranty covers manufacturing defects for one year.".to_string(),
            "Support is available by email around the clock.".to_string(),
        ]
    }

    #[tokio::test]
    async fn empty_chunk_list_builds_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = store(dir.path());

        assert!(store.build(&[], 7).await?.is_none());
        assert!(!dir.path().join("7").exists());
        Ok(())
    }

    #[tokio::test]
    async fn build_persists_aligned_vectors_and_chunks() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempdir()?;
        let store = store(dir.path());

        let handle = store.build(&chunks(), 7).await?.expect("index expected");

        assert_eq!(handle.index_path(), dir.path().join("7").join(INDEX_FILE_NAME));
        let index: FlatL2Index = serde_json::from_slice(&std::fs::read(handle.index_path())?)?;
        let stored: Vec<String> = serde_json::from_slice(&std::fs::read(handle.chunks_path())?)?;
        assert_eq!(index.len(), 4);
        assert_eq!(index.dimension(), 64);
        assert_eq!(stored, chunks());
        Ok(())
    }

    #[tokio::test]
    async fn build_fails_hard_when_embedding_fails() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let client = EmbeddingClient::new(Arc::new(BrokenBackend), 8);
        let store = IndexStore::new(dir.path(), Arc::new(client));

        let result = store.build(&chunks(), 3).await;

        assert!(matches!(result, Err(SearchError::EmbeddingUnavailable(_))));
        assert!(!dir.path().join("3").exists());
        Ok(())
    }

    #[tokio::test]
    async fn failed_write_removes_the_partial_index() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = store(dir.path());
        let handle = store.handle_for(6);
        std::fs::create_dir_all(handle.chunks_path())?;

        assert!(matches!(
            store.build(&chunks(), 6).await,
            Err(SearchError::Io(_))
        ));
        assert!(!dir.path().join("6").exists());
        Ok(())
    }

    #[tokio::test]
    async fn search_returns_min_k_n_nearest_first() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = store(dir.path());
        let handle = store.build(&chunks(), 1).await?.expect("index expected");

        let top = store.try_search(&handle, "Refunds are issued within 30 days", 2).await?;
        assert_eq!(top.len(), 2);
        assert_eq!(top[0], chunks()[0]);

        let all = store.try_search(&handle, "refund", 10).await?;
        assert_eq!(all.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_searches_are_identical() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = store(dir.path());
        let handle = store.build(&chunks(), 1).await?.expect("index expected");

        let first = store.search(&handle, "how long does shipping take", 3).await;
        let second = store.search(&handle, "how long does shipping take", 3).await;

        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn search_is_soft_on_missing_or_corrupt_files() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempdir()?;
        let store = store(dir.path());

        let missing = store.handle_for(99);
        assert!(store.search(&missing, "anything", 3).await.is_empty());
        assert!(store.try_search(&missing, "anything", 3).await.is_err());

        let handle = store.build(&chunks(), 2).await?.expect("index expected");
        std::fs::write(handle.chunks_path(), b"[\"only one\"]")?;
        assert!(store.search(&handle, "refund", 3).await.is_empty());
        assert!(matches!(
            store.try_search(&handle, "refund", 3).await,
            Err(SearchError::Corrupt { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_the_directory_and_tolerates_repeats(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = store(dir.path());
        let handle = store.build(&chunks(), 5).await?.expect("index expected");

        store.delete(&handle).await?;
        assert!(!dir.path().join("5").exists());
        store.delete(&handle).await?;
        Ok(())
    }
}
