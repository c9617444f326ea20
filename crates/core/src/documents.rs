use crate::error::DocumentError;
use crate::models::{DocumentRecord, NewDocument};
use crate::traits::DocumentRepository;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Catalog {
    next_id: i64,
    documents: Vec<DocumentRecord>,
}

/// Document records kept in one JSON file, or only in memory when no path is given.
pub struct JsonDocumentStore {
    path: Option<PathBuf>,
    catalog: RwLock<Catalog>,
}

impl JsonDocumentStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            catalog: RwLock::new(Catalog {
                next_id: 1,
                documents: Vec::new(),
            }),
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, DocumentError> {
        let path = path.into();
        let catalog = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(io_error) if io_error.kind() == ErrorKind::NotFound => Catalog {
                next_id: 1,
                documents: Vec::new(),
            },
            Err(io_error) => return Err(io_error.into()),
        };

        Ok(Self {
            path: Some(path),
            catalog: RwLock::new(catalog),
        })
    }

    async fn persist(&self, catalog: &Catalog) -> Result<(), DocumentError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, serde_json::to_vec_pretty(catalog)?).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentRepository for JsonDocumentStore {
    async fn get(
        &self,
        owner_id: i64,
        document_id: i64,
    ) -> Result<Option<DocumentRecord>, DocumentError> {
        let catalog = self.catalog.read().await;
        Ok(catalog
            .documents
            .iter()
            .find(|document| document.id == document_id && document.owner_id == owner_id)
            .cloned())
    }

    async fn latest_processed(
        &self,
        owner_id: i64,
    ) -> Result<Option<DocumentRecord>, DocumentError> {
        let catalog = self.catalog.read().await;
        Ok(catalog
            .documents
            .iter()
            .filter(|document| document.owner_id == owner_id && document.processed)
            .max_by(|left, right| {
                left.uploaded_at
                    .cmp(&right.uploaded_at)
                    .then(left.id.cmp(&right.id))
            })
            .cloned())
    }

    async fn list(&self, owner_id: i64) -> Result<Vec<DocumentRecord>, DocumentError> {
        let catalog = self.catalog.read().await;
        let mut documents: Vec<DocumentRecord> = catalog
            .documents
            .iter()
            .filter(|document| document.owner_id == owner_id)
            .cloned()
            .collect();
        documents.sort_by(|left, right| {
            right
                .uploaded_at
                .cmp(&left.uploaded_at)
                .then(right.id.cmp(&left.id))
        });
        Ok(documents)
    }

    async fn insert(&self, document: NewDocument) -> Result<DocumentRecord, DocumentError> {
        let mut catalog = self.catalog.write().await;
        let mut staged = catalog.clone();
        let record = DocumentRecord {
            id: staged.next_id,
            owner_id: document.owner_id,
            title: document.title,
            source_path: document.source_path,
            checksum: document.checksum,
            uploaded_at: Utc::now(),
            processed: false,
            index_path: None,
            chunk_count: 0,
        };
        staged.next_id += 1;
        staged.documents.push(record.clone());

        self.persist(&staged).await?;
        *catalog = staged;
        Ok(record)
    }

    async fn mark_processed(
        &self,
        document_id: i64,
        index_path: String,
        chunk_count: usize,
    ) -> Result<DocumentRecord, DocumentError> {
        let mut catalog = self.catalog.write().await;
        let mut staged = catalog.clone();
        let record = staged
            .documents
            .iter_mut()
            .find(|document| document.id == document_id)
            .ok_or(DocumentError::NotFound(document_id))?;

        record.processed = true;
        record.index_path = Some(index_path);
        record.chunk_count = chunk_count;
        let updated = record.clone();

        self.persist(&staged).await?;
        *catalog = staged;
        Ok(updated)
    }

    async fn remove(&self, document_id: i64) -> Result<Option<DocumentRecord>, DocumentError> {
        let mut catalog = self.catalog.write().await;
        let Some(position) = catalog
            .documents
            .iter()
            .position(|document| document.id == document_id)
        else {
            return Ok(None);
        };

        let mut staged = catalog.clone();
        let removed = staged.documents.remove(position);
        self.persist(&staged).await?;
        *catalog = staged;
        Ok(Some(removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn upload(owner_id: i64, title: &str) -> NewDocument {
        NewDocument {
            owner_id,
            title: title.to_string(),
            source_path: format!("/uploads/{title}"),
            checksum: "abc".to_string(),
        }
    }

    #[tokio::test]
    async fn ids_are_sequential_and_scoped_by_owner() -> Result<(), Box<dyn std::error::Error>> {
        let store = JsonDocumentStore::in_memory();
        let first = store.insert(upload(1, "a.pdf")).await?;
        let second = store.insert(upload(2, "b.pdf")).await?;

        assert_eq!((first.id, second.id), (1, 2));
        assert!(store.get(1, first.id).await?.is_some());
        assert!(store.get(1, second.id).await?.is_none());
        assert!(!first.processed);
        Ok(())
    }

    #[tokio::test]
    async fn latest_processed_skips_unprocessed_documents(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let store = JsonDocumentStore::in_memory();
        let older = store.insert(upload(1, "older.pdf")).await?;
        let newer = store.insert(upload(1, "newer.pdf")).await?;

        assert!(store.latest_processed(1).await?.is_none());

        store.mark_processed(older.id, "/idx/1/index.json".to_string(), 4).await?;
        assert_eq!(store.latest_processed(1).await?.map(|d| d.id), Some(older.id));

        store.mark_processed(newer.id, "/idx/2/index.json".to_string(), 2).await?;
        let latest = store.latest_processed(1).await?.expect("processed document");
        assert_eq!(latest.id, newer.id);
        assert_eq!(latest.chunk_count, 2);
        Ok(())
    }

    #[tokio::test]
    async fn list_is_newest_first() -> Result<(), Box<dyn std::error::Error>> {
        let store = JsonDocumentStore::in_memory();
        store.insert(upload(1, "a.pdf")).await?;
        store.insert(upload(1, "b.pdf")).await?;

        let titles: Vec<String> = store.list(1).await?.into_iter().map(|d| d.title).collect();
        assert_eq!(titles, vec!["b.pdf".to_string(), "a.pdf".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn catalog_survives_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("documents.json");

        let store = JsonDocumentStore::open(&path).await?;
        let record = store.insert(upload(3, "manual.pdf")).await?;
        store.mark_processed(record.id, "/idx/1/index.json".to_string(), 9).await?;
        drop(store);

        let reopened = JsonDocumentStore::open(&path).await?;
        let loaded = reopened.get(3, record.id).await?.expect("record persisted");
        assert!(loaded.processed);
        assert_eq!(loaded.chunk_count, 9);
        assert_eq!(reopened.insert(upload(3, "next.pdf")).await?.id, record.id + 1);
        Ok(())
    }

    #[tokio::test]
    async fn remove_and_missing_updates() -> Result<(), Box<dyn std::error::Error>> {
        let store = JsonDocumentStore::in_memory();
        let record = store.insert(upload(1, "a.pdf")).await?;

        assert!(store.remove(record.id).await?.is_some());
        assert!(store.remove(record.id).await?.is_none());
        assert!(matches!(
            store.mark_processed(record.id, String::new(), 0).await,
            Err(DocumentError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn failed_writes_leave_the_catalog_unchanged() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempdir()?;
        let catalog_dir = dir.path().join("catalog");
        let store = JsonDocumentStore::open(catalog_dir.join("documents.json")).await?;
        let record = store.insert(upload(1, "a.pdf")).await?;

        std::fs::remove_dir_all(&catalog_dir)?;
        std::fs::write(&catalog_dir, b"not a directory")?;

        assert!(store.insert(upload(1, "b.pdf")).await.is_err());
        assert!(store
            .mark_processed(record.id, "/idx/1/index.json".to_string(), 3)
            .await
            .is_err());
        assert!(store.remove(record.id).await.is_err());

        let listed = store.list(1).await?;
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].processed);
        assert!(listed[0].index_path.is_none());
        assert!(store.latest_processed(1).await?.is_none());

        std::fs::remove_file(&catalog_dir)?;
        assert_eq!(store.insert(upload(1, "b.pdf")).await?.id, record.id + 1);
        Ok(())
    }
}
