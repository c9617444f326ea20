use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful assistant that answers \
    questions based on the provided context. If the context doesn't contain relevant \
    information, say so and provide a general answer. Always be concise and accurate.";

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EmbeddingPurpose {
    Query,
    Document,
}

impl EmbeddingPurpose {
    pub fn task_type(self) -> &'static str {
        match self {
            EmbeddingPurpose::Query => "RETRIEVAL_QUERY",
            EmbeddingPurpose::Document => "RETRIEVAL_DOCUMENT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Principal {
    Anonymous,
    User { id: i64, username: Option<String> },
}

impl Principal {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Principal::Anonymous)
    }

    pub fn user_id(&self) -> Option<i64> {
        match self {
            Principal::Anonymous => None,
            Principal::User { id, .. } => Some(*id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub id: i64,
    pub owner_id: i64,
    pub title: String,
    pub source_path: String,
    pub checksum: String,
    pub uploaded_at: DateTime<Utc>,
    pub processed: bool,
    pub index_path: Option<String>,
    pub chunk_count: usize,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub owner_id: i64,
    pub title: String,
    pub source_path: String,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_overlap: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingOptions {
    pub base_url: String,
    pub model: String,
    pub batch_size: usize,
    pub timeout: Duration,
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            model: "text-embedding-004".to_string(),
            batch_size: 100,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub base_url: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub system_instruction: String,
    pub timeout: Duration,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            model: "gemini-2.5-flash".to_string(),
            max_output_tokens: 1_000,
            temperature: 0.7,
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// A single-turn generation call: the user turn and the system directive stay separate.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system_instruction: String,
    pub user_prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrievalOptions {
    pub top_k: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self { top_k: 3 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_file_bytes: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 10 * 1024 * 1024,
        }
    }
}
