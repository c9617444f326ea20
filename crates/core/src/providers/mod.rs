pub mod gemini;

pub use gemini::{GeminiChatModel, GeminiEmbeddingBackend};
