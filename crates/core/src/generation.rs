use crate::models::{GenerationOptions, GenerationRequest};
use crate::traits::ChatModel;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tracing::error;

pub struct ResponseGenerator {
    model: Arc<dyn ChatModel>,
    options: GenerationOptions,
}

impl ResponseGenerator {
    pub fn new(model: Arc<dyn ChatModel>, options: GenerationOptions) -> Self {
        Self { model, options }
    }

    pub fn request_for(&self, query: &str, context: &str) -> GenerationRequest {
        GenerationRequest {
            system_instruction: self.options.system_instruction.clone(),
            user_prompt: compose_prompt(query, context),
            max_output_tokens: self.options.max_output_tokens,
            temperature: self.options.temperature,
        }
    }

    /// Streams answer fragments. Nothing is sent until the stream is first polled; a failure
    /// ends the stream with a single `Error: ...` fragment.
    pub fn stream(&self, query: &str, context: &str) -> BoxStream<'static, String> {
        let model = Arc::clone(&self.model);
        let request = self.request_for(query, context);

        async_stream::stream! {
            let mut fragments = match model.stream_generate(request).await {
                Ok(fragments) => fragments,
                Err(failure) => {
                    error!(error = %failure, "generation request failed");
                    yield format!("Error: {failure}");
                    return;
                }
            };

            while let Some(next) = fragments.next().await {
                match next {
                    Ok(text) if text.is_empty() => continue,
                    Ok(text) => {
                        yield text;
                    }
                    Err(failure) => {
                        error!(error = %failure, "generation stream failed");
                        yield format!("Error: {failure}");
                        return;
                    }
                }
            }
        }
        .boxed()
    }
}

pub fn compose_prompt(query: &str, context: &str) -> String {
    if context.is_empty() {
        query.to_string()
    } else {
        format!("Context:\n{context}\n\nQuestion: {query}")
    }
}
