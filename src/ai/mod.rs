pub mod stream;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::data::model::{AiModel, PromptTurn, TokenUsage};

pub use stream::OpenAiCompatibleProvider;

/// What the provider task writes into the completion channel. `Finished` and
/// `Failed` are terminal; nothing follows them.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    Text(String),
    Reasoning(String),
    Finished(TokenUsage),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: AiModel,
    pub system_prompt: Option<String>,
    pub turns: Vec<PromptTurn>,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Streams one completion into `sender`. Implementations stop as soon as
    /// `cancel` fires or the receiver goes away, and close the upstream call.
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        sender: mpsc::Sender<CompletionEvent>,
        cancel: CancellationToken,
    );
}
