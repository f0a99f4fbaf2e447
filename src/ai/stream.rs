use std::time::Duration;

use async_trait::async_trait;
use reqwest_eventsource::{
    Error as EventSourceError, Event as ReqwestEvent, EventSource as ReqwestEventSource,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{CompletionEvent, CompletionProvider, CompletionRequest};
use crate::data::model::{ContentBlock, PromptTurn, TokenUsage};

/// Any endpoint speaking the OpenAI chat completions protocol. The endpoint
/// and credential come from the model row, so one client serves every model.
#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

pub fn completion_url(endpoint: &str) -> String {
    format!("{}/chat/completions", endpoint.trim_end_matches('/'))
}

fn turn_message(turn: &PromptTurn) -> Option<Value> {
    let has_image = turn
        .content
        .iter()
        .any(|block| matches!(block, ContentBlock::Image { .. }));

    let content = if has_image {
        let parts = turn
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(json!({"type": "text", "text": text})),
                ContentBlock::Image { url, .. } => {
                    Some(json!({"type": "image_url", "image_url": {"url": url}}))
                }
                ContentBlock::Reasoning { .. } => None,
            })
            .collect::<Vec<Value>>();
        Value::Array(parts)
    } else {
        let text = turn
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() {
            return None;
        }
        Value::String(text)
    };

    Some(json!({"role": turn.role.as_str(), "content": content}))
}

pub fn request_body(request: &CompletionRequest) -> Value {
    let system_message = request
        .system_prompt
        .as_ref()
        .filter(|prompt| !prompt.trim().is_empty())
        .map(|prompt| json!({"role": "system", "content": prompt}));

    // System prompt first, then the turns; empty turns are dropped.
    let messages = std::iter::once(system_message)
        .chain(request.turns.iter().map(turn_message))
        .flatten()
        .collect::<Vec<Value>>();

    let mut body = json!({
        "model": request.model.name,
        "messages": messages,
        "stream": true,
        "stream_options": {"include_usage": true}
    });

    if let Some(max_tokens) = request.model.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.model.temperature {
        body["temperature"] = json!(temperature);
    }

    body
}

#[derive(Debug, Default, PartialEq)]
struct ChunkParts {
    reasoning: Option<String>,
    text: Option<String>,
    usage: Option<TokenUsage>,
    finished: bool,
}

fn parse_chunk(chunk: &Value) -> ChunkParts {
    let choice = &chunk["choices"][0];
    let delta = &choice["delta"];
    let non_empty = |value: &Value| {
        value
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let usage = chunk.get("usage").filter(|u| u.is_object()).map(|u| {
        TokenUsage::from_reported(
            u["prompt_tokens"].as_i64(),
            u["completion_tokens"].as_i64(),
            u["total_tokens"].as_i64(),
        )
    });

    ChunkParts {
        reasoning: non_empty(&delta["reasoning_content"])
            .or_else(|| non_empty(&delta["reasoning"])),
        text: non_empty(&delta["content"]),
        usage,
        finished: choice["finish_reason"].is_string(),
    }
}

fn describe_error(err: &EventSourceError) -> String {
    match err {
        EventSourceError::InvalidStatusCode(status, _) => {
            format!("provider responded with status {}", status)
        }
        EventSourceError::Transport(err) => format!("provider transport error: {}", err),
        other => format!("provider stream error: {}", other),
    }
}

fn end_of_stream(finish_seen: bool, usage: TokenUsage) -> CompletionEvent {
    if finish_seen {
        CompletionEvent::Finished(usage)
    } else {
        CompletionEvent::Failed("provider stream ended before the completion finished".to_string())
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    #[tracing::instrument(
        name = "completion",
        skip_all,
        fields(model = %request.model.name, provider = %request.model.provider)
    )]
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        sender: mpsc::Sender<CompletionEvent>,
        cancel: CancellationToken,
    ) {
        let builder = self
            .client
            .post(completion_url(&request.model.endpoint))
            .bearer_auth(&request.model.api_key)
            .json(&request_body(&request));

        let mut stream = match ReqwestEventSource::new(builder) {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "could not build provider request");
                let _ = sender
                    .send(CompletionEvent::Failed("could not build provider request".to_string()))
                    .await;
                return;
            }
        };

        let mut usage = TokenUsage::default();
        let mut finish_seen = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                event = stream.next() => Some(event),
            };
            let Some(event) = next else {
                debug!("completion cancelled by caller");
                stream.close();
                return;
            };

            let terminal = match event {
                None | Some(Err(EventSourceError::StreamEnded)) => {
                    Some(end_of_stream(finish_seen, usage))
                }
                Some(Ok(ReqwestEvent::Open)) => {
                    debug!("provider stream open");
                    None
                }
                Some(Ok(ReqwestEvent::Message(message))) => {
                    if message.data.trim() == "[DONE]" {
                        Some(CompletionEvent::Finished(usage))
                    } else {
                        match serde_json::from_str::<Value>(&message.data) {
                            Ok(chunk) => {
                                let parts = parse_chunk(&chunk);
                                if let Some(reported) = parts.usage {
                                    usage = reported;
                                }
                                finish_seen |= parts.finished;

                                let deltas = parts
                                    .reasoning
                                    .map(CompletionEvent::Reasoning)
                                    .into_iter()
                                    .chain(parts.text.map(CompletionEvent::Text));
                                for delta in deltas {
                                    if sender.send(delta).await.is_err() {
                                        debug!("completion receiver dropped");
                                        stream.close();
                                        return;
                                    }
                                }
                                None
                            }
                            Err(err) => {
                                warn!(error = %err, "skipping unparseable provider chunk");
                                None
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    error!(error = %err, "provider stream failed");
                    Some(CompletionEvent::Failed(describe_error(&err)))
                }
            };

            if let Some(event) = terminal {
                // Closing also stops the event source from reconnecting.
                stream.close();
                let _ = sender.send(event).await;
                return;
            }
        }
    }
}
