use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc::Sender;
use tracing::{debug, warn};

use crate::ai_utils::{CompletionRequest, LanguageModel, TextStream};
use crate::error::LlmError;

pub const RATE_LIMIT_MESSAGE: &str = "I'm currently experiencing high demand. Please try again in a moment.";
pub const STREAM_FAILURE_MESSAGE: &str = "Failed to get response";
pub const APOLOGY_MESSAGE: &str = "Sorry, something went wrong. Please try again.";

/// One frame of the chat stream delivered to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Text(String),
    Error(String),
    Done,
}

impl RelayEvent {
    /// The `data:` payload: a JSON object, or `[DONE]` for the end marker.
    pub fn payload(&self) -> String {
        match self {
            RelayEvent::Text(text) => json!({ "text": text }).to_string(),
            RelayEvent::Error(error) => json!({ "error": error }).to_string(),
            RelayEvent::Done => "[DONE]".to_string(),
        }
    }

    /// The full wire frame, `data: <payload>\n\n`.
    pub fn encode(&self) -> String {
        format!("data: {}\n\n", self.payload())
    }
}

#[derive(Debug)]
pub enum RelayOutcome {
    /// Every delta was forwarded and the end marker sent.
    Completed(String),
    /// The client went away; holds the text received up to that point.
    Disconnected(String),
    /// The upstream call failed. Nothing has been sent for the failure itself.
    Failed { partial: String, error: LlmError },
}

/// Relays a streamed model response to a client as discrete events.
#[derive(Clone)]
pub struct StreamRelay {
    model: Arc<dyn LanguageModel>,
}

impl StreamRelay {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    pub async fn open(&self, request: CompletionRequest) -> Result<TextStream, LlmError> {
        self.model.complete_stream(request).await
    }

    /// Forward deltas from `stream` to `tx`, calling `on_delta` for each one, and
    /// finish with [`RelayEvent::Done`].
    pub async fn forward(
        mut stream: TextStream,
        tx: &Sender<RelayEvent>,
        mut on_delta: impl FnMut(&str),
    ) -> RelayOutcome {
        let mut received = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    received.push_str(&delta);
                    on_delta(&delta);
                    if tx.send(RelayEvent::Text(delta)).await.is_err() {
                        debug!("client disconnected after {} bytes", received.len());
                        return RelayOutcome::Disconnected(received);
                    }
                }
                Err(error) => {
                    warn!("stream interrupted: {}", error);
                    return RelayOutcome::Failed {
                        partial: received,
                        error,
                    };
                }
            }
        }
        if tx.send(RelayEvent::Done).await.is_err() {
            return RelayOutcome::Disconnected(received);
        }
        RelayOutcome::Completed(received)
    }

    pub async fn relay(
        &self,
        request: CompletionRequest,
        tx: &Sender<RelayEvent>,
        on_delta: impl FnMut(&str),
    ) -> RelayOutcome {
        match self.open(request).await {
            Ok(stream) => Self::forward(stream, tx, on_delta).await,
            Err(error) => {
                warn!("failed to open stream: {}", error);
                RelayOutcome::Failed {
                    partial: String::new(),
                    error,
                }
            }
        }
    }

    /// Context-free, non-streaming completion used when streaming fails.
    pub async fn fallback(&self, message: &str) -> Result<String, LlmError> {
        self.model.complete(CompletionRequest::single(message)).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::ai_utils::testing::ScriptedModel;

    async fn collect(mut rx: mpsc::Receiver<RelayEvent>) -> Vec<RelayEvent> {
        let mut events = vec![];
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn frames_match_wire_format() {
        assert_eq!(
            RelayEvent::Text("hi \"you\"".into()).encode(),
            "data: {\"text\":\"hi \\\"you\\\"\"}\n\n"
        );
        assert_eq!(
            RelayEvent::Error("boom".into()).encode(),
            "data: {\"error\":\"boom\"}\n\n"
        );
        assert_eq!(RelayEvent::Done.encode(), "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn deltas_concatenate_to_the_full_reply() {
        let reply = ["Lists ", "are ", "ordered ", "collections."];
        let model = Arc::new(ScriptedModel::new());
        model.push_stream(&reply);
        model.push_completion(Ok(reply.concat()));
        let relay = StreamRelay::new(model.clone());

        let (tx, rx) = mpsc::channel(16);
        let mut seen = String::new();
        let outcome = relay
            .relay(CompletionRequest::single("lists?"), &tx, |d| seen.push_str(d))
            .await;
        drop(tx);
        let events = collect(rx).await;

        assert_eq!(events.last(), Some(&RelayEvent::Done));
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                RelayEvent::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        let fallback = relay.fallback("lists?").await.unwrap();
        assert_eq!(streamed, fallback);
        assert_eq!(seen, fallback);
        assert!(matches!(outcome, RelayOutcome::Completed(text) if text == fallback));
    }

    #[tokio::test]
    async fn open_failure_sends_nothing() {
        let model = Arc::new(ScriptedModel::new());
        model.push_stream_error(LlmError::RateLimited("429".into()));
        let relay = StreamRelay::new(model);
        let (tx, rx) = mpsc::channel(16);
        let outcome = relay
            .relay(CompletionRequest::single("hi"), &tx, |_| {})
            .await;
        drop(tx);
        assert!(collect(rx).await.is_empty());
        match outcome {
            RelayOutcome::Failed { partial, error } => {
                assert!(partial.is_empty());
                assert!(error.is_rate_limited());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_text() {
        let model = Arc::new(ScriptedModel::new());
        model.push_stream_items(vec![
            Ok("Half ".into()),
            Err(LlmError::RequestFailed("reset".into())),
            Ok("never".into()),
        ]);
        let relay = StreamRelay::new(model);
        let (tx, rx) = mpsc::channel(16);
        let outcome = relay.relay(CompletionRequest::single("hi"), &tx, |_| {}).await;
        drop(tx);
        assert_eq!(collect(rx).await, vec![RelayEvent::Text("Half ".into())]);
        assert!(matches!(outcome, RelayOutcome::Failed { partial, .. } if partial == "Half "));
    }

    #[tokio::test]
    async fn stops_forwarding_when_client_disconnects() {
        let model = Arc::new(ScriptedModel::new());
        model.push_stream(&["a", "b", "c"]);
        let relay = StreamRelay::new(model);
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let mut seen = String::new();
        let outcome = relay
            .relay(CompletionRequest::single("hi"), &tx, |d| seen.push_str(d))
            .await;
        assert!(matches!(outcome, RelayOutcome::Disconnected(text) if text == "a"));
        assert_eq!(seen, "a");
    }
}
