use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::utils::{now_utc, truncate_chars};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    #[serde(alias = "ai")]
    Assistant,
    /// Synthetic progress messages injected by the tutor itself.
    #[serde(alias = "system")]
    Announcement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: i64,
    pub sender: Sender,
    pub text: String,
    pub is_streaming: bool,
}

/// A sender and its text, as exchanged with clients and the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Turn {
    pub sender: Sender,
    pub text: String,
}

impl Turn {
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            sender,
            text: text.into(),
        }
    }

    /// Render as `sender: text`, truncating the text to `limit` characters.
    pub fn render(&self, limit: usize) -> String {
        let sender = match self.sender {
            Sender::User => "user",
            Sender::Assistant => "ai",
            Sender::Announcement => "system",
        };
        format!("{}: {}", sender, truncate_chars(&self.text, limit))
    }
}

impl From<&ConversationMessage> for Turn {
    fn from(message: &ConversationMessage) -> Self {
        Turn::new(message.sender, message.text.clone())
    }
}

/// Session-scoped, insertion-ordered conversation.
#[derive(Debug, Default)]
pub struct ConversationBuffer {
    messages: Vec<ConversationMessage>,
    last_id: i64,
}

impl ConversationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids come from the creation time in milliseconds, bumped to stay unique and increasing.
    fn next_id(&mut self) -> i64 {
        let now = (now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        self.last_id = now.max(self.last_id + 1);
        self.last_id
    }

    pub fn push(&mut self, sender: Sender, text: impl Into<String>) -> i64 {
        let id = self.next_id();
        self.messages.push(ConversationMessage {
            id,
            sender,
            text: text.into(),
            is_streaming: false,
        });
        id
    }

    /// Start an empty assistant message that will be filled while streaming.
    pub fn begin_streaming(&mut self) -> i64 {
        let id = self.next_id();
        self.messages.push(ConversationMessage {
            id,
            sender: Sender::Assistant,
            text: String::new(),
            is_streaming: true,
        });
        id
    }

    pub fn append(&mut self, id: i64, delta: &str) {
        if let Some(message) = self.get_mut(id) {
            message.text.push_str(delta);
        }
    }

    pub fn replace_text(&mut self, id: i64, text: impl Into<String>) {
        if let Some(message) = self.get_mut(id) {
            message.text = text.into();
        }
    }

    pub fn finish(&mut self, id: i64) {
        if let Some(message) = self.get_mut(id) {
            message.is_streaming = false;
        }
    }

    fn get_mut(&mut self, id: i64) -> Option<&mut ConversationMessage> {
        self.messages.iter_mut().rev().find(|m| m.id == id)
    }

    pub fn get(&self, id: i64) -> Option<&ConversationMessage> {
        self.messages.iter().rev().find(|m| m.id == id)
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Count of finished user and assistant messages. Announcements do not count.
    pub fn exchange_count(&self) -> usize {
        self.exchanged().count()
    }

    fn exchanged(&self) -> impl DoubleEndedIterator<Item = &ConversationMessage> {
        self.messages
            .iter()
            .filter(|m| !m.is_streaming && m.sender != Sender::Announcement)
    }

    /// The last `count` finished user/assistant turns, oldest first.
    pub fn recent_turns(&self, count: usize) -> Vec<Turn> {
        let mut turns: Vec<Turn> = self.exchanged().rev().take(count).map(Turn::from).collect();
        turns.reverse();
        turns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_message_accumulates_deltas() {
        let mut buffer = ConversationBuffer::new();
        buffer.push(Sender::User, "what is a list?");
        let id = buffer.begin_streaming();
        buffer.append(id, "A list ");
        buffer.append(id, "is ordered.");
        assert!(buffer.get(id).unwrap().is_streaming);
        assert_eq!(buffer.exchange_count(), 1);
        buffer.finish(id);
        let message = buffer.get(id).unwrap();
        assert_eq!(message.text, "A list is ordered.");
        assert!(!message.is_streaming);
        assert_eq!(buffer.exchange_count(), 2);
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let mut buffer = ConversationBuffer::new();
        let ids: Vec<i64> = (0..50).map(|i| buffer.push(Sender::User, i.to_string())).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn recent_turns_skip_announcements_and_keep_order() {
        let mut buffer = ConversationBuffer::new();
        buffer.push(Sender::User, "one");
        buffer.push(Sender::Assistant, "two");
        buffer.push(Sender::Announcement, "module done");
        buffer.push(Sender::User, "three");
        let turns = buffer.recent_turns(2);
        assert_eq!(
            turns,
            vec![
                Turn::new(Sender::Assistant, "two"),
                Turn::new(Sender::User, "three")
            ]
        );
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn sender_accepts_client_aliases() {
        let turn: Turn = serde_json::from_str(r#"{"sender":"ai","text":"hi"}"#).unwrap();
        assert_eq!(turn.sender, Sender::Assistant);
        assert_eq!(turn.render(1), "ai: h");
    }
}
