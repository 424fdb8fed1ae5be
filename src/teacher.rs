pub mod controller;
pub mod messages;
pub mod progress;
pub mod prompt;
pub mod relay;

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{info, warn};
use utoipa::ToSchema;

use controller::{ProgressController, ProgressState};
use messages::{ConversationBuffer, ConversationMessage, Sender};
use progress::ProgressAnalyzer;
use prompt::{InstructionContext, build_instruction};
use relay::{
    APOLOGY_MESSAGE, RATE_LIMIT_MESSAGE, RelayEvent, RelayOutcome, STREAM_FAILURE_MESSAGE,
    StreamRelay,
};

use crate::ai_utils::{ChatTurn, CompletionRequest, LanguageModel};
use crate::config::Config;
use crate::course::{CompletionStore, Course};
use crate::error::{Error, LlmError, Result};
use crate::tool::{Tool, get_tool};
use crate::user::{UserProfile, get_user, personalization_fragments};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: i64,
    pub tool_id: i64,
}

/// One user's live tutoring conversation about one tool.
pub struct TutorSession {
    pub key: SessionKey,
    pub user: UserProfile,
    pub tool: Tool,
    personalization: Vec<String>,
    buffer: parking_lot::Mutex<ConversationBuffer>,
    progress: parking_lot::Mutex<ProgressState>,
    /// Held for a whole exchange so announcements never land mid-stream.
    turn: tokio::sync::Mutex<()>,
}

impl TutorSession {
    pub fn new(user: UserProfile, tool: Tool, personalization: Vec<String>, course: Course) -> Self {
        Self {
            key: SessionKey {
                user_id: user.id,
                tool_id: tool.id,
            },
            user,
            tool,
            personalization,
            buffer: parking_lot::Mutex::new(ConversationBuffer::new()),
            progress: parking_lot::Mutex::new(ProgressState::new(course)),
            turn: tokio::sync::Mutex::new(()),
        }
    }

    pub fn course(&self) -> Course {
        self.progress.lock().course.clone()
    }

    /// 1-based module being taught. Stays on the last module once all are done.
    pub fn current_module(&self) -> usize {
        let completed = self.progress.lock().course.modules_completed.max(0) as usize;
        (completed + 1).min(self.tool.modules.len()).max(1)
    }

    pub fn messages(&self) -> Vec<ConversationMessage> {
        self.buffer.lock().messages().to_vec()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            current_module: self.current_module(),
            course: self.course(),
            messages: self.messages(),
        }
    }

    fn welcome(&self) -> String {
        let mut text = format!(
            "Hi {}! Welcome to your {} course.",
            self.user.display_name(),
            self.tool.name
        );
        let module_number = self.current_module();
        if let Some(module) = self.tool.module(module_number) {
            text.push_str(&format!(
                " We're on Module {}: {}. {} What would you like to start with?",
                module_number, module.title, module.description
            ));
        }
        text
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub current_module: usize,
    pub course: Course,
    pub messages: Vec<ConversationMessage>,
}

/// Turn a failed stream into the text kept as the assistant message and the
/// event reported to the client. Returns `None` for the text when the partial
/// reply already in the buffer should stay as it is.
pub async fn resolve_failure(
    relay: &StreamRelay,
    message: &str,
    partial: &str,
    error: &LlmError,
) -> (Option<String>, RelayEvent) {
    if error.is_rate_limited() {
        let text = partial.is_empty().then(|| RATE_LIMIT_MESSAGE.to_string());
        return (text, RelayEvent::Error(RATE_LIMIT_MESSAGE.to_string()));
    }
    if !partial.is_empty() {
        return (None, RelayEvent::Error(STREAM_FAILURE_MESSAGE.to_string()));
    }
    match relay.fallback(message).await {
        Ok(text) => (Some(text.clone()), RelayEvent::Text(text)),
        Err(e) => {
            warn!("fallback completion failed: {}", e);
            let text = if e.is_rate_limited() {
                RATE_LIMIT_MESSAGE
            } else {
                APOLOGY_MESSAGE
            };
            (Some(text.to_string()), RelayEvent::Error(text.to_string()))
        }
    }
}

/// Owns the tutoring sessions and wires them to the relay and the progress controller.
pub struct Tutor {
    relay: StreamRelay,
    controller: Arc<ProgressController>,
    store: Arc<dyn CompletionStore>,
    database: SqlitePool,
    sessions: Cache<SessionKey, Arc<TutorSession>>,
    history_window: usize,
}

impl Tutor {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn CompletionStore>,
        database: SqlitePool,
        config: &Config,
    ) -> Self {
        let analyzer = ProgressAnalyzer::new(model.clone(), &config.progress);
        let controller = Arc::new(ProgressController::new(
            config.progress.clone(),
            analyzer,
            store.clone(),
        ));
        let listener = controller.clone();
        let sessions = Cache::<SessionKey, Arc<TutorSession>>::builder()
            .max_capacity(config.session.max_sessions)
            .time_to_idle(Duration::from_secs(config.session.idle_timeout_secs))
            .eviction_listener(move |key: Arc<SessionKey>, _, cause| {
                info!(?key, ?cause, "tutoring session closed");
                listener.cancel(&key);
            })
            .build();
        Self {
            relay: StreamRelay::new(model),
            controller,
            store,
            database,
            sessions,
            history_window: config.session.history_window,
        }
    }

    pub fn relay(&self) -> &StreamRelay {
        &self.relay
    }

    pub fn analyzer(&self) -> &ProgressAnalyzer {
        self.controller.analyzer()
    }

    pub fn controller(&self) -> &Arc<ProgressController> {
        &self.controller
    }

    pub fn store(&self) -> &Arc<dyn CompletionStore> {
        &self.store
    }

    pub fn database(&self) -> &SqlitePool {
        &self.database
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    /// Return the live session, or enroll the user and start a new one.
    pub async fn open_session(&self, user_id: i64, tool_id: i64) -> Result<Arc<TutorSession>> {
        let key = SessionKey { user_id, tool_id };
        if let Some(session) = self.sessions.get(&key).await {
            return Ok(session);
        }
        let user = get_user(&self.database, user_id).await?;
        let tool = get_tool(&self.database, tool_id).await?;
        let personalization =
            personalization_fragments(&self.database, &user.questionnaire_answers).await?;
        let course = self.store.create(user_id, tool_id).await?;
        let session = TutorSession::new(user, tool, personalization, course);
        let welcome = session.welcome();
        session.buffer.lock().push(Sender::Announcement, welcome);
        let session = self
            .sessions
            .entry(key)
            .or_insert(Arc::new(session))
            .await
            .into_value();
        info!(user_id, tool_id, "tutoring session opened");
        Ok(session)
    }

    pub async fn session(&self, user_id: i64, tool_id: i64) -> Option<Arc<TutorSession>> {
        self.sessions.get(&SessionKey { user_id, tool_id }).await
    }

    /// Refresh the course view of a live session after an update made elsewhere.
    pub async fn sync_course(&self, course: &Course) {
        if let Some(session) = self.session(course.user_id, course.tool_id).await {
            let mut progress = session.progress.lock();
            if course.modules_completed > progress.course.modules_completed {
                progress.course = course.clone();
            }
        }
    }

    /// Close a session. Its pending progress check is cancelled.
    pub async fn close_session(&self, user_id: i64, tool_id: i64) -> bool {
        self.sessions
            .remove(&SessionKey { user_id, tool_id })
            .await
            .is_some()
    }

    /// Run one exchange: relay the reply to `tx` while recording it, then rearm
    /// the progress check. Returns the finished assistant message.
    pub async fn chat(
        &self,
        session: &Arc<TutorSession>,
        message: &str,
        tx: mpsc::Sender<RelayEvent>,
    ) -> Result<ConversationMessage> {
        let message = message.trim();
        if message.is_empty() {
            return Err(Error::BadRequest("message is required".to_string()));
        }
        let turn = session.turn.lock().await;

        let history = session.buffer.lock().recent_turns(self.history_window);
        let instruction = build_instruction(&InstructionContext {
            user: Some(&session.user),
            tool: Some(&session.tool),
            module_number: Some(session.current_module()),
            history: &history,
            history_window: self.history_window,
            personalization: &session.personalization,
        });
        let request = CompletionRequest {
            system: Some(instruction),
            messages: vec![ChatTurn::user(message)],
        };

        let reply_id = {
            let mut buffer = session.buffer.lock();
            buffer.push(Sender::User, message);
            buffer.begin_streaming()
        };
        let outcome = self
            .relay
            .relay(request, &tx, |delta| session.buffer.lock().append(reply_id, delta))
            .await;
        if let RelayOutcome::Failed { partial, error } = outcome {
            let (text, event) = resolve_failure(&self.relay, message, &partial, &error).await;
            if let Some(text) = text {
                session.buffer.lock().replace_text(reply_id, text);
            }
            if tx.send(event).await.is_ok() {
                let _ = tx.send(RelayEvent::Done).await;
            }
        }
        let reply = {
            let mut buffer = session.buffer.lock();
            buffer.finish(reply_id);
            buffer.get(reply_id).cloned()
        };
        drop(turn);

        self.controller.schedule(session);
        reply.ok_or(Error::NotFound("message"))
    }
}
