use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProgressConfig;
use crate::course::{CompletionStore, Course};
use crate::error::Error;
use crate::tool::Tool;

use super::messages::Sender;
use super::progress::{ProgressAnalyzer, ProgressVerdict};
use super::{SessionKey, TutorSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    CheckPending,
    Advancing,
}

/// Per-session progress bookkeeping.
#[derive(Debug)]
pub struct ProgressState {
    pub phase: Phase,
    /// Exchange count at the last check that reached the analyzer.
    pub checked_len: usize,
    /// Cached course view, refreshed after every successful advancement.
    pub course: Course,
}

impl ProgressState {
    pub fn new(course: Course) -> Self {
        Self {
            phase: Phase::Idle,
            checked_len: 0,
            course,
        }
    }
}

#[derive(Debug)]
pub enum CheckOutcome {
    /// Gating conditions not met, or a check was already running.
    Skipped,
    NotComplete(ProgressVerdict),
    Advanced { course: Course, announcement: String },
    StoreFailed(Error),
}

/// Decides when to analyze a session's conversation and applies the verdict.
pub struct ProgressController {
    config: ProgressConfig,
    analyzer: ProgressAnalyzer,
    store: Arc<dyn CompletionStore>,
    pending: DashMap<SessionKey, (u64, JoinHandle<()>)>,
    generation: AtomicU64,
}

impl ProgressController {
    pub fn new(
        config: ProgressConfig,
        analyzer: ProgressAnalyzer,
        store: Arc<dyn CompletionStore>,
    ) -> Self {
        Self {
            config,
            analyzer,
            store,
            pending: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn analyzer(&self) -> &ProgressAnalyzer {
        &self.analyzer
    }

    /// Rearm the debounce timer of a session. A pending timer for the same
    /// session is aborted; a check that already started keeps running.
    pub fn schedule(self: &Arc<Self>, session: &Arc<TutorSession>) {
        let key = session.key;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(session);
        let controller = Arc::clone(self);
        let delay = self.config.debounce();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            controller
                .pending
                .remove_if(&key, |_, (current, _)| *current == generation);
            tokio::spawn(async move {
                let Some(session) = weak.upgrade() else {
                    debug!(?key, "session closed before progress check");
                    return;
                };
                controller.check_now(&session).await;
            });
        });
        if let Some((_, previous)) = self.pending.insert(key, (generation, timer)) {
            previous.abort();
        }
    }

    /// Drop the pending timer of a session, if any.
    pub fn cancel(&self, key: &SessionKey) {
        if let Some((_, (_, timer))) = self.pending.remove(key) {
            timer.abort();
        }
    }

    pub fn pending_checks(&self) -> usize {
        self.pending.len()
    }

    /// Run one progress check for the session right away.
    pub async fn check_now(&self, session: &TutorSession) -> CheckOutcome {
        let (total, window) = {
            let buffer = session.buffer.lock();
            (
                buffer.exchange_count(),
                buffer.recent_turns(self.config.window_turns),
            )
        };
        let (module_number, previous_len) = {
            let mut progress = session.progress.lock();
            if progress.phase != Phase::Idle {
                return CheckOutcome::Skipped;
            }
            if total < self.config.min_total_messages
                || total.saturating_sub(progress.checked_len) < self.config.min_new_messages
            {
                return CheckOutcome::Skipped;
            }
            let completed = progress.course.modules_completed.max(0) as usize;
            if completed >= session.tool.modules.len() {
                progress.checked_len = total;
                return CheckOutcome::Skipped;
            }
            let previous_len = progress.checked_len;
            progress.phase = Phase::CheckPending;
            progress.checked_len = total;
            (completed + 1, previous_len)
        };

        let verdict = self
            .analyzer
            .analyze(&window, &session.tool.name, module_number)
            .await;
        if !verdict.advances(self.config.confidence_threshold) {
            debug!(
                user_id = session.key.user_id,
                tool_id = session.key.tool_id,
                module = module_number,
                confidence = verdict.confidence,
                "module not complete yet"
            );
            session.progress.lock().phase = Phase::Idle;
            return CheckOutcome::NotComplete(verdict);
        }

        session.progress.lock().phase = Phase::Advancing;
        let course = match self
            .store
            .increment_modules_completed(session.key.user_id, session.key.tool_id)
            .await
        {
            Ok(course) => course,
            Err(e) => {
                warn!(
                    user_id = session.key.user_id,
                    tool_id = session.key.tool_id,
                    "failed to record module completion: {}",
                    e
                );
                let mut progress = session.progress.lock();
                progress.checked_len = previous_len;
                progress.phase = Phase::Idle;
                return CheckOutcome::StoreFailed(e);
            }
        };

        let announcement = announcement(&session.tool, &course, &verdict);
        {
            let _turn = session.turn.lock().await;
            session
                .buffer
                .lock()
                .push(Sender::Announcement, announcement.clone());
        }
        {
            let mut progress = session.progress.lock();
            progress.course = course.clone();
            progress.phase = Phase::Idle;
        }
        info!(
            user_id = session.key.user_id,
            tool_id = session.key.tool_id,
            modules_completed = course.modules_completed,
            "module completed"
        );
        CheckOutcome::Advanced {
            course,
            announcement,
        }
    }
}

/// The synthetic message appended after a module is credited.
pub fn announcement(tool: &Tool, course: &Course, verdict: &ProgressVerdict) -> String {
    let completed = course.modules_completed.max(0) as usize;
    let mut text = match tool.module(completed) {
        Some(module) => format!(
            "🎉 Great work! You've completed Module {}: {}.",
            completed, module.title
        ),
        None => format!("🎉 Great work! You've completed Module {}.", completed),
    };
    if !verdict.topics_covered.is_empty() {
        let topics = verdict
            .topics_covered
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        text.push_str(&format!(" Topics covered: {}.", topics));
    }
    match tool.module(completed + 1) {
        Some(next) => text.push_str(&format!(
            " Next up is Module {}: {}. {} Ready to dive in?",
            completed + 1,
            next.title,
            next.description
        )),
        None => text.push_str(&format!(
            " Congratulations, you have finished all {} modules of {}!",
            tool.modules.len(),
            tool.name
        )),
    }
    text
}
