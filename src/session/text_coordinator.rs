//! Transcription fragment buffering.
//!
//! User speech and AI speech each arrive as a fast drip of partial text
//! fragments. Per direction, fragments accumulate into a buffer that is
//! flushed into exactly one transcript turn either when the upstream source
//! marks a fragment final or when the direction's debounce timer fires
//! after a quiet period. A buffer belonging to an interrupted AI utterance
//! is discarded, never committed.

use crate::audio_toolkit::text::sanitize_spoken_text;
use crate::channel::TextDirection;
use crate::session::{SessionManager, Speaker, TurnType};
use crate::settings::CallSettings;
use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

struct DirectionBuffer {
    buffer: String,
    timer: Option<AbortHandle>,
    /// Bumped on every mutation; a timer only flushes if its generation is
    /// still current, so a late-firing timer can never double-commit.
    generation: u64,
}

impl DirectionBuffer {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            timer: None,
            generation: 0,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Buffers incremental transcription fragments and commits whole
/// utterances to the session transcript.
pub struct TextCoordinator {
    session: Arc<SessionManager>,
    user_flush_delay: Duration,
    ai_flush_delay: Duration,
    user: Arc<Mutex<DirectionBuffer>>,
    ai: Arc<Mutex<DirectionBuffer>>,
}

impl TextCoordinator {
    pub fn new(session: Arc<SessionManager>, settings: &CallSettings) -> Self {
        Self {
            session,
            user_flush_delay: settings.user_flush_delay(),
            ai_flush_delay: settings.ai_flush_delay(),
            user: Arc::new(Mutex::new(DirectionBuffer::new())),
            ai: Arc::new(Mutex::new(DirectionBuffer::new())),
        }
    }

    fn slot(&self, direction: TextDirection) -> &Arc<Mutex<DirectionBuffer>> {
        match direction {
            TextDirection::User => &self.user,
            TextDirection::Ai => &self.ai,
        }
    }

    fn flush_delay(&self, direction: TextDirection) -> Duration {
        match direction {
            TextDirection::User => self.user_flush_delay,
            TextDirection::Ai => self.ai_flush_delay,
        }
    }

    /// Accept one fragment. Final fragments flush synchronously; otherwise
    /// the direction's debounce timer is restarted. Must run inside a tokio
    /// runtime.
    pub fn handle_fragment(&self, direction: TextDirection, text: &str, is_final: bool) {
        let slot_arc = self.slot(direction);
        {
            let mut slot = slot_arc.lock().unwrap();
            slot.buffer.push_str(text);
            slot.buffer.push(' ');
            slot.cancel_timer();
            slot.generation += 1;

            if !is_final {
                let generation = slot.generation;
                let delay = self.flush_delay(direction);
                let session = self.session.clone();
                let task_slot = slot_arc.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let current = task_slot.lock().unwrap().generation == generation;
                    if current {
                        flush_slot(&task_slot, &session, direction);
                    } else {
                        debug!("Stale {:?} flush timer ignored", direction);
                    }
                });
                slot.timer = Some(task.abort_handle());
                return;
            }
        }

        flush_slot(slot_arc, &self.session, direction);
    }

    /// Commit the direction's buffer as one turn, if it holds anything
    /// after trimming. Always safe to call; clears any pending timer.
    pub fn flush(&self, direction: TextDirection) {
        flush_slot(self.slot(direction), &self.session, direction);
    }

    /// Force both directions out, e.g. at call end or channel loss.
    pub fn flush_all(&self) {
        self.flush(TextDirection::User);
        self.flush(TextDirection::Ai);
    }

    /// Drop a partially accumulated utterance without committing it.
    /// Used for the AI buffer when playback is interrupted mid-utterance.
    pub fn discard_partial(&self, direction: TextDirection) {
        let mut slot = self.slot(direction).lock().unwrap();
        slot.cancel_timer();
        slot.generation += 1;
        if !slot.buffer.trim().is_empty() {
            debug!(
                "Discarding partial {:?} buffer ({} chars)",
                direction,
                slot.buffer.len()
            );
        }
        slot.buffer.clear();
    }

    /// Typed messages have no fragmentation concern; commit immediately.
    pub fn handle_typed(&self, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        self.session
            .add_turn(Speaker::UserTyped, trimmed, TurnType::Message);
    }
}

fn flush_slot(
    slot: &Mutex<DirectionBuffer>,
    session: &SessionManager,
    direction: TextDirection,
) {
    let pending = {
        let mut slot = slot.lock().unwrap();
        slot.cancel_timer();
        slot.generation += 1;
        std::mem::take(&mut slot.buffer)
    };

    let trimmed = pending.trim();
    if trimmed.is_empty() {
        return;
    }

    match direction {
        TextDirection::User => {
            debug!("Flushing user transcription: {:?}", trimmed);
            session.add_turn(Speaker::UserSpoken, trimmed, TurnType::Message);
        }
        TextDirection::Ai => {
            let cleaned = sanitize_spoken_text(trimmed);
            if cleaned.is_empty() {
                debug!("AI buffer held only decorative symbols, nothing to commit");
                return;
            }
            debug!("Flushing AI spoken text: {:?}", cleaned);
            session.add_turn(Speaker::AiSpoken, &cleaned, TurnType::Message);
        }
    }
}
