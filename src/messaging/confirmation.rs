use super::{Messenger, MessagingError, Prompt, PromptButton, SessionId};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

pub const YES: &str = "yes";
pub const NO: &str = "no";

const CHOICE_COLUMNS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfirmationError {
    #[error("A confirmation is already pending for session {0}")]
    AlreadyPending(SessionId),

    #[error("Failed to deliver prompt: {0}")]
    Delivery(#[from] MessagingError),
}

/// What happened to an inbound answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Matched the pending request and resolved it
    Accepted,
    /// No matching request, wrong request id, unexpected value, or already resolved
    Ignored,
}

struct PendingSlot {
    request_id: u64,
    expected: Vec<String>,
    reply: oneshot::Sender<String>,
}

/// Correlates prompts with human answers, one outstanding request per session
///
/// A second request for a session that already has one pending is rejected
/// with [`ConfirmationError::AlreadyPending`] rather than queued.
pub struct ConfirmationGateway {
    messenger: Arc<dyn Messenger>,
    pending: Mutex<HashMap<SessionId, PendingSlot>>,
    next_request_id: AtomicU64,
}

/// Removes the slot when the asking future finishes or is dropped
struct SlotGuard<'a> {
    gateway: &'a ConfirmationGateway,
    session: SessionId,
    request_id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.gateway.remove_slot(self.session, self.request_id);
    }
}

impl ConfirmationGateway {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self {
            messenger,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Ask a yes/no question. Timeout counts as "no".
    pub async fn ask_yes_no(
        &self,
        session: SessionId,
        text: &str,
        wait: Duration,
    ) -> Result<bool, ConfirmationError> {
        let buttons = vec![
            PromptButton {
                label: "✅ Yes".to_string(),
                value: YES.to_string(),
            },
            PromptButton {
                label: "❌ No".to_string(),
                value: NO.to_string(),
            },
        ];

        let answer = self
            .ask(
                session,
                text,
                buttons,
                2,
                wait,
                "⏱ No answer in time, treating it as a no.",
            )
            .await?;

        Ok(answer.as_deref() == Some(YES))
    }

    /// Ask the human to pick one of `options`. Timeout yields `None`.
    pub async fn ask_choice(
        &self,
        session: SessionId,
        text: &str,
        options: &[String],
        wait: Duration,
    ) -> Result<Option<String>, ConfirmationError> {
        let buttons = options
            .iter()
            .map(|o| PromptButton {
                label: o.clone(),
                value: o.clone(),
            })
            .collect();

        self.ask(
            session,
            text,
            buttons,
            CHOICE_COLUMNS,
            wait,
            "⏱ No selection in time, cancelled.",
        )
        .await
    }

    /// Route an inbound answer to the pending request of `session`
    pub fn resolve(&self, session: SessionId, request_id: u64, value: &str) -> Resolution {
        let mut pending = self.lock_pending();

        let Entry::Occupied(entry) = pending.entry(session) else {
            tracing::debug!("Answer for session {} with nothing pending, ignoring", session);
            return Resolution::Ignored;
        };

        let slot = entry.get();
        if slot.request_id != request_id {
            tracing::debug!(
                "Answer for stale request {} (pending {}), ignoring",
                request_id,
                slot.request_id
            );
            return Resolution::Ignored;
        }
        if !slot.expected.iter().any(|v| v == value) {
            tracing::debug!("Unexpected answer {:?} for request {}, ignoring", value, request_id);
            return Resolution::Ignored;
        }

        let slot = entry.remove();
        match slot.reply.send(value.to_string()) {
            Ok(()) => Resolution::Accepted,
            Err(_) => Resolution::Ignored,
        }
    }

    /// Request id currently awaiting an answer for `session`
    pub fn pending_request(&self, session: SessionId) -> Option<u64> {
        self.lock_pending().get(&session).map(|slot| slot.request_id)
    }

    async fn ask(
        &self,
        session: SessionId,
        text: &str,
        buttons: Vec<PromptButton>,
        columns: usize,
        wait: Duration,
        expired_notice: &str,
    ) -> Result<Option<String>, ConfirmationError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply, mut answer) = oneshot::channel();

        // Register before sending so an instant answer always finds its slot
        {
            let mut pending = self.lock_pending();
            if pending.contains_key(&session) {
                tracing::warn!(
                    "Refusing confirmation for session {}: another one is pending",
                    session
                );
                return Err(ConfirmationError::AlreadyPending(session));
            }
            pending.insert(
                session,
                PendingSlot {
                    request_id,
                    expected: buttons.iter().map(|b| b.value.clone()).collect(),
                    reply,
                },
            );
        }
        let _guard = SlotGuard {
            gateway: self,
            session,
            request_id,
        };

        let prompt = Prompt {
            request_id,
            text: text.to_string(),
            buttons,
            columns,
        };
        self.messenger.send_prompt(session, &prompt).await?;
        tracing::debug!("Prompt {} sent to session {}, waiting {:?}", request_id, session, wait);

        match timeout(wait, &mut answer).await {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                // An answer may have landed between the deadline and now
                if !self.remove_slot(session, request_id) {
                    if let Ok(value) = answer.try_recv() {
                        return Ok(Some(value));
                    }
                }

                tracing::info!("Prompt {} for session {} timed out", request_id, session);
                if let Err(e) = self.messenger.send(session, expired_notice).await {
                    tracing::warn!("Failed to send timeout notice: {}", e);
                }
                Ok(None)
            }
        }
    }

    /// Drop the slot if it still belongs to `request_id`; true if removed
    fn remove_slot(&self, session: SessionId, request_id: u64) -> bool {
        let mut pending = self.lock_pending();
        match pending.entry(session) {
            Entry::Occupied(entry) if entry.get().request_id == request_id => {
                entry.remove();
                true
            }
            _ => false,
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<SessionId, PendingSlot>> {
        // The map is never left half-updated, so a poisoned lock is still usable
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
