// Outbound chat messages and the human confirmation handshake
pub mod confirmation;

use async_trait::async_trait;
use std::fmt;

pub use confirmation::{ConfirmationError, ConfirmationGateway, Resolution};

/// Chat identity a confirmation is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One selectable answer attached to a prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptButton {
    pub label: String,
    /// Value reported back when the button is pressed
    pub value: String,
}

/// A question sent to a human, answered through buttons
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    /// Echoed back with the answer so stale buttons can be told apart
    pub request_id: u64,
    pub text: String,
    pub buttons: Vec<PromptButton>,
    /// Buttons per keyboard row
    pub columns: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Messaging API error: {0}")]
    Api(String),
}

/// Outbound side of the chat transport
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Plain notification, no answer expected
    async fn send(&self, session: SessionId, text: &str) -> Result<(), MessagingError>;

    /// Message with answer buttons
    async fn send_prompt(&self, session: SessionId, prompt: &Prompt) -> Result<(), MessagingError>;
}

/// Callback payload for a prompt answer: `c:{request_id}:{value}`
pub fn encode_answer(request_id: u64, value: &str) -> String {
    format!("c:{}:{}", request_id, value)
}

/// Inverse of [`encode_answer`]
pub fn decode_answer(data: &str) -> Option<(u64, &str)> {
    let rest = data.strip_prefix("c:")?;
    let (id, value) = rest.split_once(':')?;
    Some((id.parse().ok()?, value))
}
