// Telegram Bot API transport: outbound messages, inline keyboards, update polling
pub mod commands;
pub mod listener;

use crate::config::TelegramConfig;
use crate::messaging::{encode_answer, Messenger, MessagingError, Prompt, SessionId};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub use commands::{Command, CommandHandler, Reply};
pub use listener::UpdateListener;

/// Response envelope every Bot API method uses
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

/// Rows of inline buttons
pub type Keyboard = Vec<Vec<InlineButton>>;

#[derive(Clone)]
pub struct TelegramClient {
    client: Client,
    base_url: String,
    token: String,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> anyhow::Result<Self> {
        // Long polls hold the connection open; leave headroom over the poll timeout
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.long_poll_secs + 15))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    async fn call<B, R>(&self, method: &str, body: &B) -> Result<R, MessagingError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/bot{}/{}", self.base_url, self.token, method);

        let response: ApiResponse<R> = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(redacted)?
            .json()
            .await
            .map_err(redacted)?;

        match response.result {
            Some(result) if response.ok => Ok(result),
            _ => Err(MessagingError::Api(format!(
                "{} failed: {}",
                method,
                if response.description.is_empty() {
                    "no description"
                } else {
                    response.description.as_str()
                }
            ))),
        }
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<(), MessagingError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(keyboard) = keyboard {
            body["reply_markup"] = json!({ "inline_keyboard": keyboard });
        }

        let _: Message = self.call("sendMessage", &body).await?;
        Ok(())
    }

    /// Long poll for updates after `offset`
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, MessagingError> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await
    }

    /// Stop the button's loading spinner
    pub async fn answer_callback_query(&self, callback_id: &str) -> Result<(), MessagingError> {
        let _: bool = self
            .call("answerCallbackQuery", &json!({ "callback_query_id": callback_id }))
            .await?;
        Ok(())
    }
}

/// Lay out a prompt's buttons, encoding the request id into each payload
pub fn prompt_keyboard(prompt: &Prompt) -> Keyboard {
    prompt
        .buttons
        .chunks(prompt.columns.max(1))
        .map(|row| {
            row.iter()
                .map(|button| InlineButton {
                    text: button.label.clone(),
                    callback_data: encode_answer(prompt.request_id, &button.value),
                })
                .collect()
        })
        .collect()
}

#[async_trait]
impl Messenger for TelegramClient {
    async fn send(&self, session: SessionId, text: &str) -> Result<(), MessagingError> {
        self.send_message(session.0, text, None).await
    }

    async fn send_prompt(&self, session: SessionId, prompt: &Prompt) -> Result<(), MessagingError> {
        self.send_message(session.0, &prompt.text, Some(prompt_keyboard(prompt)))
            .await
    }
}

/// Bot API URLs embed the token, so transport errors drop theirs
fn redacted(e: reqwest::Error) -> MessagingError {
    MessagingError::Http(e.without_url())
}
