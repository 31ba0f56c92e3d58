use super::{CallbackQuery, Command, CommandHandler, Message, Reply, TelegramClient, Update};
use crate::messaging::{decode_answer, ConfirmationGateway, Resolution, SessionId};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Long-polls the Bot API and dispatches updates
///
/// Confirmation answers go to the gateway inline; commands run on their own
/// task so a slow broker query never holds up a pending confirmation. Only
/// the configured chat is served.
pub struct UpdateListener {
    client: TelegramClient,
    chat_id: i64,
    long_poll_secs: u64,
    handler: Arc<CommandHandler>,
    gateway: Arc<ConfirmationGateway>,
    offset: i64,
}

impl UpdateListener {
    pub fn new(
        client: TelegramClient,
        chat_id: i64,
        long_poll_secs: u64,
        handler: CommandHandler,
        gateway: Arc<ConfirmationGateway>,
    ) -> Self {
        Self {
            client,
            chat_id,
            long_poll_secs,
            handler: Arc::new(handler),
            gateway,
            offset: 0,
        }
    }

    /// Poll until `shutdown` resolves
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        self.skip_backlog().await;
        tracing::info!("📨 Telegram listener started for chat {}", self.chat_id);

        loop {
            let polled = tokio::select! {
                polled = self.client.get_updates(self.offset, self.long_poll_secs) => polled,
                _ = &mut shutdown => break,
            };

            match polled {
                Ok(updates) => {
                    for update in updates {
                        self.offset = self.offset.max(update.update_id + 1);
                        // Command tasks finish on their own
                        let _ = self.handle_update(update).await;
                    }
                }
                Err(e) => {
                    tracing::warn!("getUpdates failed: {}. Retrying in {:?}", e, ERROR_BACKOFF);
                    tokio::select! {
                        _ = sleep(ERROR_BACKOFF) => {}
                        _ = &mut shutdown => break,
                    }
                }
            }
        }

        tracing::info!("Telegram listener stopped");
    }

    /// Drop updates queued while the bot was offline; old button presses
    /// must not answer new prompts.
    async fn skip_backlog(&mut self) {
        match self.client.get_updates(-1, 0).await {
            Ok(updates) => {
                if let Some(last) = updates.last() {
                    self.offset = last.update_id + 1;
                    tracing::info!("Skipped pending updates up to {}", last.update_id);
                }
            }
            Err(e) => tracing::warn!("Could not skip pending updates: {}", e),
        }
    }

    /// Dispatch one update; returns the task running a command, if any
    pub async fn handle_update(&self, update: Update) -> Option<JoinHandle<()>> {
        if let Some(callback) = update.callback_query {
            self.handle_callback(callback).await
        } else if let Some(message) = update.message {
            self.handle_message(message)
        } else {
            None
        }
    }

    fn handle_message(&self, message: Message) -> Option<JoinHandle<()>> {
        if message.chat.id != self.chat_id {
            tracing::warn!("Ignoring message from unauthorized chat {}", message.chat.id);
            return None;
        }
        let text = message.text?;

        let command = Command::parse(&text);
        tracing::debug!("Command {:?}", command);
        Some(self.spawn_command(command))
    }

    async fn handle_callback(&self, callback: CallbackQuery) -> Option<JoinHandle<()>> {
        let chat_id = callback.message.as_ref().map(|m| m.chat.id)?;
        if chat_id != self.chat_id {
            tracing::warn!("Ignoring callback from unauthorized chat {}", chat_id);
            return None;
        }

        let data = callback.data.unwrap_or_default();

        if let Some((request_id, value)) = decode_answer(&data) {
            match self.gateway.resolve(SessionId(chat_id), request_id, value) {
                Resolution::Accepted => tracing::info!("Answer {:?} accepted for request {}", value, request_id),
                Resolution::Ignored => tracing::debug!("Answer for request {} ignored", request_id),
            }
            self.acknowledge(&callback.id).await;
            return None;
        }

        self.acknowledge(&callback.id).await;
        match Command::from_menu_callback(&data) {
            Some(command) => Some(self.spawn_command(command)),
            None => {
                tracing::debug!("Unknown callback data {:?}", data);
                None
            }
        }
    }

    /// Stops the client-side spinner on the pressed button
    async fn acknowledge(&self, callback_id: &str) {
        if let Err(e) = self.client.answer_callback_query(callback_id).await {
            tracing::debug!("answerCallbackQuery failed: {}", e);
        }
    }

    fn spawn_command(&self, command: Command) -> JoinHandle<()> {
        let handler = self.handler.clone();
        let client = self.client.clone();
        let chat_id = self.chat_id;

        tokio::spawn(async move {
            let reply = handler.handle(&command).await;
            send_reply(&client, chat_id, reply).await;
        })
    }
}

async fn send_reply(client: &TelegramClient, chat_id: i64, reply: Reply) {
    let result = match reply {
        Reply::Text(text) => client.send_message(chat_id, &text, None).await,
        Reply::WithKeyboard { text, keyboard } => {
            client.send_message(chat_id, &text, Some(keyboard)).await
        }
    };
    if let Err(e) = result {
        tracing::warn!("Failed to send reply: {}", e);
    }
}
