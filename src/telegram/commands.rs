use super::{InlineButton, Keyboard};
use crate::broker::Broker;
use crate::persistence::PositionReader;
use std::sync::Arc;

const HELP: &str = "Bot is running. Available commands:\n\
/menu - quick actions\n\
/balance - account balance\n\
/profit - today's profit\n\
/txn - today's transactions\n\
/position - current position";

/// Chat commands and menu buttons
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Menu,
    Balance,
    Profit,
    Transactions,
    Position,
    Unknown(String),
}

impl Command {
    /// Parse a chat message; `/cmd@botname` is accepted too
    pub fn parse(text: &str) -> Command {
        let word = text.split_whitespace().next().unwrap_or("");
        let name = word.split('@').next().unwrap_or(word);

        match name {
            "/start" | "/help" => Command::Start,
            "/menu" => Command::Menu,
            "/balance" | "/menu_balance" => Command::Balance,
            "/profit" | "/menu_profit" => Command::Profit,
            "/txn" | "/menu_txn" => Command::Transactions,
            "/position" => Command::Position,
            _ => Command::Unknown(text.trim().to_string()),
        }
    }

    /// Command behind a menu button payload
    pub fn from_menu_callback(data: &str) -> Option<Command> {
        match data {
            "menu_balance" => Some(Command::Balance),
            "menu_profit" => Some(Command::Profit),
            "menu_txn" => Some(Command::Transactions),
            "menu_position" => Some(Command::Position),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    WithKeyboard { text: String, keyboard: Keyboard },
}

impl Reply {
    pub fn text(&self) -> &str {
        match self {
            Reply::Text(text) => text,
            Reply::WithKeyboard { text, .. } => text,
        }
    }
}

/// Answers read-only chat commands; never trades
pub struct CommandHandler {
    instrument_id: String,
    broker: Arc<dyn Broker>,
    positions: Arc<dyn PositionReader>,
}

impl CommandHandler {
    pub fn new(
        instrument_id: impl Into<String>,
        broker: Arc<dyn Broker>,
        positions: Arc<dyn PositionReader>,
    ) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            broker,
            positions,
        }
    }

    pub async fn handle(&self, command: &Command) -> Reply {
        match command {
            Command::Start => Reply::Text(HELP.to_string()),
            Command::Menu => Reply::WithKeyboard {
                text: "Choose an option:".to_string(),
                keyboard: menu_keyboard(),
            },
            Command::Balance => Reply::Text(match self.broker.balance().await {
                Ok(balance) => format!("💰 Balance: {:.2}", balance),
                Err(e) => format!("❌ Failed to get balance: {}", e),
            }),
            Command::Profit => Reply::Text(match self.broker.daily_profit().await {
                Ok(profit) => format!("📊 Profit today: {:.2}", profit),
                Err(e) => format!("❌ Failed to get profit: {}", e),
            }),
            Command::Transactions => Reply::Text(match self.broker.transactions_today().await {
                Ok(count) => format!("📈 Transactions today: {}", count),
                Err(e) => format!("❌ Failed to get transactions: {}", e),
            }),
            Command::Position => Reply::Text(self.position_summary().await),
            Command::Unknown(text) => {
                tracing::debug!("Unknown command {:?}", text);
                Reply::Text("❗ Unknown command. Send /start for the list of commands.".to_string())
            }
        }
    }

    async fn position_summary(&self) -> String {
        let record = self.positions.load().await;
        if !record.held {
            return format!("📭 No open position in {}", self.instrument_id);
        }

        let mut summary = format!(
            "📦 Holding {} (bought at {:.2})",
            self.instrument_id, record.last_buy_price
        );
        match self.broker.held_quantity(&self.instrument_id).await {
            Ok(quantity) => summary.push_str(&format!("\nLots on account: {}", quantity)),
            Err(e) => tracing::warn!("Could not fetch held quantity: {}", e),
        }
        summary
    }
}

fn menu_keyboard() -> Keyboard {
    [
        ("💰 Balance", "menu_balance"),
        ("📊 Profit today", "menu_profit"),
        ("📈 Transactions today", "menu_txn"),
        ("📦 Position", "menu_position"),
    ]
    .into_iter()
    .map(|(text, data)| {
        vec![InlineButton {
            text: text.to_string(),
            callback_data: data.to_string(),
        }]
    })
    .collect()
}
