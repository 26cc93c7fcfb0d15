use async_trait::async_trait;
use teloxide::prelude::{ChatId, Requester};
use teloxide::Bot;

use crate::error::WatchError;
use crate::notifier::{Notification, Notifier};

// Telegram counts message length in UTF-16 code units.
const MAX_MESSAGE_UNITS: usize = 4096;

/// Sends the notification as a plain text message to one chat.
pub struct Telegram {
    bot: Bot,
    chat_id: ChatId,
}

impl Telegram {
    pub fn new(bot_token: &str, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(bot_token),
            chat_id: ChatId(chat_id),
        }
    }
}

fn render(notification: &Notification) -> String {
    let text = format!("📚 {} 📚\n\n{}", notification.title, notification.body);
    if text.encode_utf16().count() <= MAX_MESSAGE_UNITS {
        return text;
    }

    // Room for the trailing ellipsis, which is one unit.
    let budget = MAX_MESSAGE_UNITS - 1;
    let mut used = 0;
    let mut cut: String = text
        .chars()
        .take_while(|c| {
            used += c.len_utf16();
            used <= budget
        })
        .collect();
    cut.push('…');
    cut
}

#[async_trait]
impl Notifier for Telegram {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, notification: &Notification) -> Result<(), WatchError> {
        let message = self
            .bot
            .send_message(self.chat_id, render(notification))
            .await
            .map_err(|e| WatchError::NotifyFailed(e.to_string()))?;
        log::debug!("Telegram message {:?} delivered", message.id);
        Ok(())
    }
}
