use async_trait::async_trait;
use log::{info, warn};

use crate::config::Config;
use crate::error::WatchError;
use crate::models::{ChangeKind, ChangeSet};
use crate::utils::serverchan::ServerChan;
use crate::utils::telegram::Telegram;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

/// A push channel. Failures are reported, never retried here: the monitor keeps
/// the old baseline so the next cycle detects the same change again.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<(), WatchError>;
}

fn or_dash(value: Option<&str>) -> &str {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => "-",
    }
}

/// Builds the message for a change set, listing course, teacher, result and grade point.
pub fn format_changes(changes: &ChangeSet) -> Notification {
    let (title, mut body) = if changes.bootstrap {
        (
            "成绩监控已启动".to_string(),
            format!("首次运行，当前共有 {} 门课程成绩：\n\n", changes.len()),
        )
    } else {
        ("新成绩通知".to_string(), "成绩更新通知：\n\n".to_string())
    };

    for change in &changes.changes {
        let record = &change.record;
        body.push_str(&format!("课程：{}\n", record.course));
        body.push_str(&format!("教师：{}\n", or_dash(record.teacher.as_deref())));
        match &change.kind {
            ChangeKind::Changed { previous } => body.push_str(&format!(
                "成绩：{}（原成绩：{}）\n",
                record.result_text(),
                or_dash(previous.as_deref())
            )),
            ChangeKind::New => body.push_str(&format!("成绩：{}\n", record.result_text())),
        }
        body.push_str(&format!("绩点：{}\n", or_dash(record.grade_point.as_deref())));
        body.push_str("-------------------\n");
    }

    Notification { title, body }
}

/// Writes notifications to the log only; used when no push channel is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<(), WatchError> {
        info!("{}\n{}", notification.title, notification.body);
        Ok(())
    }
}

/// Every configured channel. The send succeeds only if all channels accepted it.
pub struct NotifierSet {
    channels: Vec<Box<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new(channels: Vec<Box<dyn Notifier>>) -> Self {
        Self { channels }
    }

    pub fn from_config(config: &Config) -> Result<Self, WatchError> {
        let mut channels: Vec<Box<dyn Notifier>> = Vec::new();
        if let Some(send_key) = &config.send_key {
            channels.push(Box::new(ServerChan::new(send_key)?));
        }
        if let Some(telegram) = &config.telegram {
            channels.push(Box::new(Telegram::new(&telegram.bot_token, telegram.chat_id)));
        }
        if channels.is_empty() {
            warn!("No notification channel configured (SEND_KEY or BOT_TOKEN/CHAT_ID), logging only");
            channels.push(Box::new(LogNotifier));
        }
        Ok(Self::new(channels))
    }

    pub fn names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }
}

#[async_trait]
impl Notifier for NotifierSet {
    fn name(&self) -> &str {
        "all"
    }

    async fn send(&self, notification: &Notification) -> Result<(), WatchError> {
        let mut failures = Vec::new();
        for channel in &self.channels {
            match channel.send(notification).await {
                Ok(()) => info!("Notification sent via {}", channel.name()),
                Err(e) => {
                    warn!("Notification via {} failed: {}", channel.name(), e);
                    failures.push(format!("{}: {}", channel.name(), e));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(WatchError::NotifyFailed(failures.join("; ")))
        }
    }
}
