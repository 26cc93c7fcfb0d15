use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://v.ruc.edu.cn/";
const DEFAULT_GRADES_URL: &str = "https://jw.ruc.edu.cn/Njw2017/index.html#/student/course-score-search/";
const DEFAULT_LOGIN_MARKER: &str = ".user-logo";
const DEFAULT_TABLE_SELECTOR: &str = "table.table-border";
const APP_DIR_NAME: &str = ".ruc-grade-checker";

/// Browser the portal should believe it is talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum BrowserProfile {
    #[default]
    Chrome,
    Edge,
}

impl BrowserProfile {
    pub const fn user_agent(self) -> &'static str {
        match self {
            Self::Chrome => "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
            Self::Edge => "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36 Edg/126.0.0.0",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StorePolicy {
    /// Keep only the latest snapshot.
    #[default]
    Latest,
    /// Append every snapshot to a log.
    History,
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: Url,
    pub grades_url: Url,
    pub transcript_url: Option<Url>,
    /// CSS selector only present on pages of a logged-in session.
    pub login_marker: String,
    pub table_selector: String,
    pub browser: BrowserProfile,
    /// Pause after each page load, for slow portal redirects.
    pub settle: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: i64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub portal: PortalConfig,
    pub store_policy: StorePolicy,
    pub send_key: Option<String>,
    pub telegram: Option<TelegramConfig>,
    pub check_interval: Duration,
    pub jitter: Duration,
    pub poll_interval: Duration,
    /// `None` waits for the interactive login forever.
    pub login_timeout: Option<Duration>,
}

impl Config {
    /// Reads the configuration from the process environment (after `.env` was loaded).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let url = |key: &str, default: &str| -> Result<Url> {
            let raw = get(key).unwrap_or_else(|| default.to_string());
            Url::parse(&raw).with_context(|| format!("{key} is not a valid URL: {raw}"))
        };
        let seconds = |key: &str, default: u64| -> Result<Duration> {
            match get(key) {
                Some(raw) => raw
                    .parse()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{key} must be a whole number of seconds, got {raw}")),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let data_dir = match get("GRADEWATCH_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .map(|home| home.join(APP_DIR_NAME))
                .unwrap_or_else(|| PathBuf::from(APP_DIR_NAME)),
        };

        let transcript_url = get("GRADEWATCH_TRANSCRIPT_URL")
            .map(|raw| Url::parse(&raw).with_context(|| format!("GRADEWATCH_TRANSCRIPT_URL is not a valid URL: {raw}")))
            .transpose()?;

        let browser = match get("GRADEWATCH_BROWSER") {
            Some(raw) => BrowserProfile::from_str(&raw, true)
                .map_err(|e| anyhow::anyhow!("GRADEWATCH_BROWSER: {e}"))?,
            None => BrowserProfile::default(),
        };

        let telegram = match (get("BOT_TOKEN"), get("CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramConfig {
                bot_token,
                chat_id: chat_id
                    .parse()
                    .with_context(|| format!("CHAT_ID must be numeric, got {chat_id}"))?,
            }),
            (Some(_), None) | (None, Some(_)) => {
                anyhow::bail!("BOT_TOKEN and CHAT_ID must be set together")
            }
            (None, None) => None,
        };

        let check_minutes: u64 = match get("CHECK_INTERVAL") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("CHECK_INTERVAL must be a number of minutes, got {raw}"))?,
            None => 30,
        };
        let check_interval = check_interval(check_minutes).context("CHECK_INTERVAL")?;

        let login_timeout = seconds("GRADEWATCH_LOGIN_TIMEOUT_SECS", 600)?;

        Ok(Self {
            data_dir,
            portal: PortalConfig {
                base_url: url("GRADEWATCH_BASE_URL", DEFAULT_BASE_URL)?,
                grades_url: url("GRADEWATCH_GRADES_URL", DEFAULT_GRADES_URL)?,
                transcript_url,
                login_marker: get("GRADEWATCH_LOGIN_MARKER").unwrap_or_else(|| DEFAULT_LOGIN_MARKER.into()),
                table_selector: get("GRADEWATCH_TABLE_SELECTOR").unwrap_or_else(|| DEFAULT_TABLE_SELECTOR.into()),
                browser,
                settle: seconds("GRADEWATCH_WAIT_SECS", 2)?,
                request_timeout: seconds("GRADEWATCH_TIMEOUT_SECS", 30)?,
            },
            store_policy: match get("GRADEWATCH_STORE") {
                Some(raw) => StorePolicy::from_str(&raw, true)
                    .map_err(|e| anyhow::anyhow!("GRADEWATCH_STORE: {e}"))?,
                None => StorePolicy::default(),
            },
            send_key: get("SEND_KEY"),
            telegram,
            check_interval,
            jitter: seconds("GRADEWATCH_JITTER_SECS", 0)?,
            poll_interval: seconds("GRADEWATCH_POLL_SECS", 1)?,
            login_timeout: (!login_timeout.is_zero()).then_some(login_timeout),
        })
    }

    pub fn credential_path(&self) -> PathBuf {
        self.data_dir.join("cookies.json")
    }

    pub fn grades_path(&self) -> PathBuf {
        match self.store_policy {
            StorePolicy::Latest => self.data_dir.join("grades.json"),
            StorePolicy::History => self.data_dir.join("grades.jsonl"),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("gradewatch.log")
    }
}

/// Converts a check interval given in minutes.
pub fn check_interval(minutes: u64) -> Result<Duration> {
    if minutes == 0 {
        anyhow::bail!("the check interval must be at least 1 minute");
    }
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .with_context(|| format!("{minutes} minutes is too long a check interval"))
}
