use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, StatusCode};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::config::PortalConfig;
use crate::error::PortalError;
use crate::models::{redact, Credential, GradeRecord, GradeSnapshot, SessionToken};

/// The university portal as seen by the authenticator and the monitor.
#[async_trait]
pub trait Portal: Send {
    fn origin(&self) -> &Url;

    /// Page the human should open to log in.
    fn login_url(&self) -> Url;

    /// Replaces the live session with the given tokens.
    fn apply(&mut self, credential: &Credential) -> Result<(), PortalError>;

    /// Checks the authenticated-only signal. `Ok(false)` means "not logged in".
    async fn probe(&mut self) -> Result<bool, PortalError>;

    /// Current session tokens, if the live session holds any.
    fn capture(&self) -> Option<Credential>;

    async fn fetch_grades(&mut self) -> Result<GradeSnapshot, PortalError>;

    async fn download_transcript(&mut self, dir: &Path) -> Result<PathBuf, PortalError>;
}

/// Cookie-jar HTTP client against the portal.
pub struct HttpPortal {
    config: PortalConfig,
    jar: Arc<Jar>,
    client: Client,
}

impl HttpPortal {
    pub fn new(config: PortalConfig) -> Result<Self, PortalError> {
        let jar = Arc::new(Jar::default());
        let client = build_client(&config, Arc::clone(&jar))?;
        Ok(Self { config, jar, client })
    }

    fn session_urls(&self) -> Vec<&Url> {
        let mut urls = vec![&self.config.base_url, &self.config.grades_url];
        urls.extend(self.config.transcript_url.as_ref());
        urls
    }

    async fn get_page(&self, url: &Url) -> Result<(Url, StatusCode, String), PortalError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| http_error(url, e))?;
        let final_url = response.url().clone();
        let status = response.status();
        let body = response.text().await.map_err(|e| http_error(url, e))?;

        if !self.config.settle.is_zero() {
            tokio::time::sleep(self.config.settle).await;
        }
        Ok((final_url, status, body))
    }
}

fn build_client(config: &PortalConfig, jar: Arc<Jar>) -> Result<Client, PortalError> {
    Client::builder()
        .cookie_provider(jar)
        .user_agent(config.browser.user_agent())
        .timeout(config.request_timeout)
        .build()
        .map_err(|e| PortalError::Other(format!("failed to build the client: {e}")))
}

fn http_error(url: &Url, source: reqwest::Error) -> PortalError {
    PortalError::Http {
        url: url.to_string(),
        source,
    }
}

fn looks_like_login(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.contains("login") || path.contains("/cas/") || path.contains("authserver")
}

#[async_trait]
impl Portal for HttpPortal {
    fn origin(&self) -> &Url {
        &self.config.base_url
    }

    fn login_url(&self) -> Url {
        self.config.base_url.clone()
    }

    fn apply(&mut self, credential: &Credential) -> Result<(), PortalError> {
        if credential.origin.origin() != self.config.base_url.origin() {
            return Err(PortalError::Other(format!(
                "credential belongs to {}, not {}",
                credential.origin, self.config.base_url
            )));
        }

        let jar = Arc::new(Jar::default());
        for token in &credential.tokens {
            debug!("Applying cookie {} = {}", token.name, redact(&token.value));
            for url in self.session_urls() {
                // Tokens captured from one host must not shadow a same-named token of another.
                if token.host.as_deref().is_some_and(|host| url.host_str() != Some(host)) {
                    continue;
                }
                jar.add_cookie_str(&format!("{}={}; Path=/", token.name, token.value), url);
            }
        }
        self.client = build_client(&self.config, Arc::clone(&jar))?;
        self.jar = jar;
        Ok(())
    }

    async fn probe(&mut self) -> Result<bool, PortalError> {
        let (final_url, status, body) = self.get_page(&self.config.base_url).await?;

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            debug!("Portal answered {status}, session is not authenticated");
            return Ok(false);
        }
        if !status.is_success() {
            return Err(PortalError::Other(format!("portal answered {status} for {final_url}")));
        }
        if looks_like_login(&final_url) {
            debug!(
                "Redirected to login page {}",
                urlencoding::decode(final_url.as_str()).unwrap_or_default()
            );
            return Ok(false);
        }

        has_marker(&body, &self.config.login_marker)
    }

    fn capture(&self) -> Option<Credential> {
        let mut tokens: Vec<SessionToken> = Vec::new();
        for url in self.session_urls() {
            let Some(header) = self.jar.cookies(url) else {
                continue;
            };
            let Ok(header) = header.to_str() else {
                continue;
            };
            let Some(parsed) = Credential::from_cookie_header(self.config.base_url.clone(), header) else {
                continue;
            };
            for mut token in parsed.tokens {
                token.host = url.host_str().map(str::to_string);
                if !tokens.iter().any(|t| t.name == token.name && t.host == token.host) {
                    tokens.push(token);
                }
            }
        }

        (!tokens.is_empty()).then(|| Credential::new(self.config.base_url.clone(), tokens))
    }

    async fn fetch_grades(&mut self) -> Result<GradeSnapshot, PortalError> {
        let (final_url, status, body) = self.get_page(&self.config.grades_url).await?;
        if !status.is_success() {
            return Err(PortalError::Other(format!("grade page answered {status}")));
        }
        if looks_like_login(&final_url) {
            return Err(PortalError::Other("session expired: redirected to the login page".into()));
        }

        match parse_grade_table(&body, &self.config.table_selector) {
            Ok(snapshot) => {
                info!("Parsed {} grade record(s)", snapshot.len());
                Ok(snapshot)
            }
            Err(e) => {
                let excerpt: String = body.chars().take(2000).collect();
                debug!("Unparseable grade page from {final_url}:\n{excerpt}");
                Err(e)
            }
        }
    }

    async fn download_transcript(&mut self, dir: &Path) -> Result<PathBuf, PortalError> {
        let url = self
            .config
            .transcript_url
            .clone()
            .ok_or_else(|| PortalError::Other("no transcript URL configured (GRADEWATCH_TRANSCRIPT_URL)".into()))?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| http_error(&url, e))?;
        let is_pdf = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("pdf"));
        if !is_pdf {
            warn!("Transcript response is not labelled as PDF, saving it anyway");
        }
        let bytes = response.bytes().await.map_err(|e| http_error(&url, e))?;

        std::fs::create_dir_all(dir)
            .map_err(|e| PortalError::Other(format!("cannot create {}: {e}", dir.display())))?;
        let path = dir.join(format!("transcript-{}.pdf", chrono::Local::now().format("%Y%m%d-%H%M%S")));
        std::fs::write(&path, &bytes)
            .map_err(|e| PortalError::Other(format!("cannot write {}: {e}", path.display())))?;

        info!("Transcript saved to {}", path.display());
        Ok(path)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, PortalError> {
    Selector::parse(selector).map_err(|e| PortalError::Schema(format!("invalid selector {selector:?}: {e:?}")))
}

fn has_marker(html: &str, marker: &str) -> Result<bool, PortalError> {
    let selector = parse_selector(marker)?;
    Ok(Html::parse_document(html).select(&selector).next().is_some())
}

fn cell_text(cell: &ElementRef) -> String {
    static WS: OnceLock<Regex> = OnceLock::new();
    let ws = WS.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace pattern"));
    ws.replace_all(&cell.text().collect::<String>(), " ").trim().to_string()
}

/// Parses the grade table: the first row of `th` cells is the header, rows with one
/// cell per header are grades, single-cell rows are summary lines (term GPA etc.).
pub fn parse_grade_table(html: &str, table_selector: &str) -> Result<GradeSnapshot, PortalError> {
    let document = Html::parse_document(html);
    let table_sel = parse_selector(table_selector)?;
    let tr = Selector::parse("tr").expect("valid selector");
    let th = Selector::parse("th").expect("valid selector");
    let td = Selector::parse("td").expect("valid selector");

    let table = document
        .select(&table_sel)
        .next()
        .ok_or_else(|| PortalError::Schema(format!("no element matches {table_selector:?}")))?;

    let mut rows = table.select(&tr);
    let headers: Vec<String> = rows
        .by_ref()
        .map(|row| row.select(&th).map(|c| cell_text(&c)).collect::<Vec<_>>())
        .find(|cells| !cells.is_empty())
        .ok_or_else(|| PortalError::Schema("grade table has no header row".into()))?;

    let mut records = Vec::new();
    let mut summary = Vec::new();

    for row in rows {
        let cells: Vec<String> = row.select(&td).map(|c| cell_text(&c)).collect();
        if cells.len() == headers.len() {
            match GradeRecord::from_row(&headers, &cells) {
                Some(record) => records.push(record),
                None => debug!("Skipping grade row without a course name: {cells:?}"),
            }
        } else if cells.len() == 1 {
            if !cells[0].is_empty() {
                summary.push(cells[0].clone());
            }
        } else if !cells.is_empty() {
            debug!("Skipping row with {} cells (expected {})", cells.len(), headers.len());
        }
    }

    Ok(GradeSnapshot::new(records, summary))
}
