use std::io::Write;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use url::Url;

use crate::error::WatchError;
use crate::models::Credential;
use crate::session_store::SessionStore;
use crate::utils::portal::Portal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    NoCredential,
    ValidatingCredential,
    InteractiveAuthRequired,
    Authenticated,
    Failed,
    TimedOut,
}

/// Whoever completes a login the program cannot do by itself.
#[async_trait]
pub trait LoginPrompt: Send {
    /// Blocks until the human says the login is done. May hand back the session
    /// tokens they copied from their browser.
    async fn request_login(&mut self, login_url: &Url) -> Option<Credential>;

    /// `false` when nobody is there to answer, so waiting is pointless.
    fn is_attended(&self) -> bool {
        true
    }
}

/// Opens the login page and asks for the browser's `Cookie` header on stdin.
pub struct StdinPrompt;

#[async_trait]
impl LoginPrompt for StdinPrompt {
    async fn request_login(&mut self, login_url: &Url) -> Option<Credential> {
        if let Err(e) = open::that(login_url.as_str()) {
            warn!("Failed to open a browser: {e}");
        }
        eprintln!("Log in at {login_url} in your browser.");
        eprintln!("Then paste the Cookie header of an authenticated request and press Enter:");
        let _ = std::io::stderr().flush();

        let origin = login_url.clone();
        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await;

        match line {
            Ok(Ok(line)) => Credential::from_cookie_header(origin, line.trim()),
            Ok(Err(e)) => {
                warn!("Failed to read from stdin: {e}");
                None
            }
            Err(e) => {
                warn!("Prompt task failed: {e}");
                None
            }
        }
    }
}

/// Used by the scheduler when nobody watches the terminal.
pub struct UnattendedPrompt;

#[async_trait]
impl LoginPrompt for UnattendedPrompt {
    async fn request_login(&mut self, login_url: &Url) -> Option<Credential> {
        error!("Saved session is missing or expired; run `gradewatch show` to log in at {login_url}");
        None
    }

    fn is_attended(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AuthSettings {
    pub poll_interval: Duration,
    pub login_timeout: Option<Duration>,
    /// Portal checks after each answer before the prompt asks again.
    pub polls_per_login: u32,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            login_timeout: Some(Duration::from_secs(600)),
            polls_per_login: 5,
        }
    }
}

/// Turns a saved credential into a live portal session, falling back to an
/// interactive login when the credential is missing or the portal rejects it.
pub struct Authenticator {
    store: SessionStore,
    settings: AuthSettings,
    history: Vec<AuthState>,
}

impl Authenticator {
    pub fn new(store: SessionStore, settings: AuthSettings) -> Self {
        Self {
            store,
            settings,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> Option<AuthState> {
        self.history.last().copied()
    }

    /// States visited by the last `ensure_session` call.
    pub fn history(&self) -> &[AuthState] {
        &self.history
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn enter(&mut self, state: AuthState) {
        debug!("auth: {:?} -> {:?}", self.state(), state);
        self.history.push(state);
    }

    pub async fn ensure_session<P, L>(&mut self, portal: &mut P, prompt: &mut L) -> Result<(), WatchError>
    where
        P: Portal + ?Sized,
        L: LoginPrompt + ?Sized,
    {
        self.history.clear();
        self.enter(AuthState::NoCredential);

        let cached = self.store.load().filter(|credential| {
            let same_origin = credential.origin.origin() == portal.origin().origin();
            if !same_origin {
                warn!(
                    "Saved session belongs to {}, not {}; ignoring it",
                    credential.origin,
                    portal.origin()
                );
            }
            same_origin
        });

        if let Some(credential) = cached {
            self.enter(AuthState::ValidatingCredential);
            let valid = match portal.apply(&credential) {
                Ok(()) => portal.probe().await,
                Err(e) => Err(e),
            };
            match valid {
                Ok(true) => {
                    info!("Saved session is still valid");
                    self.enter(AuthState::Authenticated);
                    return Ok(());
                }
                Ok(false) => info!("Saved session was rejected by the portal"),
                Err(e) => {
                    self.enter(AuthState::Failed);
                    return Err(WatchError::FetchFailed(format!("validating saved session: {e}")));
                }
            }
        } else {
            info!("No saved session, a login is required");
        }

        self.enter(AuthState::InteractiveAuthRequired);
        match self.interactive(portal, prompt).await {
            Ok(()) => {
                self.enter(AuthState::Authenticated);
                Ok(())
            }
            Err(e @ WatchError::LoginTimedOut(_)) => {
                error!("{e}");
                self.enter(AuthState::TimedOut);
                Err(e)
            }
            Err(e @ WatchError::CredentialUnavailable) => Err(e),
            Err(e) => {
                self.enter(AuthState::Failed);
                Err(e)
            }
        }
    }

    async fn interactive<P, L>(&mut self, portal: &mut P, prompt: &mut L) -> Result<(), WatchError>
    where
        P: Portal + ?Sized,
        L: LoginPrompt + ?Sized,
    {
        let started = Instant::now();
        let login_url = portal.login_url();

        loop {
            match prompt.request_login(&login_url).await {
                Some(credential) => portal
                    .apply(&credential)
                    .map_err(|e| WatchError::AuthenticationFailed(e.to_string()))?,
                None if !prompt.is_attended() => return Err(WatchError::CredentialUnavailable),
                None => {}
            }

            if self.wait_for_login(portal, started).await? {
                break;
            }
            warn!("The portal still rejects the session; asking again");
        }

        info!("Login detected");
        match portal.capture() {
            Some(credential) => {
                if let Err(e) = self.store.save(&credential) {
                    error!("Logged in, but the session could not be saved: {e}");
                }
            }
            None => warn!("Logged in, but the portal session holds no tokens to save"),
        }
        Ok(())
    }

    /// Polls the portal for one answer's worth of attempts. The portal may still be
    /// redirecting after the login, so a single rejection is not final.
    async fn wait_for_login<P>(&self, portal: &mut P, started: Instant) -> Result<bool, WatchError>
    where
        P: Portal + ?Sized,
    {
        for _ in 0..self.settings.polls_per_login.max(1) {
            match portal.probe().await {
                Ok(true) => return Ok(true),
                Ok(false) => debug!("Login not detected yet"),
                Err(e) => warn!("Portal check failed while waiting for login: {e}"),
            }
            if let Some(timeout) = self.settings.login_timeout {
                if started.elapsed() >= timeout {
                    return Err(WatchError::LoginTimedOut(timeout));
                }
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
        Ok(false)
    }
}
