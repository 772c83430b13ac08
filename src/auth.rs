use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::EodmsError;
use crate::transport::{
    ApiRequest, ApiResponse, SessionToken, Transport, decode_json, is_maintenance_page,
};

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Asks the user for fresh credentials after a rejection.
pub trait CredentialPrompt: Send + Sync {
    fn prompt(&self, username: Option<&str>) -> Result<Credentials, EodmsError>;
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

pub(crate) fn retriable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

fn is_auth_status(status: u16) -> bool {
    matches!(status, 401 | 403)
}

/// A login answered with 5xx, 408 or 429 is retried like a dropped connection.
fn retriable_login_failure(err: &EodmsError) -> bool {
    match err {
        EodmsError::Status { status, .. } => retriable_status(*status),
        err => err.is_transient(),
    }
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub token: SessionToken,
    /// Bumped on every (re-)authentication.
    pub generation: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Authenticated access to EODMS, shared by every component of a session.
///
/// The session is established lazily and cached. A 401/403 reply triggers one
/// re-authentication; concurrent callers that hit the same stale session wait
/// for that single refresh instead of logging in themselves.
pub struct AuthSession<T: Transport> {
    transport: T,
    credentials: Mutex<Credentials>,
    prompt: Option<Box<dyn CredentialPrompt>>,
    handle: RwLock<Option<SessionHandle>>,
    reauth: Mutex<()>,
    generation: AtomicU64,
    reauthentications: AtomicUsize,
    retry: RetryPolicy,
}

impl<T: Transport> AuthSession<T> {
    pub fn new(transport: T, credentials: Credentials) -> Self {
        Self {
            transport,
            credentials: Mutex::new(credentials),
            prompt: None,
            handle: RwLock::new(None),
            reauth: Mutex::new(()),
            generation: AtomicU64::new(0),
            reauthentications: AtomicUsize::new(0),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_prompt(mut self, prompt: Box<dyn CredentialPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn username(&self) -> String {
        lock(&self.credentials).username.clone()
    }

    /// Number of times a rejected session was replaced.
    pub fn reauthentications(&self) -> usize {
        self.reauthentications.load(Ordering::SeqCst)
    }

    fn current(&self) -> Option<SessionHandle> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install(&self, token: SessionToken) -> SessionHandle {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = SessionHandle { token, generation };
        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        handle
    }

    fn invalidate(&self) {
        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Returns the cached session, logging in first if there is none.
    pub fn authenticate(&self) -> Result<SessionHandle, EodmsError> {
        if let Some(handle) = self.current() {
            return Ok(handle);
        }
        let _guard = lock(&self.reauth);
        if let Some(handle) = self.current() {
            return Ok(handle);
        }
        self.establish()
    }

    /// Caller holds `reauth`. On rejection the prompt, if any, gets one chance.
    fn establish(&self) -> Result<SessionHandle, EodmsError> {
        let credentials = lock(&self.credentials).clone();
        let token = match self.login_with_retries(&credentials) {
            Ok(token) => token,
            Err(err) if err.is_auth() => {
                let Some(prompt) = &self.prompt else {
                    return Err(err);
                };
                warn!(username = %credentials.username, "EODMS rejected credentials; prompting again");
                let fresh = prompt.prompt(Some(&credentials.username))?;
                let token = self.login_with_retries(&fresh)?;
                *lock(&self.credentials) = fresh;
                token
            }
            Err(err) => return Err(err),
        };
        info!(username = %credentials.username, "authenticated with EODMS");
        Ok(self.install(token))
    }

    fn reauthenticate(&self, stale_generation: u64) -> Result<SessionHandle, EodmsError> {
        let _guard = lock(&self.reauth);
        if let Some(handle) = self.current() {
            if handle.generation != stale_generation {
                debug!(generation = handle.generation, "session already refreshed");
                return Ok(handle);
            }
        }
        self.invalidate();
        let handle = self.establish()?;
        self.reauthentications.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn login_with_retries(&self, credentials: &Credentials) -> Result<SessionToken, EodmsError> {
        let mut attempt = 1usize;
        loop {
            match self.transport.login(credentials) {
                Ok(token) => return Ok(token),
                Err(err) if retriable_login_failure(&err) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(EodmsError::TransientService {
                            attempts: attempt,
                            message: err.to_string(),
                        });
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(attempt, ?delay, error = %err, "EODMS login failed; retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn send_with_retries(
        &self,
        token: &SessionToken,
        request: &ApiRequest,
    ) -> Result<ApiResponse, EodmsError> {
        let mut attempt = 1usize;
        loop {
            let failure = match self.transport.send(token, request) {
                Ok(response) if retriable_status(response.status) => {
                    format!("HTTP {} from {}", response.status, request.url)
                }
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() => err.to_string(),
                Err(err) => return Err(err),
            };
            if attempt >= self.retry.max_attempts {
                return Err(EodmsError::TransientService {
                    attempts: attempt,
                    message: failure,
                });
            }
            let delay = self.retry.delay_for(attempt);
            warn!(attempt, ?delay, %failure, "transient EODMS failure; retrying");
            thread::sleep(delay);
            attempt += 1;
        }
    }

    /// Performs one request on the shared session. Transient failures are
    /// retried with backoff; an auth rejection re-authenticates exactly once.
    pub fn request(&self, request: &ApiRequest) -> Result<ApiResponse, EodmsError> {
        let handle = self.authenticate()?;
        let response = self.send_with_retries(&handle.token, request)?;
        if !is_auth_status(response.status) {
            return Ok(response);
        }
        debug!(url = %request.url, status = response.status, "session rejected; re-authenticating");
        let refreshed = self.reauthenticate(handle.generation)?;
        let response = self.send_with_retries(&refreshed.token, request)?;
        if is_auth_status(response.status) {
            return Err(EodmsError::Auth(format!(
                "{} still rejected after re-authentication (HTTP {})",
                request.url, response.status
            )));
        }
        Ok(response)
    }

    /// `request` plus JSON decoding. The maintenance page counts as a
    /// transient failure and shares the same retry budget.
    pub fn request_json<R: DeserializeOwned>(&self, request: &ApiRequest) -> Result<R, EodmsError> {
        let mut attempt = 1usize;
        loop {
            let text = self.request(request)?.ensure_success()?.text()?;
            if !is_maintenance_page(&text) {
                return decode_json(&text);
            }
            if attempt >= self.retry.max_attempts {
                return Err(EodmsError::TransientService {
                    attempts: attempt,
                    message: "EODMS is down for maintenance".to_string(),
                });
            }
            let delay = self.retry.delay_for(attempt);
            warn!(attempt, ?delay, "EODMS maintenance page received; retrying");
            thread::sleep(delay);
            attempt += 1;
        }
    }
}
