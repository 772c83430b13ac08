use std::fmt;
use std::io::{Cursor, Read};
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::auth::Credentials;
use crate::error::EodmsError;

/// Text of the maintenance page the service serves with HTTP 200.
pub const MAINTENANCE_MARKER: &str = "Thanks for your patience";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Ask for the bytes from this offset onwards (`Range: bytes=N-`).
    pub range_from: Option<u64>,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            query: Vec::new(),
            body: None,
            range_from: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            query: Vec::new(),
            body: Some(body),
            range_from: None,
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn range_from(mut self, offset: u64) -> Self {
        self.range_from = (offset > 0).then_some(offset);
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub struct ApiResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    body: Box<dyn Read + Send>,
}

impl ApiResponse {
    pub fn new(status: u16, content_length: Option<u64>, body: Box<dyn Read + Send>) -> Self {
        Self {
            status,
            content_length,
            body,
        }
    }

    pub fn from_bytes(status: u16, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Self::new(
            status,
            Some(bytes.len() as u64),
            Box::new(Cursor::new(bytes)),
        )
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self::from_bytes(status, value.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(mut self) -> Result<String, EodmsError> {
        let mut text = String::new();
        self.body
            .read_to_string(&mut text)
            .map_err(|err| EodmsError::Network(err.to_string()))?;
        Ok(text)
    }

    /// Turns any non-2xx reply into `Status`, carrying the body as the message.
    pub fn ensure_success(self) -> Result<Self, EodmsError> {
        if self.is_success() {
            return Ok(self);
        }
        let status = self.status;
        let message = self
            .text()
            .ok()
            .map(|text| text.trim().chars().take(300).collect::<String>())
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| "EODMS request failed".to_string());
        Err(EodmsError::Status { status, message })
    }

    pub fn into_reader(self) -> Box<dyn Read + Send> {
        self.body
    }
}

impl fmt::Debug for ApiResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

pub fn is_maintenance_page(text: &str) -> bool {
    text.contains(MAINTENANCE_MARKER)
}

pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, EodmsError> {
    serde_json::from_str(text).map_err(|err| {
        let snippet: String = text.trim().chars().take(120).collect();
        EodmsError::Decode(format!("{err} in `{snippet}`"))
    })
}

/// Proof of an authenticated session, attached to every request.
#[derive(Clone, PartialEq, Eq)]
pub enum SessionToken {
    Basic { username: String, password: String },
    Bearer(String),
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionToken::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            SessionToken::Bearer(_) => f.write_str("Bearer(***)"),
        }
    }
}

/// The HTTP seam: everything the client sends to EODMS passes through here.
pub trait Transport: Send + Sync {
    fn login(&self, credentials: &Credentials) -> Result<SessionToken, EodmsError>;
    fn send(&self, token: &SessionToken, request: &ApiRequest) -> Result<ApiResponse, EodmsError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EodmsError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("eodms-client/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| EodmsError::Network(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| EodmsError::Network(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn authorize(&self, builder: RequestBuilder, token: &SessionToken) -> RequestBuilder {
        match token {
            SessionToken::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            SessionToken::Bearer(token) => builder.bearer_auth(token),
        }
    }
}

impl Transport for HttpTransport {
    fn login(&self, credentials: &Credentials) -> Result<SessionToken, EodmsError> {
        let token = SessionToken::Basic {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        };
        let url = urljoin(&self.base_url, "collections");
        let response = self
            .authorize(self.client.get(&url), &token)
            .query(&[("format", "json")])
            .send()
            .map_err(|err| EodmsError::Network(err.to_string()))?;
        match response.status().as_u16() {
            401 | 403 => Err(EodmsError::Auth(format!(
                "insufficient access privileges or wrong password for `{}`",
                credentials.username
            ))),
            status if (200..300).contains(&status) => Ok(token),
            status => {
                let message = response
                    .text()
                    .unwrap_or_else(|_| "EODMS login failed".to_string());
                Err(EodmsError::Status { status, message })
            }
        }
    }

    fn send(&self, token: &SessionToken, request: &ApiRequest) -> Result<ApiResponse, EodmsError> {
        let url = urljoin(&self.base_url, &request.url);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        builder = self.authorize(builder, token);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(offset) = request.range_from {
            builder = builder.header(RANGE, format!("bytes={offset}-"));
        }
        let response = builder
            .send()
            .map_err(|err| EodmsError::Network(err.to_string()))?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        Ok(ApiResponse::new(status, content_length, Box::new(response)))
    }
}

/// Joins `path` onto `base` unless `path` is already absolute.
pub fn urljoin(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use assert_matches::assert_matches;

    use super::*;
    use crate::auth::{AuthSession, RetryPolicy};

    /// Answers every request with `503 busy` and counts them.
    fn busy_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}/rapi", listener.local_addr().unwrap());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream.write_all(
                    b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 4\r\nconnection: close\r\n\r\nbusy",
                );
            }
        });
        (base, seen)
    }

    #[test]
    fn busy_login_over_http_is_retried() {
        let (base, seen) = busy_server();
        let transport = HttpTransport::new(&base, Duration::from_secs(5)).unwrap();
        let session = AuthSession::new(transport, Credentials::new("alice", "pw"))
            .with_retry(RetryPolicy::immediate(3));

        assert_matches!(
            session.authenticate(),
            Err(EodmsError::TransientService { attempts: 3, message }) if message.contains("503")
        );
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn urljoin_keeps_absolute_urls() {
        assert_eq!(
            urljoin("https://host/wes/rapi/", "order"),
            "https://host/wes/rapi/order"
        );
        assert_eq!(
            urljoin("https://host/wes/rapi", "https://data.host/file.zip"),
            "https://data.host/file.zip"
        );
    }

    #[test]
    fn ensure_success_keeps_body() {
        let response = ApiResponse::from_bytes(404, "no such order");
        assert_matches!(
            response.ensure_success(),
            Err(EodmsError::Status { status: 404, message }) if message == "no such order"
        );
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = SessionToken::Basic {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{token:?}").contains("hunter2"));
    }
}
