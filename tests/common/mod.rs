#![allow(dead_code)]

use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde_json::{Value, json};
use tempfile::TempDir;

use eodms_client::app::{ProgressEvent, ProgressSink};
use eodms_client::auth::{AuthSession, Credentials, RetryPolicy};
use eodms_client::config::ClientConfig;
use eodms_client::download::DownloadOptions;
use eodms_client::error::EodmsError;
use eodms_client::transport::{ApiRequest, ApiResponse, SessionToken, Transport};

pub const BASE: &str = "https://eodms.test/rapi";
pub const SEARCH_URL: &str = "https://eodms.test/rapi/search";
pub const ORDER_URL: &str = "https://eodms.test/rapi/order";

type Handler =
    Box<dyn Fn(&ApiRequest, &SessionToken) -> Result<ApiResponse, EodmsError> + Send + Sync>;

/// Scripted EODMS: every request is logged and answered by `handler`.
pub struct MockTransport {
    handler: Handler,
    requests: Mutex<Vec<ApiRequest>>,
    logins: AtomicUsize,
    rejected_logins: AtomicUsize,
    busy_logins: AtomicUsize,
    busy_status: u16,
}

impl MockTransport {
    pub fn new(
        handler: impl Fn(&ApiRequest, &SessionToken) -> Result<ApiResponse, EodmsError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            logins: AtomicUsize::new(0),
            rejected_logins: AtomicUsize::new(0),
            busy_logins: AtomicUsize::new(0),
            busy_status: 503,
        }
    }

    /// The next `count` logins fail with `Auth`.
    pub fn reject_logins(self, count: usize) -> Self {
        self.rejected_logins.store(count, Ordering::SeqCst);
        self
    }

    /// The next `count` logins are answered with HTTP `status`.
    pub fn busy_logins(mut self, count: usize, status: u16) -> Self {
        self.busy_logins.store(count, Ordering::SeqCst);
        self.busy_status = status;
        self
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, url: &str) -> Vec<ApiRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.url == url)
            .collect()
    }
}

impl Transport for MockTransport {
    fn login(&self, credentials: &Credentials) -> Result<SessionToken, EodmsError> {
        let count = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        let busy = self
            .busy_logins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if busy {
            return Err(EodmsError::Status {
                status: self.busy_status,
                message: "busy".to_string(),
            });
        }
        let rejected = self
            .rejected_logins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(EodmsError::Auth(format!(
                "wrong password for `{}`",
                credentials.username
            )));
        }
        Ok(SessionToken::Bearer(format!("token-{count}")))
    }

    fn send(&self, token: &SessionToken, request: &ApiRequest) -> Result<ApiResponse, EodmsError> {
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(request, token)
    }
}

pub fn credentials() -> Credentials {
    Credentials::new("tester@example.com", "secret")
}

pub fn session(transport: MockTransport) -> AuthSession<MockTransport> {
    AuthSession::new(transport, credentials()).with_retry(RetryPolicy::immediate(3))
}

pub fn fast_download_options() -> DownloadOptions {
    DownloadOptions {
        max_workers: 3,
        poll_interval: Duration::from_millis(10),
        wait_budget: Duration::from_millis(300),
        transfer_attempts: 3,
        transfer_backoff: Duration::ZERO,
        overwrite: false,
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        base_url: BASE.to_string(),
        page_size: 10,
        retry: RetryPolicy::immediate(3),
        download: fast_download_options(),
        ..ClientConfig::default()
    }
}

pub fn ok_json(value: Value) -> Result<ApiResponse, EodmsError> {
    Ok(ApiResponse::json(200, &value))
}

pub fn status(code: u16) -> Result<ApiResponse, EodmsError> {
    Ok(ApiResponse::from_bytes(code, format!("HTTP {code}")))
}

pub fn record_json(id: u64) -> Value {
    json!({
        "recordId": id,
        "uuid": format!("uuid-{id}"),
        "title": format!("RCM1_OK{id}_PK{id}_1_SC100MA"),
        "geometry": {
            "type": "Polygon",
            "coordinates": [[[-76.0, 45.0], [-75.0, 45.0], [-75.0, 46.0], [-76.0, 46.0], [-76.0, 45.0]]]
        },
        "thumbnailUrl": format!("https://eodms.test/thumb/{id}.jpg"),
        "metadata": [["Beam Mnemonic", "SC100MA"], ["Absolute Orbit", 1000 + id]]
    })
}

/// One search page cut from a result set of `total` records with ids 1..=total.
pub fn search_page(request: &ApiRequest, total: u64) -> Result<ApiResponse, EodmsError> {
    let first: u64 = request
        .query_value("firstResult")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let max: u64 = request
        .query_value("maxResults")
        .and_then(|v| v.parse().ok())
        .unwrap_or(150);
    let results: Vec<Value> = (first..first + max)
        .take_while(|id| *id <= total)
        .map(record_json)
        .collect();
    ok_json(json!({ "totalResults": total, "results": results }))
}

pub fn item_json(item_id: u64, order_id: u64, status: &str, url: Option<&str>, size: u64) -> Value {
    let destinations = match url {
        Some(url) => json!([{ "type": "FTP", "stringValue": format!("<a href=\"{url}\">{url}</a>") }]),
        None => json!([]),
    };
    json!({
        "itemId": item_id,
        "orderId": order_id,
        "recordId": item_id * 10,
        "status": status,
        "destinations": destinations,
        "manifest": { format!("item{item_id}.zip"): size.to_string() }
    })
}

pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Yields `limit` bytes of `data`, then fails like a dropped connection.
pub struct BrokenReader {
    data: Vec<u8>,
    position: usize,
    limit: usize,
}

impl BrokenReader {
    pub fn new(data: Vec<u8>, limit: usize) -> Self {
        Self {
            data,
            position: 0,
            limit,
        }
    }
}

impl Read for BrokenReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.limit {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"));
        }
        let end = self.limit.min(self.data.len()).min(self.position + buf.len());
        let n = end - self.position;
        buf[..n].copy_from_slice(&self.data[self.position..end]);
        self.position = end;
        Ok(n)
    }
}

pub fn utf8_dir(temp: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap()
}

/// File names in `dir`, sorted.
pub fn list_dir(dir: &Utf8PathBuf) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.as_std_path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<ProgressEvent>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for EventLog {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}
