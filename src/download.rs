use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::auth::AuthSession;
use crate::cancel::CancelToken;
use crate::domain::{ItemId, ItemStatus, Order, OrderId, OrderItem, Outcome, RecordId};
use crate::error::EodmsError;
use crate::store::OutputStore;
use crate::transport::{ApiRequest, Transport};

const TRANSFER_BUFFER: usize = 64 * 1024;
const STATUS_PAGE_SIZE: u32 = 1000;

/// What the caller asks to download: every item of an order, or one item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DownloadTarget {
    Order(OrderId),
    Item(ItemId),
}

impl fmt::Display for DownloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadTarget::Order(id) => write!(f, "order:{id}"),
            DownloadTarget::Item(id) => write!(f, "item:{id}"),
        }
    }
}

impl FromStr for DownloadTarget {
    type Err = EodmsError;

    /// `order:N`, `item:N`, or a bare order id.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        match value.split_once(':') {
            Some((kind, id)) => match kind.trim().to_lowercase().as_str() {
                "order" => Ok(DownloadTarget::Order(id.parse()?)),
                "item" => Ok(DownloadTarget::Item(id.parse()?)),
                other => Err(EodmsError::InvalidId(format!(
                    "unknown download target kind `{other}` (use order: or item:)"
                ))),
            },
            None => Ok(DownloadTarget::Order(value.parse()?)),
        }
    }
}

impl From<OrderId> for DownloadTarget {
    fn from(id: OrderId) -> Self {
        DownloadTarget::Order(id)
    }
}

impl From<ItemId> for DownloadTarget {
    fn from(id: ItemId) -> Self {
        DownloadTarget::Item(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    pub max_workers: usize,
    pub poll_interval: Duration,
    /// Longest an item may stay unready before it is reported as timed out.
    pub wait_budget: Duration,
    pub transfer_attempts: usize,
    pub transfer_backoff: Duration,
    /// Re-transfer files that already exist with the expected size.
    pub overwrite: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            poll_interval: Duration::from_secs(30),
            wait_budget: Duration::from_secs(2 * 60 * 60),
            transfer_attempts: 3,
            transfer_backoff: Duration::from_secs(2),
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    ServerFailed,
    Expired,
    Unavailable,
    Transfer,
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureReason::Timeout => "timeout",
            FailureReason::ServerFailed => "server failed",
            FailureReason::Expired => "expired",
            FailureReason::Unavailable => "unavailable",
            FailureReason::Transfer => "transfer failed",
            FailureReason::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Downloaded { path: Utf8PathBuf, bytes: u64 },
    /// A file of the expected size was already in place; nothing was transferred.
    AlreadyPresent { path: Utf8PathBuf, bytes: u64 },
    Failed { reason: FailureReason, detail: String },
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, ItemOutcome::Failed { .. })
    }

    pub fn path(&self) -> Option<&Utf8PathBuf> {
        match self {
            ItemOutcome::Downloaded { path, .. } | ItemOutcome::AlreadyPresent { path, .. } => {
                Some(path)
            }
            ItemOutcome::Failed { .. } => None,
        }
    }

    fn failed(reason: FailureReason, detail: impl Into<String>) -> Self {
        ItemOutcome::Failed {
            reason,
            detail: detail.into(),
        }
    }
}

/// A target whose items could not be listed at all.
#[derive(Debug, Clone, Serialize)]
pub struct UnresolvedTarget {
    pub target: DownloadTarget,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadReport {
    pub items: BTreeMap<ItemId, ItemOutcome>,
    pub unresolved: Vec<UnresolvedTarget>,
}

impl DownloadReport {
    pub fn succeeded(&self) -> usize {
        self.items.values().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded() + self.unresolved.len()
    }

    pub fn outcome(&self) -> Outcome {
        Outcome::from_counts(self.succeeded(), self.failed())
    }

    pub fn failed_items(&self) -> Vec<ItemId> {
        self.items
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Per-item lifecycle while a download call runs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ItemState {
    Pending,
    Polling,
    Ready,
    Downloading,
    Complete(ItemOutcome),
    Failed(ItemOutcome),
}

impl ItemState {
    fn awaiting_server(&self) -> bool {
        matches!(self, ItemState::Pending | ItemState::Polling)
    }
}

struct Tracked {
    state: ItemState,
    last_status: Option<ItemStatus>,
    first_seen: Instant,
}

struct TransferJob {
    item_id: ItemId,
    url: String,
    size: Option<u64>,
    file_name: String,
}

type Completion = (ItemId, Result<ItemOutcome, EodmsError>);

#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawItem {
    item_id: ItemId,
    order_id: OrderId,
    #[serde(default)]
    record_id: Option<RecordId>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    destinations: Vec<RawDestination>,
    #[serde(default)]
    manifest: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDestination {
    #[serde(default)]
    string_value: Option<String>,
}

/// Polls order status and hands ready items to a bounded pool of transfer
/// workers. Individual item failures end up in the report; only programmer
/// errors and authentication failures are returned as `Err`.
pub struct DownloadOrchestrator<'a, T: Transport> {
    session: &'a AuthSession<T>,
    order_url: String,
    options: DownloadOptions,
}

impl<'a, T: Transport> DownloadOrchestrator<'a, T> {
    pub fn new(
        session: &'a AuthSession<T>,
        order_url: impl Into<String>,
        options: DownloadOptions,
    ) -> Self {
        Self {
            session,
            order_url: order_url.into(),
            options,
        }
    }

    pub fn download(
        &self,
        targets: &[DownloadTarget],
        store: &OutputStore,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadReport, EodmsError> {
        if targets.is_empty() {
            return Err(EodmsError::InvalidInput(
                "no order or item ids given for download".to_string(),
            ));
        }
        store.ensure_root()?;
        let mut targets = targets.to_vec();
        targets.sort();
        targets.dedup();
        info!(
            targets = targets.len(),
            workers = self.options.max_workers,
            output = %store.root(),
            "checking order status"
        );

        let abort = AtomicBool::new(false);
        let (job_tx, job_rx) = mpsc::channel::<TransferJob>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (done_tx, done_rx) = mpsc::channel::<Completion>();

        thread::scope(|scope| {
            for _ in 0..self.options.max_workers.max(1) {
                let jobs = Arc::clone(&job_rx);
                let done = done_tx.clone();
                let abort = &abort;
                scope.spawn(move || self.worker(jobs, done, store, cancel, abort, sink));
            }
            drop(done_tx);

            let mut poller = Poller {
                orchestrator: self,
                tracked: BTreeMap::new(),
                target_items: targets.iter().map(|t| (t.clone(), BTreeSet::new())).collect(),
                unresolved: Vec::new(),
                auth_error: None,
            };
            poller.run(&job_tx, &done_rx, cancel, &abort, sink);
            drop(job_tx);

            for (item_id, result) in done_rx.iter() {
                poller.complete(item_id, result, &abort, sink);
            }
            poller.finish(cancel)
        })
    }

    fn worker(
        &self,
        jobs: Arc<Mutex<Receiver<TransferJob>>>,
        done: Sender<Completion>,
        store: &OutputStore,
        cancel: &CancelToken,
        abort: &AtomicBool,
        sink: &dyn ProgressSink,
    ) {
        loop {
            let job = jobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv();
            let Ok(job) = job else {
                break;
            };
            let result = if cancel.is_cancelled() {
                Ok(ItemOutcome::failed(
                    FailureReason::Cancelled,
                    "cancelled before transfer started",
                ))
            } else if abort.load(Ordering::SeqCst) {
                Ok(ItemOutcome::failed(
                    FailureReason::Cancelled,
                    "download aborted after an authentication failure",
                ))
            } else {
                self.transfer(&job, store, sink)
            };
            if done.send((job.item_id, result)).is_err() {
                break;
            }
        }
    }

    fn transfer(
        &self,
        job: &TransferJob,
        store: &OutputStore,
        sink: &dyn ProgressSink,
    ) -> Result<ItemOutcome, EodmsError> {
        let path = store.item_path(&job.file_name);
        if let Some(existing) = store.existing_len(&path) {
            match job.size {
                Some(expected) if existing == expected && !self.options.overwrite => {
                    debug!(%path, "local file complete; skipping transfer");
                    return Ok(ItemOutcome::AlreadyPresent {
                        path,
                        bytes: existing,
                    });
                }
                Some(expected) if existing != expected => {
                    warn!(%path, existing, expected, "local file size mismatch; downloading again");
                }
                _ => {}
            }
        }

        sink.event(ProgressEvent::TransferStarted {
            item_id: job.item_id.clone(),
            path: path.clone(),
            size: job.size,
        });
        let mut temp = store.begin_transfer(&job.file_name)?;
        let mut written = 0u64;
        let mut attempt = 1usize;
        loop {
            match self.stream_once(job, &mut temp, &mut written) {
                Ok(()) => break,
                Err(err) if err.is_auth() => return Err(err),
                Err(err) => {
                    if attempt >= self.options.transfer_attempts.max(1) {
                        warn!(item = %job.item_id, attempts = attempt, error = %err, "transfer failed");
                        return Ok(ItemOutcome::failed(FailureReason::Transfer, err.to_string()));
                    }
                    let delay = backoff(self.options.transfer_backoff, attempt);
                    warn!(item = %job.item_id, attempt, written, ?delay, error = %err, "transfer interrupted; retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
        store.commit(temp, &path)?;
        info!(item = %job.item_id, %path, bytes = written, "download complete");
        Ok(ItemOutcome::Downloaded {
            path,
            bytes: written,
        })
    }

    /// One GET of the remaining bytes into `temp`. Resumes from `written` when
    /// the server honours the range, restarts the file otherwise.
    fn stream_once(
        &self,
        job: &TransferJob,
        temp: &mut NamedTempFile,
        written: &mut u64,
    ) -> Result<(), EodmsError> {
        let fs_err = |err: std::io::Error| EodmsError::Filesystem(err.to_string());
        let request = ApiRequest::get(&job.url).range_from(*written);
        let response = self.session.request(&request)?.ensure_success()?;
        if *written > 0 && response.status != 206 {
            debug!(item = %job.item_id, "range ignored by server; restarting transfer");
            temp.as_file_mut().set_len(0).map_err(fs_err)?;
            temp.seek(SeekFrom::Start(0)).map_err(fs_err)?;
            *written = 0;
        }
        if let (Some(expected), Some(announced)) = (job.size, response.content_length) {
            if *written + announced < expected {
                return Err(EodmsError::Network(format!(
                    "remote file is {} bytes, manifest says {expected}",
                    *written + announced
                )));
            }
        }

        let mut reader = response.into_reader();
        let mut buf = vec![0u8; TRANSFER_BUFFER];
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|err| EodmsError::Network(format!("transfer interrupted: {err}")))?;
            if n == 0 {
                break;
            }
            temp.write_all(&buf[..n]).map_err(fs_err)?;
            *written += n as u64;
        }
        temp.flush().map_err(fs_err)?;

        match job.size {
            Some(expected) if *written < expected => Err(EodmsError::Network(format!(
                "transfer ended at {written} of {expected} bytes"
            ))),
            Some(expected) if *written > expected => {
                temp.as_file_mut().set_len(0).map_err(fs_err)?;
                temp.seek(SeekFrom::Start(0)).map_err(fs_err)?;
                let received = *written;
                *written = 0;
                Err(EodmsError::Network(format!(
                    "received {received} bytes, expected {expected}"
                )))
            }
            _ => Ok(()),
        }
    }

    fn poll_target(&self, target: &DownloadTarget) -> Result<Vec<Order>, EodmsError> {
        let request = match target {
            DownloadTarget::Order(id) => ApiRequest::get(&self.order_url).query("orderId", id),
            DownloadTarget::Item(id) => ApiRequest::get(&self.order_url).query("itemId", id),
        }
        .query("maxOrders", STATUS_PAGE_SIZE)
        .query("format", "json");
        let envelope: StatusEnvelope = self.session.request_json(&request)?;

        let mut items = Vec::new();
        for raw in envelope.items {
            match serde_json::from_value::<RawItem>(raw) {
                Ok(raw) => {
                    let item = order_item(raw);
                    let belongs = match target {
                        DownloadTarget::Order(id) => &item.order_id == id,
                        DownloadTarget::Item(id) => &item.item_id == id,
                    };
                    if belongs {
                        items.push(item);
                    }
                }
                Err(err) => warn!(%target, error = %err, "skipping malformed order item"),
            }
        }
        Ok(Order::group(items))
    }
}

fn backoff(base: Duration, attempt: usize) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16) as u32;
    base.saturating_mul(2u32.saturating_pow(exponent))
}

struct Poller<'o, 'a, T: Transport> {
    orchestrator: &'o DownloadOrchestrator<'a, T>,
    tracked: BTreeMap<ItemId, Tracked>,
    target_items: BTreeMap<DownloadTarget, BTreeSet<ItemId>>,
    unresolved: Vec<UnresolvedTarget>,
    auth_error: Option<EodmsError>,
}

impl<T: Transport> Poller<'_, '_, T> {
    fn run(
        &mut self,
        jobs: &Sender<TransferJob>,
        done: &Receiver<Completion>,
        cancel: &CancelToken,
        abort: &AtomicBool,
        sink: &dyn ProgressSink,
    ) {
        let orchestrator = self.orchestrator;
        let options = &orchestrator.options;
        let mut polling: Vec<DownloadTarget> = self.target_items.keys().cloned().collect();
        loop {
            while let Ok((item_id, result)) = done.try_recv() {
                self.complete(item_id, result, abort, sink);
            }
            if cancel.is_cancelled() || abort.load(Ordering::SeqCst) {
                break;
            }

            let mut still_polling = Vec::new();
            for target in polling {
                if abort.load(Ordering::SeqCst) {
                    break;
                }
                match orchestrator.poll_target(&target) {
                    Ok(orders) => {
                        if orders.is_empty() && self.target_items[&target].is_empty() {
                            warn!(%target, "no items found");
                            self.unresolved.push(UnresolvedTarget {
                                target,
                                error: "EODMS returned no items".to_string(),
                            });
                            continue;
                        }
                        for order in orders {
                            debug!(%target, order = %order.order_id, items = order.items.len(), "order status");
                            for item in order.items {
                                self.observe(&target, item, options, jobs, sink);
                            }
                        }
                        if self.target_waiting(&target) {
                            still_polling.push(target);
                        }
                    }
                    Err(err) if err.is_auth() => {
                        abort.store(true, Ordering::SeqCst);
                        self.auth_error = Some(err);
                        break;
                    }
                    Err(err) if self.target_items[&target].is_empty() => {
                        warn!(%target, error = %err, "cannot list order items");
                        self.unresolved.push(UnresolvedTarget {
                            target,
                            error: err.to_string(),
                        });
                    }
                    Err(err) => {
                        warn!(%target, error = %err, "status check failed; will poll again");
                        self.expire_waiting(&target, options.wait_budget, sink);
                        if self.target_waiting(&target) {
                            still_polling.push(target);
                        }
                    }
                }
            }
            polling = still_polling;
            if polling.is_empty() || abort.load(Ordering::SeqCst) {
                break;
            }
            debug!(targets = polling.len(), interval = ?options.poll_interval, "waiting for items to become ready");
            cancel.sleep(options.poll_interval);
        }
    }

    fn target_waiting(&self, target: &DownloadTarget) -> bool {
        self.target_items[target].iter().any(|id| {
            self.tracked
                .get(id)
                .is_some_and(|tracked| tracked.state.awaiting_server())
        })
    }

    fn observe(
        &mut self,
        target: &DownloadTarget,
        item: OrderItem,
        options: &DownloadOptions,
        jobs: &Sender<TransferJob>,
        sink: &dyn ProgressSink,
    ) {
        if let Some(set) = self.target_items.get_mut(target) {
            set.insert(item.item_id.clone());
        }
        let tracked = self
            .tracked
            .entry(item.item_id.clone())
            .or_insert_with(|| Tracked {
                state: ItemState::Pending,
                last_status: None,
                first_seen: Instant::now(),
            });
        if !tracked.state.awaiting_server() {
            return;
        }
        tracked.state = ItemState::Polling;
        if tracked.last_status != Some(item.status) {
            tracked.last_status = Some(item.status);
            debug!(item = %item.item_id, status = %item.status, "item status");
            sink.event(ProgressEvent::ItemStatus {
                item_id: item.item_id.clone(),
                status: item.status,
            });
        }

        let settled = match item.status {
            ItemStatus::Available | ItemStatus::Downloaded => match &item.download_url {
                Some(url) => {
                    tracked.state = ItemState::Ready;
                    let job = TransferJob {
                        item_id: item.item_id.clone(),
                        url: url.clone(),
                        size: item.size,
                        file_name: file_name_for(url, &item.item_id),
                    };
                    if jobs.send(job).is_ok() {
                        tracked.state = ItemState::Downloading;
                        None
                    } else {
                        Some(ItemOutcome::failed(
                            FailureReason::Cancelled,
                            "transfer pool shut down",
                        ))
                    }
                }
                None if item.status == ItemStatus::Downloaded => Some(ItemOutcome::failed(
                    FailureReason::Unavailable,
                    "item already delivered and no download link is left",
                )),
                None => None,
            },
            ItemStatus::Failed => Some(ItemOutcome::failed(
                FailureReason::ServerFailed,
                "EODMS reported the item as failed",
            )),
            ItemStatus::Expired => Some(ItemOutcome::failed(
                FailureReason::Expired,
                "the item is no longer held for download",
            )),
            ItemStatus::Submitted | ItemStatus::Processing => None,
        };
        if let Some(outcome) = settled {
            tracked.state = ItemState::Failed(outcome.clone());
            sink.event(ProgressEvent::TransferFinished {
                item_id: item.item_id,
                outcome,
            });
            return;
        }
        if tracked.state.awaiting_server() && tracked.first_seen.elapsed() >= options.wait_budget {
            let outcome = ItemOutcome::failed(
                FailureReason::Timeout,
                format!(
                    "still {} after {:?}",
                    item.status, options.wait_budget
                ),
            );
            warn!(item = %item.item_id, "item not ready within the wait budget");
            tracked.state = ItemState::Failed(outcome.clone());
            sink.event(ProgressEvent::TransferFinished {
                item_id: item.item_id,
                outcome,
            });
        }
    }

    /// Applies the wait budget to a target's items when its status could not be read.
    fn expire_waiting(&mut self, target: &DownloadTarget, budget: Duration, sink: &dyn ProgressSink) {
        for id in &self.target_items[target] {
            if let Some(tracked) = self.tracked.get_mut(id) {
                if tracked.state.awaiting_server() && tracked.first_seen.elapsed() >= budget {
                    let outcome = ItemOutcome::failed(
                        FailureReason::Timeout,
                        format!("status unavailable for {budget:?}"),
                    );
                    tracked.state = ItemState::Failed(outcome.clone());
                    sink.event(ProgressEvent::TransferFinished {
                        item_id: id.clone(),
                        outcome,
                    });
                }
            }
        }
    }

    fn complete(
        &mut self,
        item_id: ItemId,
        result: Result<ItemOutcome, EodmsError>,
        abort: &AtomicBool,
        sink: &dyn ProgressSink,
    ) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) if err.is_auth() => {
                abort.store(true, Ordering::SeqCst);
                let detail = err.to_string();
                if self.auth_error.is_none() {
                    self.auth_error = Some(err);
                }
                ItemOutcome::failed(FailureReason::Transfer, detail)
            }
            Err(err) => ItemOutcome::failed(FailureReason::Transfer, err.to_string()),
        };
        sink.event(ProgressEvent::TransferFinished {
            item_id: item_id.clone(),
            outcome: outcome.clone(),
        });
        if let Some(tracked) = self.tracked.get_mut(&item_id) {
            tracked.state = if outcome.is_success() {
                ItemState::Complete(outcome)
            } else {
                ItemState::Failed(outcome)
            };
        }
    }

    fn finish(self, cancel: &CancelToken) -> Result<DownloadReport, EodmsError> {
        if let Some(err) = self.auth_error {
            return Err(err);
        }
        let mut unresolved = self.unresolved;
        for (target, items) in &self.target_items {
            if items.is_empty() && !unresolved.iter().any(|u| &u.target == target) {
                let error = if cancel.is_cancelled() {
                    "cancelled before its items were listed"
                } else {
                    "items were never listed"
                };
                unresolved.push(UnresolvedTarget {
                    target: target.clone(),
                    error: error.to_string(),
                });
            }
        }
        let mut report = DownloadReport {
            items: BTreeMap::new(),
            unresolved,
        };
        for (item_id, tracked) in self.tracked {
            let outcome = match tracked.state {
                ItemState::Complete(outcome) | ItemState::Failed(outcome) => outcome,
                _ if cancel.is_cancelled() => {
                    ItemOutcome::failed(FailureReason::Cancelled, "cancelled while waiting")
                }
                _ => ItemOutcome::failed(
                    FailureReason::Unavailable,
                    "item never became ready for download",
                ),
            };
            report.items.insert(item_id, outcome);
        }
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "download finished"
        );
        Ok(report)
    }
}

fn order_item(raw: RawItem) -> OrderItem {
    let download_url = raw
        .destinations
        .iter()
        .filter_map(|d| d.string_value.as_deref())
        .find_map(extract_download_url);
    let size = raw.manifest.as_ref().and_then(manifest_size);
    OrderItem {
        item_id: raw.item_id,
        order_id: raw.order_id,
        record_id: raw.record_id,
        status: ItemStatus::from_service(&raw.status),
        download_url,
        size,
    }
}

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("Regex pattern should always compile"));

/// The link arrives as an HTML fragment; keep its text, decode entities and
/// drop the trailing `&file=` parameter.
pub fn extract_download_url(fragment: &str) -> Option<String> {
    let text = HTML_TAG.replace_all(fragment, "");
    let decoded = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let url = decoded.split("&file=").next().unwrap_or("").trim();
    (url.starts_with("http://") || url.starts_with("https://")).then(|| url.to_string())
}

/// Expected byte size from the item manifest (file name -> size).
fn manifest_size(manifest: &serde_json::Map<String, Value>) -> Option<u64> {
    manifest
        .values()
        .filter_map(|value| match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .last()
}

/// Local file name: the last URL path segment, or the item id as a fallback.
fn file_name_for(url: &str, item_id: &ItemId) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && segment.contains('.'))
        .map(str::to_string)
        .unwrap_or_else(|| format!("{item_id}.zip"))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn target_parsing() {
        assert_eq!(
            "order:123".parse::<DownloadTarget>().unwrap(),
            DownloadTarget::Order("123".parse().unwrap())
        );
        assert_eq!(
            "item:9".parse::<DownloadTarget>().unwrap(),
            DownloadTarget::Item("9".parse().unwrap())
        );
        assert_eq!(
            " 77 ".parse::<DownloadTarget>().unwrap(),
            DownloadTarget::Order("77".parse().unwrap())
        );
        assert_matches!(
            "batch:1".parse::<DownloadTarget>(),
            Err(EodmsError::InvalidId(_))
        );
    }

    #[test]
    fn download_url_from_html() {
        let fragment = "<a href=\"https://data.example/x\" target=\"_blank\">https://data.example/getfile?id=1&amp;token=abc&amp;file=RCM1.zip</a>";
        assert_eq!(
            extract_download_url(fragment).as_deref(),
            Some("https://data.example/getfile?id=1&token=abc")
        );
        assert_eq!(extract_download_url("<p>pending</p>"), None);
    }

    #[test]
    fn item_from_status_payload() {
        let raw: RawItem = serde_json::from_value(json!({
            "itemId": 55,
            "orderId": "12",
            "recordId": 7,
            "status": "AVAILABLE_FOR_DOWNLOAD",
            "destinations": [{"type": "FTP", "stringValue": "<a>https://files.example/RCM1_OK.zip</a>"}],
            "manifest": {"RCM1_OK.zip": "2048"}
        }))
        .unwrap();
        let item = order_item(raw);
        assert_eq!(item.status, ItemStatus::Available);
        assert_eq!(item.size, Some(2048));
        assert_eq!(
            item.download_url.as_deref(),
            Some("https://files.example/RCM1_OK.zip")
        );
    }

    #[test]
    fn file_names() {
        let id: ItemId = "5".parse().unwrap();
        assert_eq!(
            file_name_for("https://h/a/RCM1_OK.zip?x=1", &id),
            "RCM1_OK.zip"
        );
        assert_eq!(file_name_for("https://h/getfile?id=1", &id), "5.zip");
    }

    #[test]
    fn report_outcome() {
        let mut report = DownloadReport::default();
        report.items.insert(
            "1".parse().unwrap(),
            ItemOutcome::Downloaded {
                path: "a.zip".into(),
                bytes: 1,
            },
        );
        assert_eq!(report.outcome(), Outcome::Succeeded);
        report.items.insert(
            "2".parse().unwrap(),
            ItemOutcome::failed(FailureReason::Timeout, "late"),
        );
        assert_eq!(report.outcome(), Outcome::PartiallySucceeded);
        assert_eq!(report.failed_items(), vec!["2".parse::<ItemId>().unwrap()]);
    }
}
