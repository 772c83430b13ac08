use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tracing::{debug, info};

use crate::auth::AuthSession;
use crate::cancel::CancelToken;
use crate::config::ClientConfig;
use crate::domain::{Collection, ItemId, ItemStatus, OrderId, Priority, RecordId};
use crate::download::{DownloadOrchestrator, DownloadReport, DownloadTarget, ItemOutcome};
use crate::error::EodmsError;
use crate::geometry::records_to_feature_collection;
use crate::order::{OrderSubmitResult, OrderSubmitter};
use crate::params::{ParameterValidator, SearchParameters, ValidatedQuery, allowed_options};
use crate::query::{QueryEngine, QueryResult, SearchEndpoint};
use crate::store::OutputStore;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    PageFetched {
        fetched: u64,
        total: u64,
    },
    MetadataFetched {
        fetched: usize,
        total: usize,
    },
    BatchSubmitted {
        batch: usize,
        order_ids: Vec<OrderId>,
    },
    BatchFailed {
        batch: usize,
        error: String,
    },
    ItemStatus {
        item_id: ItemId,
        status: ItemStatus,
    },
    TransferStarted {
        item_id: ItemId,
        path: Utf8PathBuf,
        size: Option<u64>,
    },
    TransferFinished {
        item_id: ItemId,
        outcome: ItemOutcome,
    },
}

/// Observer for long-running calls. Download workers report from their own
/// threads, hence `Send + Sync`.
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn event(&self, _event: ProgressEvent) {}
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn event(&self, event: ProgressEvent) {
        self(event)
    }
}

/// One EODMS session: the current collection and search criteria, the last
/// results, and the shared authenticated session every call goes through.
pub struct Eodms<T: Transport> {
    session: AuthSession<T>,
    config: ClientConfig,
    collection: Collection,
    params: SearchParameters,
    validated: Option<ValidatedQuery>,
    endpoint: SearchEndpoint,
    results: Option<QueryResult>,
    last_order: Option<OrderSubmitResult>,
}

impl<T: Transport> Eodms<T> {
    pub fn new(session: AuthSession<T>, config: ClientConfig, collection: Collection) -> Self {
        let endpoint = SearchEndpoint::for_collection(&config.base_url, collection);
        Self {
            session,
            config,
            collection,
            params: SearchParameters::new(),
            validated: None,
            endpoint,
            results: None,
            last_order: None,
        }
    }

    pub fn session(&self) -> &AuthSession<T> {
        &self.session
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn search_endpoint(&self) -> &SearchEndpoint {
        &self.endpoint
    }

    /// Option names accepted for the current collection.
    pub fn available_options(&self) -> Vec<&'static str> {
        allowed_options(self.collection)
    }

    pub fn parameters(&self) -> &SearchParameters {
        &self.params
    }

    pub fn validated(&self) -> Option<&ValidatedQuery> {
        self.validated.as_ref()
    }

    pub fn results(&self) -> Option<&QueryResult> {
        self.results.as_ref()
    }

    pub fn last_order(&self) -> Option<&OrderSubmitResult> {
        self.last_order.as_ref()
    }

    /// Switches collection and re-checks the criteria already set. On a
    /// validation error nothing changes.
    pub fn set_collection(&mut self, collection: Collection) -> Result<(), EodmsError> {
        if collection == self.collection {
            return Ok(());
        }
        let validated = if self.params.is_empty() {
            None
        } else {
            Some(ParameterValidator::validate(collection, &self.params, Utc::now())?)
        };
        debug!(from = %self.collection, to = %collection, "switching collection");
        self.collection = collection;
        self.endpoint = SearchEndpoint::for_collection(&self.config.base_url, collection);
        self.validated = validated;
        self.results = None;
        Ok(())
    }

    /// Replaces the search criteria once they validate for the current collection.
    pub fn set_parameters(&mut self, params: SearchParameters) -> Result<&ValidatedQuery, EodmsError> {
        let validated = ParameterValidator::validate(self.collection, &params, Utc::now())?;
        self.params = params;
        Ok(self.validated.insert(validated))
    }

    /// Runs the current criteria against the current collection. Relative
    /// and default time windows are anchored at the time of the call.
    pub fn query(
        &mut self,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<&QueryResult, EodmsError> {
        let validated = ParameterValidator::validate(self.collection, &self.params, Utc::now())?;
        let engine = QueryEngine::new(&self.session, self.endpoint.clone(), self.config.page_size)
            .with_metadata_workers(self.config.metadata_workers);
        let result = engine.query(&validated, cancel, sink)?;
        self.validated = Some(validated);
        Ok(self.results.insert(result))
    }

    /// `set_collection` and `set_parameters` in one step, then `query`.
    /// The collection is validated together with the new criteria, so
    /// criteria that only fit the old collection do not block the switch.
    pub fn query_collection(
        &mut self,
        collection: Collection,
        params: SearchParameters,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<&QueryResult, EodmsError> {
        ParameterValidator::validate(collection, &params, Utc::now())?;
        if collection != self.collection {
            self.collection = collection;
            self.endpoint = SearchEndpoint::for_collection(&self.config.base_url, collection);
            self.results = None;
        }
        self.params = params;
        self.query(cancel, sink)
    }

    /// Orders `record_ids` from the current collection in batches.
    pub fn order(
        &mut self,
        record_ids: &[RecordId],
        priority: Priority,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<&OrderSubmitResult, EodmsError> {
        let submitter = OrderSubmitter::new(
            &self.session,
            self.config.order_url(),
            self.collection,
            self.config.max_order_size,
        );
        let result = submitter.submit(record_ids, priority, cancel, sink)?;
        info!(
            collection = %self.collection,
            orders = result.order_ids.len(),
            failed_batches = result.failures.len(),
            "order submission finished"
        );
        Ok(self.last_order.insert(result))
    }

    /// Orders every record of the last query.
    pub fn order_results(
        &mut self,
        priority: Priority,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<&OrderSubmitResult, EodmsError> {
        let record_ids = match &self.results {
            Some(results) if !results.is_empty() => results.record_ids(),
            _ => {
                return Err(EodmsError::InvalidInput(
                    "no query results to order; run a query first".to_string(),
                ));
            }
        };
        if let Some(results) = &self.results {
            if results.collection != self.collection {
                return Err(EodmsError::InvalidInput(format!(
                    "results belong to {}, current collection is {}",
                    results.collection, self.collection
                )));
            }
        }
        self.order(&record_ids, priority, cancel, sink)
    }

    /// Polls `targets` and downloads every item into `output_dir`.
    /// `max_workers` overrides the configured pool size.
    pub fn download(
        &self,
        targets: &[DownloadTarget],
        output_dir: &Utf8Path,
        max_workers: Option<usize>,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadReport, EodmsError> {
        let mut options = self.config.download.clone();
        if let Some(workers) = max_workers {
            options.max_workers = workers.max(1);
        }
        let store = OutputStore::new(output_dir);
        DownloadOrchestrator::new(&self.session, self.config.order_url(), options)
            .download(targets, &store, cancel, sink)
    }

    /// Downloads the orders created by the last `order` call.
    pub fn download_last_order(
        &self,
        output_dir: &Utf8Path,
        max_workers: Option<usize>,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadReport, EodmsError> {
        let targets: Vec<DownloadTarget> = self
            .last_order
            .iter()
            .flat_map(|order| order.order_ids.iter().cloned())
            .map(DownloadTarget::Order)
            .collect();
        self.download(&targets, output_dir, max_workers, cancel, sink)
    }

    /// Writes the last query's records as a GeoJSON FeatureCollection.
    /// Returns the number of features written.
    pub fn write_results(&self, path: &Utf8Path) -> Result<usize, EodmsError> {
        let records = self
            .results
            .as_ref()
            .map(|results| results.records.as_slice())
            .unwrap_or_default();
        let collection = records_to_feature_collection(records);
        let bytes = serde_json::to_vec_pretty(&collection)
            .map_err(|err| EodmsError::Filesystem(err.to_string()))?;
        OutputStore::write_bytes_atomic(path, &bytes)?;
        info!(%path, features = records.len(), "results written");
        Ok(records.len())
    }
}
