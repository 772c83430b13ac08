use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::auth::AuthSession;
use crate::cancel::CancelToken;
use crate::domain::{Collection, OrderId, Outcome, Priority, RecordId};
use crate::error::EodmsError;
use crate::transport::{ApiRequest, Transport};

/// The order endpoint refuses more items than this in one submission.
pub const MAX_ORDER_SIZE: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    /// Zero-based batch index in submission order.
    pub batch: usize,
    pub record_ids: Vec<RecordId>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderSubmitResult {
    /// Order ids of successful batches, in submission order.
    pub order_ids: Vec<OrderId>,
    pub failures: Vec<BatchFailure>,
    pub batches: usize,
}

impl OrderSubmitResult {
    pub fn outcome(&self) -> Outcome {
        Outcome::from_counts(self.batches - self.failures.len(), self.failures.len())
    }

    /// Records worth resubmitting.
    pub fn failed_record_ids(&self) -> Vec<RecordId> {
        self.failures
            .iter()
            .flat_map(|f| f.record_ids.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(default)]
    items: Vec<OrderResponseItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponseItem {
    order_id: OrderId,
}

pub struct OrderSubmitter<'a, T: Transport> {
    session: &'a AuthSession<T>,
    order_url: String,
    collection: Collection,
    max_batch: usize,
}

impl<'a, T: Transport> OrderSubmitter<'a, T> {
    pub fn new(
        session: &'a AuthSession<T>,
        order_url: impl Into<String>,
        collection: Collection,
        max_batch: usize,
    ) -> Self {
        Self {
            session,
            order_url: order_url.into(),
            collection,
            max_batch: max_batch.clamp(1, MAX_ORDER_SIZE),
        }
    }

    fn payload(&self, records: &[RecordId], priority: Priority, email: &str) -> Value {
        let items = records
            .iter()
            .map(|record_id| {
                json!({
                    "collectionId": self.collection.id(),
                    "recordId": record_id.as_str(),
                    "priority": priority.to_string(),
                    "parameters": {
                        "NOTIFICATION_EMAIL_ADDRESS": email,
                        "packagingFormat": "ZIP",
                    },
                })
            })
            .collect::<Vec<_>>();
        json!({ "destinations": [], "items": items })
    }

    /// Submits `record_ids` in order, one call per batch. A failed batch is
    /// recorded and the remaining batches still go out; only an auth failure
    /// aborts the whole call.
    pub fn submit(
        &self,
        record_ids: &[RecordId],
        priority: Priority,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<OrderSubmitResult, EodmsError> {
        if record_ids.is_empty() {
            return Err(EodmsError::InvalidInput(
                "no record ids given for order submission".to_string(),
            ));
        }
        let batches: Vec<&[RecordId]> = record_ids.chunks(self.max_batch).collect();
        if batches.len() > 1 {
            warn!(
                records = record_ids.len(),
                orders = batches.len(),
                limit = self.max_batch,
                "record count exceeds per-order limit; splitting"
            );
        }
        let email = self.session.username();

        let mut order_ids: Vec<OrderId> = Vec::new();
        let mut failures = Vec::new();
        for (batch, records) in batches.iter().enumerate() {
            let attempt = if cancel.is_cancelled() {
                Err(EodmsError::Cancelled)
            } else {
                self.submit_batch(records, priority, &email)
            };
            match attempt {
                Ok(ids) => {
                    info!(batch, items = records.len(), %priority, "order accepted");
                    sink.event(ProgressEvent::BatchSubmitted {
                        batch,
                        order_ids: ids.clone(),
                    });
                    for id in ids {
                        if !order_ids.contains(&id) {
                            order_ids.push(id);
                        }
                    }
                }
                Err(EodmsError::Auth(message)) => {
                    if order_ids.is_empty() {
                        return Err(EodmsError::Auth(message));
                    }
                    error!(
                        batch,
                        ?order_ids,
                        error = %message,
                        "authentication lost; earlier batches were already ordered"
                    );
                    let accepted: Vec<String> = order_ids.iter().map(ToString::to_string).collect();
                    return Err(EodmsError::Auth(format!(
                        "{message} (orders already accepted: {})",
                        accepted.join(", ")
                    )));
                }
                Err(err) => {
                    error!(batch, items = records.len(), error = %err, "order batch failed");
                    sink.event(ProgressEvent::BatchFailed {
                        batch,
                        error: err.to_string(),
                    });
                    failures.push(BatchFailure {
                        batch,
                        record_ids: records.to_vec(),
                        error: err.to_string(),
                    });
                }
            }
        }

        Ok(OrderSubmitResult {
            order_ids,
            failures,
            batches: batches.len(),
        })
    }

    fn submit_batch(
        &self,
        records: &[RecordId],
        priority: Priority,
        email: &str,
    ) -> Result<Vec<OrderId>, EodmsError> {
        let request = ApiRequest::post_json(&self.order_url, self.payload(records, priority, email));
        let response: OrderResponse = self.session.request_json(&request)?;
        let mut ids: Vec<OrderId> = Vec::new();
        for item in response.items {
            if !ids.contains(&item.order_id) {
                ids.push(item.order_id);
            }
        }
        if ids.is_empty() {
            return Err(EodmsError::Decode(
                "order accepted without an order id; check the EODMS web interface".to_string(),
            ));
        }
        Ok(ids)
    }
}
