use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::auth::AuthSession;
use crate::cancel::CancelToken;
use crate::domain::{Collection, Record, RecordId};
use crate::error::EodmsError;
use crate::geometry::Geometry;
use crate::params::ValidatedQuery;
use crate::transport::{ApiRequest, Transport, urljoin};

/// Concurrent record-page fetches after a search.
pub const DEFAULT_METADATA_WORKERS: usize = 4;

/// Search URL bound to one collection; re-derived whenever the collection changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEndpoint {
    pub url: String,
    pub collection: Collection,
}

impl SearchEndpoint {
    pub fn for_collection(base_url: &str, collection: Collection) -> Self {
        Self {
            url: urljoin(base_url, "search"),
            collection,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub collection: Collection,
    /// Server page order, not deduplicated.
    pub records: Vec<Record>,
    pub total_reported: Option<u64>,
    /// Records dropped because their payload could not be decoded or their
    /// metadata page could not be fetched.
    pub skipped: usize,
    pub pages: usize,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record_ids(&self) -> Vec<RecordId> {
        self.records.iter().map(|r| r.record_id.clone()).collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPage {
    #[serde(default)]
    total_results: Option<u64>,
    #[serde(default)]
    results: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    record_id: RecordId,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    title: Option<String>,
    geometry: Geometry,
    #[serde(default)]
    thumbnail_url: Option<String>,
    #[serde(default)]
    this_record_url: Option<String>,
    #[serde(default)]
    metadata: Vec<Vec<Value>>,
}

pub struct QueryEngine<'a, T: Transport> {
    session: &'a AuthSession<T>,
    endpoint: SearchEndpoint,
    page_size: usize,
    metadata_workers: usize,
}

impl<'a, T: Transport> QueryEngine<'a, T> {
    pub fn new(session: &'a AuthSession<T>, endpoint: SearchEndpoint, page_size: usize) -> Self {
        Self {
            session,
            endpoint,
            page_size: page_size.max(1),
            metadata_workers: DEFAULT_METADATA_WORKERS,
        }
    }

    /// Zero keeps only the metadata inlined in the search reply.
    pub fn with_metadata_workers(mut self, workers: usize) -> Self {
        self.metadata_workers = workers;
        self
    }

    /// Walks every result page in order. Stops once the reported total is
    /// reached or a page comes back empty.
    pub fn query(
        &self,
        query: &ValidatedQuery,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<QueryResult, EodmsError> {
        if query.collection != self.endpoint.collection {
            return Err(EodmsError::InvalidInput(format!(
                "query for {} sent to the {} search endpoint",
                query.collection, self.endpoint.collection
            )));
        }
        let query_string = query.query_string();
        debug!(collection = %query.collection, query = %query_string, "searching EODMS");

        let mut records = Vec::new();
        let mut skipped = 0usize;
        let mut pages = 0usize;
        let mut offset = 0u64;
        let mut total_reported = None;

        loop {
            cancel.check()?;
            let request = ApiRequest::get(&self.endpoint.url)
                .query("collection", query.collection.id())
                .query("query", &query_string)
                .query("maxResults", self.page_size)
                .query("firstResult", offset + 1)
                .query("format", "json");
            let page: SearchPage = self.session.request_json(&request)?;
            pages += 1;

            if page.total_results.is_some() {
                total_reported = page.total_results;
            }
            let count = page.results.len() as u64;
            if count == 0 {
                debug!(page = pages, offset, "empty page; search complete");
                break;
            }
            for raw in page.results {
                match decode_record(raw, query.collection) {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        skipped += 1;
                        warn!(error = %err, "skipping malformed search record");
                    }
                }
            }
            offset += count;
            sink.event(ProgressEvent::PageFetched {
                fetched: offset,
                total: total_reported.unwrap_or(offset),
            });

            match total_reported {
                Some(total) if offset >= total => break,
                None if count < self.page_size as u64 => break,
                _ => {}
            }
        }

        let (records, unreachable) = self.enrich(records, cancel, sink)?;
        skipped += unreachable;

        info!(
            collection = %query.collection,
            records = records.len(),
            skipped,
            pages,
            "search finished"
        );
        Ok(QueryResult {
            collection: query.collection,
            records,
            total_reported,
            skipped,
            pages,
        })
    }

    /// Fetches each record's metadata page on a small pool and merges the
    /// collection's fields into the record. A record whose page cannot be
    /// fetched is dropped and counted; an auth failure aborts the search.
    fn enrich(
        &self,
        records: Vec<Record>,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<(Vec<Record>, usize), EodmsError> {
        let total = records.iter().filter(|r| r.record_url.is_some()).count();
        let workers = self.metadata_workers.min(total);
        if workers == 0 {
            return Ok((records, 0));
        }
        debug!(records = total, workers, "fetching record metadata");

        let next = AtomicUsize::new(0);
        let fetched = AtomicUsize::new(0);
        let outcomes: Vec<Option<Result<BTreeMap<String, String>, EodmsError>>> =
            thread::scope(|scope| {
                let handles: Vec<_> = (0..workers)
                    .map(|_| {
                        scope.spawn(|| {
                            let mut done = Vec::new();
                            while !cancel.is_cancelled() {
                                let index = next.fetch_add(1, Ordering::SeqCst);
                                let Some(record) = records.get(index) else {
                                    break;
                                };
                                let Some(url) = &record.record_url else {
                                    continue;
                                };
                                done.push((index, self.fetch_metadata(url)));
                                sink.event(ProgressEvent::MetadataFetched {
                                    fetched: fetched.fetch_add(1, Ordering::SeqCst) + 1,
                                    total,
                                });
                            }
                            done
                        })
                    })
                    .collect();
                let mut outcomes: Vec<_> = records.iter().map(|_| None).collect();
                for handle in handles {
                    for (index, outcome) in handle.join().unwrap_or_default() {
                        outcomes[index] = Some(outcome);
                    }
                }
                outcomes
            });
        cancel.check()?;

        let mut kept = Vec::with_capacity(records.len());
        let mut unreachable = 0usize;
        for (mut record, outcome) in records.into_iter().zip(outcomes) {
            match outcome {
                Some(Ok(fields)) => {
                    record.metadata.extend(fields);
                    kept.push(record);
                }
                Some(Err(err)) if err.is_auth() => return Err(err),
                Some(Err(err)) => {
                    unreachable += 1;
                    warn!(record = %record.record_id, error = %err, "skipping record without metadata");
                }
                None => kept.push(record),
            }
        }
        Ok((kept, unreachable))
    }

    fn fetch_metadata(&self, url: &str) -> Result<BTreeMap<String, String>, EodmsError> {
        let request = ApiRequest::get(url).query("format", "json");
        let page: Value = self.session.request_json(&request)?;
        Ok(select_metadata(&page, self.endpoint.collection.metadata_keys()))
    }
}

/// Picks `keys` from a record page: top-level fields first, then the
/// `metadata` name/value pairs. Absent keys are left out.
fn select_metadata(page: &Value, keys: &[&str]) -> BTreeMap<String, String> {
    let pairs: Vec<&[Value]> = page
        .get("metadata")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_array)
                .map(Vec::as_slice)
                .collect()
        })
        .unwrap_or_default();
    let mut selected = BTreeMap::new();
    for key in keys {
        let value = page.get(*key).or_else(|| {
            pairs.iter().find_map(|pair| match pair {
                [Value::String(name), value, ..] if name == key => Some(value),
                _ => None,
            })
        });
        if let Some(text) = value.and_then(metadata_text) {
            selected.insert(key.to_string(), text);
        }
    }
    selected
}

fn metadata_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn decode_record(raw: Value, collection: Collection) -> Result<Record, EodmsError> {
    let raw: RawRecord =
        serde_json::from_value(raw).map_err(|err| EodmsError::Decode(err.to_string()))?;
    let mut metadata = BTreeMap::new();
    for entry in raw.metadata {
        if let [Value::String(name), value, ..] = entry.as_slice() {
            if let Some(value) = metadata_text(value) {
                metadata.insert(name.clone(), value);
            }
        }
    }
    Ok(Record {
        record_id: raw.record_id,
        uuid: raw.uuid,
        collection,
        title: raw.title,
        footprint: raw.geometry,
        thumbnail_url: raw.thumbnail_url,
        record_url: raw.this_record_url,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_metadata_pairs() {
        let raw = json!({
            "recordId": 7,
            "title": "RCM1_OK1",
            "geometry": {"type": "Point", "coordinates": [-75.0, 45.0]},
            "metadata": [["Beam Mnemonic", "SC100MA"], ["Absolute Orbit", 1234], ["Empty", null]]
        });
        let record = decode_record(raw, Collection::Rcm).unwrap();
        assert_eq!(record.record_id.as_str(), "7");
        assert_eq!(record.metadata["Beam Mnemonic"], "SC100MA");
        assert_eq!(record.metadata["Absolute Orbit"], "1234");
        assert!(!record.metadata.contains_key("Empty"));
        assert_eq!(record.granule(), Some("RCM1_OK1"));
    }

    #[test]
    fn metadata_page_fields() {
        let page = json!({
            "recordId": 12,
            "title": "RS2_OK1",
            "metadata": [["Supplier Order Number", "RS2_OK1_PK2"], ["Start Date", "2020-08-15 10:00:00"], ["Beam", null]]
        });
        let keys = Collection::Radarsat2.metadata_keys();
        let selected = select_metadata(&page, keys);
        assert_eq!(selected["Supplier Order Number"], "RS2_OK1_PK2");
        assert_eq!(selected["Start Date"], "2020-08-15 10:00:00");
        assert!(!selected.contains_key("Beam"));
        assert!(!selected.contains_key("title"));

        let rcm = select_metadata(&page, Collection::Rcm.metadata_keys());
        assert_eq!(rcm["recordId"], "12");
        assert_eq!(rcm["title"], "RS2_OK1");
    }

    #[test]
    fn record_without_geometry_is_malformed() {
        let raw = json!({"recordId": 7, "title": "x"});
        assert!(decode_record(raw, Collection::Rcm).is_err());
    }
}
