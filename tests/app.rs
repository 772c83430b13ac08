mod common;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::{Value, json};

use common::{
    MockTransport, ORDER_URL, SEARCH_URL, item_json, list_dir, ok_json, payload, search_page,
    session, test_config, utf8_dir,
};
use eodms_client::app::{Eodms, NoProgress};
use eodms_client::cancel::CancelToken;
use eodms_client::domain::{Collection, OrderId, Outcome, Priority, RecordId};
use eodms_client::download::DownloadTarget;
use eodms_client::error::EodmsError;
use eodms_client::params::SearchParameters;
use eodms_client::transport::{ApiRequest, ApiResponse, Method};

/// Search serves `records` hits; every order gets a fresh id with one ready item.
fn service(records: u64) -> MockTransport {
    let next_order = Arc::new(AtomicU64::new(40));
    MockTransport::new(move |request: &ApiRequest, _| {
        if request.url == SEARCH_URL {
            return search_page(request, records);
        }
        if request.url.starts_with("https://files.test/") {
            return Ok(ApiResponse::from_bytes(200, payload(32)));
        }
        assert_eq!(request.url, ORDER_URL);
        if request.method == Method::Post {
            let order_id = next_order.fetch_add(1, Ordering::SeqCst);
            return ok_json(json!({ "items": [{ "orderId": order_id, "itemId": order_id * 10 }] }));
        }
        let order_id: u64 = request.query_value("orderId").unwrap().parse().unwrap();
        let item_id = order_id * 10;
        let url = format!("https://files.test/dl/ITEM{item_id}.zip");
        ok_json(json!({ "items": [item_json(item_id, order_id, "AVAILABLE_FOR_DOWNLOAD", Some(&url), 32)] }))
    })
}

fn client(records: u64, collection: Collection) -> Eodms<MockTransport> {
    Eodms::new(session(service(records)), test_config(), collection)
}

#[test]
fn switching_collection_revalidates_criteria() {
    let mut eodms = client(0, Collection::PlanetScope);
    eodms
        .set_parameters(SearchParameters::new().with_filter("cloud-cover", "20"))
        .unwrap();
    assert!(eodms.available_options().contains(&"cloud-cover"));

    let result = eodms.set_collection(Collection::Rcm);

    assert_matches!(result, Err(EodmsError::Validation { option, .. }) if option == "cloud-cover");
    assert_eq!(eodms.collection(), Collection::PlanetScope);
    assert_eq!(eodms.search_endpoint().collection, Collection::PlanetScope);
    assert_eq!(eodms.validated().unwrap().collection, Collection::PlanetScope);
}

#[test]
fn switching_collection_clears_results() {
    let mut eodms = client(3, Collection::Rcm);
    eodms.query(&CancelToken::new(), &NoProgress).unwrap();
    assert_eq!(eodms.results().unwrap().len(), 3);

    eodms.set_collection(Collection::Radarsat2).unwrap();

    assert!(eodms.results().is_none());
    assert_eq!(eodms.search_endpoint().collection, Collection::Radarsat2);
    assert_eq!(eodms.search_endpoint().url, SEARCH_URL);
}

#[test]
fn query_collection_switches_with_new_criteria() {
    let mut eodms = client(4, Collection::Rcm);
    eodms
        .set_parameters(SearchParameters::new().with_filter("polarization", "HH"))
        .unwrap();

    let result = eodms
        .query_collection(
            Collection::PlanetScope,
            SearchParameters::new().with_filter("cloud-cover", "10"),
            &CancelToken::new(),
            &NoProgress,
        )
        .unwrap();

    assert_eq!(result.collection, Collection::PlanetScope);
    assert_eq!(result.len(), 4);
    assert_eq!(eodms.collection(), Collection::PlanetScope);
    let request = &eodms.session().transport().requests_to(SEARCH_URL)[0];
    assert_eq!(request.query_value("collection"), Some("PlanetScope"));
    assert!(request.query_value("query").unwrap().contains("CLOUD_PERCENT<=10"));
}

#[test]
fn invalid_query_collection_changes_nothing() {
    let mut eodms = client(4, Collection::Rcm);

    let result = eodms.query_collection(
        Collection::PlanetScope,
        SearchParameters::new().with_filter("polarization", "HH"),
        &CancelToken::new(),
        &NoProgress,
    );

    assert_matches!(result, Err(EodmsError::Validation { .. }));
    assert_eq!(eodms.collection(), Collection::Rcm);
    assert!(eodms.session().transport().requests().is_empty());
}

#[test]
fn ordering_needs_results() {
    let mut eodms = client(0, Collection::Rcm);

    assert_matches!(
        eodms.order_results(Priority::Medium, &CancelToken::new(), &NoProgress),
        Err(EodmsError::InvalidInput(_))
    );
    assert!(eodms.last_order().is_none());
}

#[test]
fn search_order_download_round() {
    let mut eodms = client(60, Collection::Rcm);
    let cancel = CancelToken::new();

    eodms.query(&cancel, &NoProgress).unwrap();
    let order = eodms
        .order_results(Priority::Urgent, &cancel, &NoProgress)
        .unwrap();
    assert_eq!(order.batches, 2);
    assert_eq!(order.order_ids.len(), 2);
    let posted = eodms.session().transport().requests();
    let first_post = posted
        .iter()
        .find(|r| r.method == Method::Post)
        .unwrap();
    assert_eq!(first_post.body.as_ref().unwrap()["items"][0]["priority"], "Urgent");

    let temp = tempfile::tempdir().unwrap();
    let dir = utf8_dir(&temp).join("products");
    let report = eodms
        .download_last_order(&dir, Some(2), &cancel, &NoProgress)
        .unwrap();

    assert_eq!(report.outcome(), Outcome::Succeeded);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(list_dir(&dir), vec!["ITEM400.zip", "ITEM410.zip"]);
}

#[test]
fn download_without_an_order_is_rejected() {
    let eodms = client(0, Collection::Rcm);
    let temp = tempfile::tempdir().unwrap();

    assert_matches!(
        eodms.download_last_order(&utf8_dir(&temp), None, &CancelToken::new(), &NoProgress),
        Err(EodmsError::InvalidInput(_))
    );
}

#[test]
fn explicit_record_ids_are_ordered() {
    let mut eodms = client(0, Collection::Radarsat1);
    let ids: Vec<RecordId> = (7..=9).map(RecordId::from).collect();

    let order = eodms
        .order(&ids, Priority::Low, &CancelToken::new(), &NoProgress)
        .unwrap();

    assert_eq!(order.outcome(), Outcome::Succeeded);
    let request = &eodms.session().transport().requests_to(ORDER_URL)[0];
    let item = &request.body.as_ref().unwrap()["items"][2];
    assert_eq!(item["collectionId"], "Radarsat1");
    assert_eq!(item["recordId"], "9");
}

#[test]
fn results_are_written_as_geojson() {
    let mut eodms = client(5, Collection::Rcm);
    eodms.query(&CancelToken::new(), &NoProgress).unwrap();
    let temp = tempfile::tempdir().unwrap();
    let path = utf8_dir(&temp).join("results.geojson");

    let written = eodms.write_results(&path).unwrap();

    assert_eq!(written, 5);
    let document: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(document["type"], "FeatureCollection");
    let features = document["features"].as_array().unwrap();
    assert_eq!(features.len(), 5);
    assert_eq!(features[0]["geometry"]["type"], "Polygon");
    assert_eq!(features[0]["properties"]["EODMS RecordId"], "1");
    assert_eq!(features[0]["properties"]["collection"], "RCMImageProducts");
}

#[test]
fn empty_results_write_an_empty_collection() {
    let eodms = client(0, Collection::Rcm);
    let temp = tempfile::tempdir().unwrap();
    let path = utf8_dir(&temp).join("empty.geojson");

    assert_eq!(eodms.write_results(&path).unwrap(), 0);
    let document: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(document["features"], json!([]));
}

/// Peak number of file transfers running at once when one order of six
/// ready items is downloaded with `max_workers`.
fn peak_transfers(max_workers: Option<usize>) -> usize {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (running, highest) = (Arc::clone(&current), Arc::clone(&peak));
    let transport = MockTransport::new(move |request: &ApiRequest, _| {
        if request.url.starts_with("https://files.test/") {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            highest.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            running.fetch_sub(1, Ordering::SeqCst);
            return Ok(ApiResponse::from_bytes(200, payload(16)));
        }
        let items: Vec<Value> = (1..=6)
            .map(|id| {
                let url = format!("https://files.test/dl/ITEM{id}.zip");
                item_json(id, 900, "AVAILABLE_FOR_DOWNLOAD", Some(&url), 16)
            })
            .collect();
        ok_json(json!({ "items": items }))
    });
    let eodms = Eodms::new(session(transport), test_config(), Collection::Rcm);
    let temp = tempfile::tempdir().unwrap();

    let report = eodms
        .download(
            &[DownloadTarget::Order(OrderId::from(900))],
            &utf8_dir(&temp),
            max_workers,
            &CancelToken::new(),
            &NoProgress,
        )
        .unwrap();

    assert_eq!(report.succeeded(), 6);
    peak.load(Ordering::SeqCst)
}

#[test]
fn max_workers_argument_overrides_the_configured_pool() {
    assert_eq!(test_config().download.max_workers, 3);
    assert_eq!(peak_transfers(Some(2)), 2);
    assert_eq!(peak_transfers(Some(1)), 1);
    assert_eq!(peak_transfers(Some(0)), 1);
}
