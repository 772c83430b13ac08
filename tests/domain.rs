use assert_matches::assert_matches;

use eodms_client::domain::{
    Collection, ItemId, ItemStatus, Order, OrderId, OrderItem, Outcome, Priority, RecordId,
};
use eodms_client::download::DownloadTarget;
use eodms_client::error::EodmsError;

#[test]
fn collection_ids_round_trip_through_parsing() {
    for collection in Collection::ALL {
        assert_eq!(collection.id().parse::<Collection>().unwrap(), collection);
    }
    let ids: Vec<&str> = Collection::ALL.iter().map(Collection::id).collect();
    assert_eq!(
        ids,
        vec!["RCMImageProducts", "Radarsat1", "Radarsat2", "PlanetScope", "NAPL"]
    );
}

#[test]
fn only_radar_collections_are_sar() {
    let sar: Vec<Collection> = Collection::ALL.into_iter().filter(Collection::is_sar).collect();
    assert_eq!(
        sar,
        vec![Collection::Rcm, Collection::Radarsat1, Collection::Radarsat2]
    );
}

#[test]
fn priority_parsing() {
    assert_eq!("urgent".parse::<Priority>().unwrap(), Priority::Urgent);
    assert_eq!(" High ".parse::<Priority>().unwrap(), Priority::High);
    assert_eq!(Priority::default(), Priority::Medium);
    assert_matches!(
        "asap".parse::<Priority>(),
        Err(EodmsError::Validation { option, .. }) if option == "priority"
    );
}

#[test]
fn service_statuses() {
    assert_eq!(
        ItemStatus::from_service("AVAILABLE_FOR_DOWNLOAD"),
        ItemStatus::Available
    );
    assert_eq!(ItemStatus::from_service("submitted"), ItemStatus::Submitted);
    assert_eq!(ItemStatus::from_service("DELIVERED"), ItemStatus::Downloaded);
    assert_eq!(ItemStatus::from_service("CANCELLED"), ItemStatus::Failed);
    assert_eq!(ItemStatus::from_service("EXPIRED"), ItemStatus::Expired);
    assert_eq!(ItemStatus::from_service("PROCESSING"), ItemStatus::Processing);
    assert_eq!(
        ItemStatus::from_service("SOMETHING_NEW"),
        ItemStatus::Processing
    );
}

#[test]
fn identifiers() {
    let record: RecordId = " 13110 ".parse().unwrap();
    assert_eq!(record.as_str(), "13110");
    assert_eq!(OrderId::from(42).to_string(), "42");
    assert_matches!("".parse::<ItemId>(), Err(EodmsError::InvalidId(_)));
    assert_matches!("1 2".parse::<OrderId>(), Err(EodmsError::InvalidId(_)));
}

#[test]
fn download_targets_display_as_they_parse() {
    for text in ["order:5", "item:77"] {
        let target: DownloadTarget = text.parse().unwrap();
        assert_eq!(target.to_string(), text);
    }
}

#[test]
fn outcome_from_counts() {
    assert_eq!(Outcome::from_counts(3, 0), Outcome::Succeeded);
    assert_eq!(Outcome::from_counts(0, 0), Outcome::Succeeded);
    assert_eq!(Outcome::from_counts(1, 1), Outcome::PartiallySucceeded);
    assert_eq!(Outcome::from_counts(0, 2), Outcome::Failed);
}

#[test]
fn items_group_by_order() {
    let item = |item_id: u64, order_id: u64| OrderItem {
        item_id: ItemId::from(item_id),
        order_id: OrderId::from(order_id),
        record_id: None,
        status: ItemStatus::Processing,
        download_url: None,
        size: None,
    };

    let orders = Order::group(vec![item(1, 9), item(2, 8), item(3, 9)]);

    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].order_id, OrderId::from(9));
    assert_eq!(orders[0].items.len(), 2);
    assert_eq!(orders[1].items[0].item_id, ItemId::from(2));
}
