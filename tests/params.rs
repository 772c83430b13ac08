use std::collections::BTreeSet;

use assert_matches::assert_matches;
use chrono::{DateTime, TimeZone, Utc};

use eodms_client::domain::Collection;
use eodms_client::error::EodmsError;
use eodms_client::geometry::{GeometryValue, SearchGeometry};
use eodms_client::params::{
    FieldSpec, ParameterValidator, SearchParameters, ValueRule, allowed_options, field_table,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 8, 30, 12, 0, 0).unwrap()
}

fn sample_value(spec: &FieldSpec) -> String {
    match spec.rule {
        ValueRule::Text => "sample".to_string(),
        ValueRule::UpperText => "grd".to_string(),
        ValueRule::Choice(choices) => choices[0].to_string(),
        ValueRule::Float { min, max, .. } => ((min + max) / 2.0).to_string(),
        ValueRule::Integer { min, .. } => (min + 5).to_string(),
        ValueRule::Flag => "true".to_string(),
    }
}

#[test]
fn every_table_entry_is_accepted() {
    for collection in Collection::ALL {
        for spec in field_table(collection) {
            let params = SearchParameters::new().with_filter(spec.option, sample_value(spec));
            let query = ParameterValidator::validate(collection, &params, now())
                .unwrap_or_else(|err| panic!("{collection} {}: {err}", spec.option));
            assert_eq!(query.filters.len(), 1);
            assert_eq!(query.filters[0].field, spec.field);
        }
    }
}

#[test]
fn options_outside_the_table_are_rejected_by_name() {
    let every_option: BTreeSet<&str> = Collection::ALL
        .iter()
        .flat_map(|c| allowed_options(*c))
        .collect();
    for collection in Collection::ALL {
        let allowed = allowed_options(collection);
        for option in every_option.iter().filter(|o| !allowed.contains(*o)) {
            let params = SearchParameters::new().with_filter(option, "1");
            assert_matches!(
                ParameterValidator::validate(collection, &params, now()),
                Err(EodmsError::Validation { option: named, .. }) if named == *option,
                "{collection} accepted {option}"
            );
        }
    }
}

#[test]
fn sar_options_on_optical_collection() {
    let params = SearchParameters::new().with_filter("polarization", "HH");
    let err = ParameterValidator::validate(Collection::PlanetScope, &params, now()).unwrap_err();
    assert_matches!(
        &err,
        EodmsError::Validation { option, message, .. }
            if option == "polarization" && message.contains("SAR")
    );
}

#[test]
fn choices_are_exact_sets() {
    let ok = SearchParameters::new()
        .with_filter("polarization", "hh/hv")
        .with_filter("orbit_direction", "descending");
    let query = ParameterValidator::validate(Collection::Rcm, &ok, now()).unwrap();
    let clauses: Vec<String> = query.filters.iter().map(|f| f.clause()).collect();
    assert!(clauses.contains(&"RCM.POLARIZATION='HH HV'".to_string()));
    assert!(clauses.contains(&"RCM.ORBIT_DIRECTION='Descending'".to_string()));

    let bad = SearchParameters::new().with_filter("polarization", "HX");
    assert_matches!(
        ParameterValidator::validate(Collection::Rcm, &bad, now()),
        Err(EodmsError::Validation { option, accepted, .. })
            if option == "polarization" && accepted.contains("HH HV VH VV")
    );

    let format = SearchParameters::new().with_filter("product-format", "GeoTIFF");
    assert_matches!(
        ParameterValidator::validate(Collection::Radarsat2, &format, now()),
        Err(EodmsError::Validation { option, .. }) if option == "product-format"
    );
}

#[test]
fn numeric_ranges() {
    let cloud = SearchParameters::new().with_filter("cloud-cover", "101");
    assert_matches!(
        ParameterValidator::validate(Collection::PlanetScope, &cloud, now()),
        Err(EodmsError::Validation { option, .. }) if option == "cloud-cover"
    );
    let cloud = SearchParameters::new().with_filter("cloud-cover", "many");
    assert_matches!(
        ParameterValidator::validate(Collection::PlanetScope, &cloud, now()),
        Err(EodmsError::Validation { .. })
    );

    let inverted = SearchParameters::new()
        .with_filter("incidence-angle-low", "40")
        .with_filter("incidence-angle-high", "20");
    assert_matches!(
        ParameterValidator::validate(Collection::Rcm, &inverted, now()),
        Err(EodmsError::Validation { option, .. }) if option == "incidence-angle-high"
    );

    let planet = SearchParameters::new()
        .with_filter("incidence-angle-low", "10.7")
        .with_filter("incidence-angle-high", "20.2")
        .with_filter("cloud-cover", "35.9");
    let query = ParameterValidator::validate(Collection::PlanetScope, &planet, now()).unwrap();
    let text = query.query_string();
    assert!(text.contains("SENSOR_BEAM_CONFIG.INCIDENCE_LOW>=10"));
    assert!(text.contains("SENSOR_BEAM_CONFIG.INCIDENCE_HIGH<=21"));
    assert!(text.contains("SATOPT.CLOUD_PERCENT<=35"));
}

#[test]
fn single_value_options_reject_lists() {
    let params = SearchParameters::new()
        .with_filter("orbit-direction", "Ascending")
        .with_filter("orbit-direction", "Descending");
    assert_matches!(
        ParameterValidator::validate(Collection::Rcm, &params, now()),
        Err(EodmsError::Validation { option, .. }) if option == "orbit-direction"
    );

    let params = SearchParameters::new()
        .with_filter("beam-mnemonic", "SC100MA")
        .with_filter("beam-mnemonic", "SC30MCP");
    let query = ParameterValidator::validate(Collection::Rcm, &params, now()).unwrap();
    assert_eq!(
        query.filters[0].clause(),
        "RCM.BEAM_MNEMONIC='SC100MA','SC30MCP'"
    );
}

#[test]
fn time_window_and_geometry() {
    let polygon = GeometryValue::Polygon(vec![vec![
        vec![-76.0, 45.0],
        vec![-75.0, 45.0],
        vec![-75.0, 46.0],
        vec![-76.0, 45.0],
    ]]);
    let params = SearchParameters::new()
        .with_start("2020-08-15")
        .with_end("2020-08-22")
        .with_geometry(SearchGeometry::single(polygon));
    let query = ParameterValidator::validate(Collection::Rcm, &params, now()).unwrap();
    let text = query.query_string();
    assert!(text.starts_with("CATALOG_IMAGE.START_DATETIME>='2020-08-15T00:00:00'"));
    assert!(text.contains("CATALOG_IMAGE.STOP_DATETIME<='2020-08-23T00:00:00'"));
    assert!(text.contains("CATALOG_IMAGE.THE_GEOM_4326 INTERSECTS POLYGON (("));

    let reversed = SearchParameters::new()
        .with_start("2020-08-22")
        .with_end("2020-08-15");
    assert_matches!(
        ParameterValidator::validate(Collection::Rcm, &reversed, now()),
        Err(EodmsError::Validation { option, .. }) if option == "start"
    );

    let garbage = SearchParameters::new().with_start("last tuesday");
    assert_matches!(
        ParameterValidator::validate(Collection::Rcm, &garbage, now()),
        Err(EodmsError::Validation { option, .. }) if option == "start"
    );
}
