use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

use crate::domain::Collection;
use crate::error::EodmsError;
use crate::geometry::SearchGeometry;

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const GEOMETRY_FIELD: &str = "CATALOG_IMAGE.THE_GEOM_4326";

/// How a numeric value is rendered into the query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberFormat {
    Plain,
    OneDecimal,
    Floor,
    Ceil,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueRule {
    /// Free text, quoted.
    Text,
    /// Free text, upper-cased and quoted.
    UpperText,
    /// One of a fixed literal set, matched case-insensitively.
    Choice(&'static [&'static str]),
    Float {
        min: f64,
        max: f64,
        format: NumberFormat,
    },
    Integer {
        min: i64,
        max: i64,
    },
    /// true/false rendered as 't'/'f'.
    Flag,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub option: &'static str,
    pub field: &'static str,
    pub comparator: &'static str,
    pub rule: ValueRule,
    pub multiple: bool,
    pub description: &'static str,
}

const fn field(
    option: &'static str,
    field: &'static str,
    comparator: &'static str,
    rule: ValueRule,
    multiple: bool,
    description: &'static str,
) -> FieldSpec {
    FieldSpec {
        option,
        field,
        comparator,
        rule,
        multiple,
        description,
    }
}

const ORBIT_DIRECTIONS: &[&str] = &["Ascending", "Descending"];
const LOOK_DIRECTIONS: &[&str] = &["Left", "Right"];
const PRODUCT_FORMATS: &[&str] = &["GeoTIFF", "NITF21"];
const RCM_POLARIZATIONS: &[&str] = &[
    "CH CV",
    "HH",
    "HH HV",
    "HH HV VH VV",
    "HH VV",
    "HV",
    "VH",
    "VH VV",
    "VV",
];

const ANGLE: ValueRule = ValueRule::Float {
    min: 0.0,
    max: 90.0,
    format: NumberFormat::Plain,
};
const ANGLE_BOUND: ValueRule = ValueRule::Float {
    min: 0.0,
    max: 90.0,
    format: NumberFormat::OneDecimal,
};
const ORBIT: ValueRule = ValueRule::Integer {
    min: 0,
    max: i64::MAX,
};

/// Options that only make sense for synthetic-aperture radar collections.
pub const SAR_ONLY_OPTIONS: &[&str] = &[
    "polarization",
    "beam-mode",
    "beam-mnemonic",
    "orbit-direction",
    "look-direction",
    "downlink-segment",
    "absolute-orbit",
    "relative-orbit",
    "incidence-angle",
];

static COMMON_FIELDS: &[FieldSpec] = &[field(
    "product-type",
    "ARCHIVE_IMAGE.PRODUCT_TYPE",
    "=",
    ValueRule::UpperText,
    true,
    "product type (e.g. SLC, GRD)",
)];

static RCM_FIELDS: &[FieldSpec] = &[
    field("beam-mode", "RCM.SBEAM", "=", ValueRule::Text, true, "SAR beam mode (e.g. Low Resolution 100m)"),
    field("beam-mnemonic", "RCM.BEAM_MNEMONIC", "=", ValueRule::Text, true, "SAR beam mode mnemonic (e.g. SC100MA)"),
    field("product-format", "PRODUCT_FORMAT.FORMAT_NAME_E", "=", ValueRule::Choice(PRODUCT_FORMATS), false, "data format"),
    field("look-direction", "RCM.ANTENNA_ORIENTATION", "=", ValueRule::Choice(LOOK_DIRECTIONS), false, "antenna look direction"),
    field("polarization", "RCM.POLARIZATION", "=", ValueRule::Choice(RCM_POLARIZATIONS), true, "SAR beam polarization (e.g. HH, HH HV)"),
    field("incidence-angle", "RCM.INCIDENCE_ANGLE", "=", ANGLE, false, "exact SAR incidence angle"),
    field("incidence-angle-low", "SENSOR_BEAM_CONFIG.INCIDENCE_LOW", ">=", ANGLE_BOUND, false, "lower bound for incidence angle"),
    field("incidence-angle-high", "SENSOR_BEAM_CONFIG.INCIDENCE_HIGH", "<=", ANGLE_BOUND, false, "upper bound for incidence angle"),
    field("orbit-direction", "RCM.ORBIT_DIRECTION", "=", ValueRule::Choice(ORBIT_DIRECTIONS), false, "orbit direction"),
    field("absolute-orbit", "RCM.ORBIT_ABS", "=", ORBIT, true, "absolute orbit number"),
    field("relative-orbit", "RCM.ORBIT_REL", "=", ORBIT, true, "relative orbit number"),
    field("downlink-segment", "RCM.DOWNLINK_SEGMENT_ID", "=", ValueRule::Text, false, "RCM downlink segment"),
];

static RSAT2_FIELDS: &[FieldSpec] = &[
    field("beam-mode", "RSAT2.SBEAM", "=", ValueRule::Text, true, "SAR beam mode (e.g. ScanSAR Wide)"),
    field("beam-mnemonic", "RSAT2.BEAM_MNEMONIC", "=", ValueRule::Text, true, "SAR beam mode mnemonic (e.g. SCWA)"),
    field("look-direction", "RSAT2.ANTENNA_ORIENTATION", "=", ValueRule::Choice(LOOK_DIRECTIONS), false, "antenna look direction"),
    field("incidence-angle", "RSAT2.INCIDENCE_ANGLE", "=", ANGLE, false, "exact SAR incidence angle"),
    field("incidence-angle-low", "SENSOR_BEAM_CONFIG.INCIDENCE_LOW", ">=", ANGLE_BOUND, false, "lower bound for incidence angle"),
    field("incidence-angle-high", "SENSOR_BEAM_CONFIG.INCIDENCE_HIGH", "<=", ANGLE_BOUND, false, "upper bound for incidence angle"),
    field("orbit-direction", "RSAT2.ORBIT_DIRECTION", "=", ValueRule::Choice(ORBIT_DIRECTIONS), false, "orbit direction"),
    field("absolute-orbit", "RSAT2.ORBIT_ABS", "=", ORBIT, true, "absolute orbit number"),
    field("relative-orbit", "RSAT2.ORBIT_REL", "=", ORBIT, true, "relative orbit number"),
];

static RSAT1_FIELDS: &[FieldSpec] = &[
    field("beam-mnemonic", "RSAT1.BEAM_MNEMONIC", "=", ValueRule::Text, true, "SAR beam mode mnemonic (e.g. SCWA)"),
    field("look-direction", "RSAT1.ANTENNA_ORIENTATION", "=", ValueRule::Choice(LOOK_DIRECTIONS), false, "antenna look direction"),
    field("incidence-angle", "RSAT1.INCIDENCE_ANGLE", "=", ANGLE, false, "exact SAR incidence angle"),
    field("incidence-angle-low", "SENSOR_BEAM_CONFIG.INCIDENCE_LOW", ">=", ANGLE_BOUND, false, "lower bound for incidence angle"),
    field("incidence-angle-high", "SENSOR_BEAM_CONFIG.INCIDENCE_HIGH", "<=", ANGLE_BOUND, false, "upper bound for incidence angle"),
    field("orbit-direction", "RSAT1.ORBIT_DIRECTION", "=", ValueRule::Choice(ORBIT_DIRECTIONS), false, "orbit direction"),
    field("absolute-orbit", "RSAT1.ORBIT_ABS", "=", ORBIT, true, "absolute orbit number"),
];

static PLANET_FIELDS: &[FieldSpec] = &[
    field(
        "cloud-cover",
        "SATOPT.CLOUD_PERCENT",
        "<=",
        ValueRule::Float { min: 0.0, max: 100.0, format: NumberFormat::Floor },
        false,
        "maximum allowable percent cloud cover",
    ),
    field(
        "incidence-angle-low",
        "SENSOR_BEAM_CONFIG.INCIDENCE_LOW",
        ">=",
        ValueRule::Float { min: 0.0, max: 90.0, format: NumberFormat::Floor },
        false,
        "lower bound for incidence angle",
    ),
    field(
        "incidence-angle-high",
        "SENSOR_BEAM_CONFIG.INCIDENCE_HIGH",
        "<=",
        ValueRule::Float { min: 0.0, max: 90.0, format: NumberFormat::Ceil },
        false,
        "upper bound for incidence angle",
    ),
];

static NAPL_FIELDS: &[FieldSpec] = &[
    field("roll-number", "ROLL.ROLL_NUMBER", "=", ValueRule::Text, false, "air photo roll number (e.g. A28523)"),
    field("photo-number", "PHOTO.PHOTO_NUMBER", "=", ValueRule::Text, false, "air photo number (e.g. 0016)"),
    field("open-data", "CATALOG_IMAGE.OPEN_DATA", "=", ValueRule::Flag, false, "restrict to no-cost photos"),
];

fn collection_fields(collection: Collection) -> &'static [FieldSpec] {
    match collection {
        Collection::Rcm => RCM_FIELDS,
        Collection::Radarsat2 => RSAT2_FIELDS,
        Collection::Radarsat1 => RSAT1_FIELDS,
        Collection::PlanetScope => PLANET_FIELDS,
        Collection::Napl => NAPL_FIELDS,
    }
}

/// Filter options accepted for `collection`, common options first.
pub fn field_table(collection: Collection) -> Vec<&'static FieldSpec> {
    COMMON_FIELDS
        .iter()
        .chain(collection_fields(collection))
        .collect()
}

pub fn allowed_options(collection: Collection) -> Vec<&'static str> {
    field_table(collection).iter().map(|f| f.option).collect()
}

/// Canonical option spelling: lower-case, dashes instead of underscores.
pub fn normalize_option(option: &str) -> String {
    let normalized = option.trim().to_lowercase().replace('_', "-");
    match normalized.as_str() {
        "mnemonic" => "beam-mnemonic".to_string(),
        _ => normalized,
    }
}

/// Caller-side search criteria, not yet checked against a collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchParameters {
    pub start: Option<String>,
    pub end: Option<String>,
    pub geometry: Option<SearchGeometry>,
    pub filters: BTreeMap<String, Vec<String>>,
}

impl SearchParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start(mut self, start: impl Into<String>) -> Self {
        self.start = Some(start.into());
        self
    }

    pub fn with_end(mut self, end: impl Into<String>) -> Self {
        self.end = Some(end.into());
        self
    }

    pub fn with_geometry(mut self, geometry: SearchGeometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn with_filter(mut self, option: &str, value: impl Into<String>) -> Self {
        self.filters
            .entry(normalize_option(option))
            .or_default()
            .push(value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none()
            && self.end.is_none()
            && self.geometry.is_none()
            && self.filters.is_empty()
    }
}

/// One service-ready filter clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFilter {
    pub option: &'static str,
    pub field: &'static str,
    pub comparator: &'static str,
    pub values: Vec<String>,
}

impl FieldFilter {
    pub fn clause(&self) -> String {
        format!("{}{}{}", self.field, self.comparator, self.values.join(","))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    pub collection: Collection,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub filters: Vec<FieldFilter>,
    pub geometry_wkt: Option<String>,
}

impl ValidatedQuery {
    /// The `query` parameter of a search request: clauses joined with AND.
    pub fn query_string(&self) -> String {
        let mut clauses = vec![
            format!(
                "CATALOG_IMAGE.START_DATETIME>='{}'",
                self.start.format(DATETIME_FORMAT)
            ),
            format!(
                "CATALOG_IMAGE.STOP_DATETIME<='{}'",
                self.end.format(DATETIME_FORMAT)
            ),
        ];
        if let Some(wkt) = &self.geometry_wkt {
            clauses.push(format!("{GEOMETRY_FIELD} INTERSECTS {wkt}"));
        }
        clauses.extend(self.filters.iter().map(FieldFilter::clause));
        clauses.join(" AND ")
    }
}

pub struct ParameterValidator;

impl ParameterValidator {
    /// Checks `params` against the field table of `collection`. Pure: `now`
    /// anchors the default and relative time window.
    pub fn validate(
        collection: Collection,
        params: &SearchParameters,
        now: DateTime<Utc>,
    ) -> Result<ValidatedQuery, EodmsError> {
        let (start, end) = resolve_window(params.start.as_deref(), params.end.as_deref(), now)?;
        let table = field_table(collection);

        let mut filters = Vec::new();
        let mut bounds: BTreeMap<&'static str, f64> = BTreeMap::new();
        for (raw_option, values) in &params.filters {
            let option = normalize_option(raw_option);
            let spec = match table.iter().find(|f| f.option == option) {
                Some(spec) => *spec,
                None if !collection.is_sar() && SAR_ONLY_OPTIONS.contains(&option.as_str()) => {
                    return Err(EodmsError::validation(
                        &option,
                        format!("only valid for SAR collections, not {collection}"),
                        &allowed_options(collection),
                    ));
                }
                None => {
                    return Err(EodmsError::validation(
                        &option,
                        format!("not a search option for {collection}"),
                        &allowed_options(collection),
                    ));
                }
            };
            if values.is_empty() {
                return Err(EodmsError::validation(
                    spec.option,
                    "no value given",
                    &accepted_for(spec),
                ));
            }
            if values.len() > 1 && !spec.multiple {
                return Err(EodmsError::validation(
                    spec.option,
                    "accepts a single value",
                    &accepted_for(spec),
                ));
            }
            let mut rendered = Vec::with_capacity(values.len());
            for value in values {
                let (literal, number) = render_value(spec, value)?;
                if let Some(number) = number {
                    bounds.insert(spec.option, number);
                }
                rendered.push(literal);
            }
            filters.push(FieldFilter {
                option: spec.option,
                field: spec.field,
                comparator: spec.comparator,
                values: rendered,
            });
        }

        if let (Some(low), Some(high)) = (
            bounds.get("incidence-angle-low"),
            bounds.get("incidence-angle-high"),
        ) {
            if high < low {
                return Err(EodmsError::validation(
                    "incidence-angle-high",
                    format!("{high} is below incidence-angle-low {low}"),
                    &[],
                ));
            }
        }

        let geometry_wkt = params
            .geometry
            .as_ref()
            .map(SearchGeometry::to_wkt)
            .transpose()?;

        Ok(ValidatedQuery {
            collection,
            start,
            end,
            filters,
            geometry_wkt,
        })
    }
}

fn accepted_for(spec: &FieldSpec) -> Vec<&'static str> {
    match spec.rule {
        ValueRule::Choice(choices) => choices.to_vec(),
        ValueRule::Flag => vec!["true", "false"],
        _ => Vec::new(),
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn range_error(spec: &FieldSpec, value: &str, expected: String) -> EodmsError {
    EodmsError::validation(
        spec.option,
        format!("`{value}` is not {expected}"),
        &accepted_for(spec),
    )
}

/// Renders one raw value into its query literal; numeric values also come
/// back parsed for cross-field checks.
fn render_value(spec: &FieldSpec, raw: &str) -> Result<(String, Option<f64>), EodmsError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(EodmsError::validation(
            spec.option,
            "empty value",
            &accepted_for(spec),
        ));
    }
    match spec.rule {
        ValueRule::Text => Ok((quote(value), None)),
        ValueRule::UpperText => Ok((quote(&value.to_uppercase()), None)),
        ValueRule::Choice(choices) => {
            let wanted = choice_key(value);
            choices
                .iter()
                .find(|choice| choice_key(choice) == wanted)
                .map(|choice| (quote(choice), None))
                .ok_or_else(|| {
                    EodmsError::validation(
                        spec.option,
                        format!("`{value}` is not an accepted value"),
                        choices,
                    )
                })
        }
        ValueRule::Float { min, max, format } => {
            let number: f64 = value
                .parse()
                .ok()
                .filter(|n: &f64| n.is_finite())
                .ok_or_else(|| range_error(spec, value, "a number".to_string()))?;
            if number < min || number > max {
                return Err(range_error(
                    spec,
                    value,
                    format!("between {min} and {max}"),
                ));
            }
            let literal = match format {
                NumberFormat::Plain => format!("{number:.6}"),
                NumberFormat::OneDecimal => format!("{number:.1}"),
                NumberFormat::Floor => format!("{}", number.floor() as i64),
                NumberFormat::Ceil => format!("{}", number.ceil() as i64),
            };
            Ok((literal, Some(number)))
        }
        ValueRule::Integer { min, max } => {
            let number: i64 = value
                .parse()
                .map_err(|_| range_error(spec, value, "a whole number".to_string()))?;
            if number < min || number > max {
                return Err(range_error(
                    spec,
                    value,
                    format!("between {min} and {max}"),
                ));
            }
            Ok((number.to_string(), Some(number as f64)))
        }
        ValueRule::Flag => match value.to_lowercase().as_str() {
            "true" | "t" | "yes" | "1" => Ok((quote("t"), None)),
            "false" | "f" | "no" | "0" => Ok((quote("f"), None)),
            _ => Err(EodmsError::validation(
                spec.option,
                format!("`{value}` is not a boolean"),
                &["true", "false"],
            )),
        },
    }
}

/// Polarizations are written with spaces or slashes interchangeably.
fn choice_key(value: &str) -> String {
    value
        .split(|c: char| c == '/' || c == '+' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

enum TimeBound {
    Start,
    End,
}

fn resolve_window(
    start: Option<&str>,
    end: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), EodmsError> {
    let end = match end {
        Some(raw) => parse_time(raw, TimeBound::End, now)?,
        None => now,
    };
    let start = match start {
        Some(raw) => parse_time(raw, TimeBound::Start, now)?,
        None => end - Duration::hours(24),
    };
    if start >= end {
        return Err(EodmsError::validation(
            "start",
            format!(
                "{} is not before end {}",
                start.format(DATETIME_FORMAT),
                end.format(DATETIME_FORMAT)
            ),
            &[],
        ));
    }
    Ok((start, end))
}

/// Accepts TODAY, TODAY-N (days), RFC 3339, naive datetimes and plain dates.
/// A plain end date covers that whole day.
fn parse_time(raw: &str, bound: TimeBound, now: DateTime<Utc>) -> Result<DateTime<Utc>, EodmsError> {
    let option = match bound {
        TimeBound::Start => "start",
        TimeBound::End => "end",
    };
    let value = raw.trim();
    let upper = value.to_uppercase();
    if upper == "TODAY" {
        return Ok(now);
    }
    if let Some(days) = upper.strip_prefix("TODAY-") {
        return days
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(Duration::try_days)
            .map(|offset| now - offset)
            .ok_or_else(|| {
                EodmsError::validation(option, format!("`{value}` has no valid day count"), &[])
            });
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in [DATETIME_FORMAT, "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(parsed.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let date = match bound {
            TimeBound::Start => date,
            TimeBound::End => date.succ_opt().unwrap_or(date),
        };
        return Ok(date.and_time(chrono::NaiveTime::MIN).and_utc());
    }
    Err(EodmsError::validation(
        option,
        format!("`{value}` is not a recognized date or time"),
        &["TODAY", "TODAY-N", "YYYY-MM-DD", "YYYY-MM-DDTHH:MM:SS", "RFC 3339"],
    ))
}
