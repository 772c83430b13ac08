use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::EodmsError;
use crate::geometry::Geometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    #[serde(rename = "RCMImageProducts")]
    Rcm,
    Radarsat1,
    Radarsat2,
    PlanetScope,
    #[serde(rename = "NAPL")]
    Napl,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Rcm,
        Collection::Radarsat1,
        Collection::Radarsat2,
        Collection::PlanetScope,
        Collection::Napl,
    ];

    /// Identifier the service uses for this collection.
    pub fn id(&self) -> &'static str {
        match self {
            Collection::Rcm => "RCMImageProducts",
            Collection::Radarsat1 => "Radarsat1",
            Collection::Radarsat2 => "Radarsat2",
            Collection::PlanetScope => "PlanetScope",
            Collection::Napl => "NAPL",
        }
    }

    pub fn is_sar(&self) -> bool {
        matches!(
            self,
            Collection::Rcm | Collection::Radarsat1 | Collection::Radarsat2
        )
    }

    /// Metadata field holding the product granule name.
    pub fn granule_field(&self) -> &'static str {
        match self {
            Collection::Rcm => "title",
            Collection::Radarsat2 => "Supplier Order Number",
            Collection::Radarsat1 => "Product Id",
            Collection::PlanetScope | Collection::Napl => "Title",
        }
    }

    /// Fields kept from a record's own metadata page. The search reply
    /// carries only a few of these.
    pub fn metadata_keys(&self) -> &'static [&'static str] {
        match self {
            Collection::Rcm => &[
                "recordId",
                "title",
                "Acquisition Start Date",
                "Acquisition End Date",
                "Satellite ID",
                "Beam Mnemonic",
                "Beam Mode Type",
                "Beam Mode Description",
                "Beam Mode Version",
                "Spatial Resolution",
                "Polarization Data Mode",
                "Polarization",
                "Polarization in Product",
                "Number of Azimuth Looks",
                "Number of Range Looks",
                "Incidence Angle (Low)",
                "Incidence Angle (High)",
                "Orbit Direction",
                "LUT Applied",
                "Product Format",
                "Product Type",
                "Product Ellipsoid",
                "Sample Type",
                "Sampled Pixel Spacing",
                "Data Type",
                "SIP Size (MB)",
                "Relative Orbit",
                "Absolute Orbit",
                "Orbit Data Source",
            ],
            Collection::Radarsat2 => &[
                "Sequence Id",
                "Supplier Order Number",
                "Start Date",
                "End Date",
                "Position",
                "Sensor",
                "Sensor Mode",
                "Beam",
                "Polarization",
                "Look Orientation",
                "Incidence Angle (Low)",
                "Incidence Angle (High)",
                "Orbit Direction",
                "Absolute Orbit",
                "LUT Applied",
                "Product Format",
                "Product Type",
                "Spatial Resolution",
                "SIP Size (MB)",
            ],
            Collection::Radarsat1 => &[
                "Sequence Id",
                "Product Id",
                "Start Date",
                "End Date",
                "Position",
                "Sensor",
                "Sensor Mode",
                "Beam",
                "Polarization",
                "Look Orientation",
                "Incidence Angle (Low)",
                "Incidence Angle (High)",
                "Orbit Direction",
                "Absolute Orbit",
                "LUT Applied",
                "Product Format",
                "Product Type",
                "Spatial Resolution",
                "SIP Size (MB)",
            ],
            Collection::PlanetScope => &[
                "Sequence Id",
                "Title",
                "Start Date",
                "End Date",
                "Beam",
                "Cloud Cover",
                "Product Format",
                "Product Type",
                "Sun Azimuth Angle",
                "Sun Elevation Angle",
                "SIP Size (MB)",
            ],
            Collection::Napl => &[
                "Sequence Id",
                "Start Date",
                "End Date",
                "Roll Number",
                "Line Number",
                "Photo Number",
                "Area",
                "Scale",
                "NTS Map",
                "Altitude",
                "Viewing Angle",
                "Incidence Angle (Low)",
                "Incidence Angle (High)",
                "Overlap",
                "Sensor Mode",
                "Frame Start",
                "Frame End",
                "Camera Name/Number",
                "Lens Name/Number",
                "Film Size",
                "Focal Length (mm)",
                "SIP Size (MB)",
            ],
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Collection {
    type Err = EodmsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Some(exact) = Self::ALL.iter().find(|c| c.id() == trimmed) {
            return Ok(*exact);
        }
        match trimmed.to_uppercase().as_str() {
            "RCM" | "RCMIMAGEPRODUCTS" => Ok(Collection::Rcm),
            "RS1" | "RADARSAT" | "RADARSAT1" | "RADARSAT-1" => Ok(Collection::Radarsat1),
            "RS2" | "RADARSAT2" | "RADARSAT-2" => Ok(Collection::Radarsat2),
            "PLANET" | "PLANETSCOPE" => Ok(Collection::PlanetScope),
            "NAPL" => Ok(Collection::Napl),
            _ => Err(EodmsError::InvalidCollection(value.to_string())),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum,
)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "Low"),
            Priority::Medium => write!(f, "Medium"),
            Priority::High => write!(f, "High"),
            Priority::Urgent => write!(f, "Urgent"),
        }
    }
}

impl FromStr for Priority {
    type Err = EodmsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            _ => Err(EodmsError::validation(
                "priority",
                format!("unrecognized priority `{value}`"),
                &["Low", "Medium", "High", "Urgent"],
            )),
        }
    }
}

/// Wire form of identifiers, which the service emits as numbers or strings.
#[doc(hidden)]
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdRepr {
    Number(u64),
    Text(String),
}

macro_rules! opaque_id {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "IdRepr", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = EodmsError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                let normalized = value.trim();
                if normalized.is_empty() || normalized.chars().any(char::is_whitespace) {
                    return Err(EodmsError::InvalidId(format!(
                        "{} id `{}`",
                        $kind, value
                    )));
                }
                Ok(Self(normalized.to_string()))
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value.to_string())
            }
        }

        impl TryFrom<IdRepr> for $name {
            type Error = EodmsError;

            fn try_from(value: IdRepr) -> Result<Self, Self::Error> {
                match value {
                    IdRepr::Number(n) => Ok(n.into()),
                    IdRepr::Text(s) => s.parse(),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

opaque_id!(RecordId, "record");
opaque_id!(OrderId, "order");
opaque_id!(ItemId, "item");

/// One discoverable imagery item returned by a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub record_id: RecordId,
    pub uuid: Option<String>,
    pub collection: Collection,
    pub title: Option<String>,
    pub footprint: Geometry,
    pub thumbnail_url: Option<String>,
    /// The record's own metadata page (`thisRecordUrl`).
    pub record_url: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Record {
    pub fn granule(&self) -> Option<&str> {
        self.metadata
            .get(self.collection.granule_field())
            .map(String::as_str)
            .or(self.title.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Submitted,
    Processing,
    Available,
    Downloaded,
    Failed,
    Expired,
}

impl ItemStatus {
    pub fn from_service(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "AVAILABLE_FOR_DOWNLOAD" | "AVAILABLE" => ItemStatus::Available,
            "SUBMITTED" | "QUEUED" | "NEW" => ItemStatus::Submitted,
            "DELIVERED" | "DOWNLOADED" => ItemStatus::Downloaded,
            "FAILED" | "CANCELLED" | "CANCELED" | "ERROR" => ItemStatus::Failed,
            "EXPIRED" | "DELETED" => ItemStatus::Expired,
            _ => ItemStatus::Processing,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ItemStatus::Submitted => "submitted",
            ItemStatus::Processing => "processing",
            ItemStatus::Available => "available",
            ItemStatus::Downloaded => "downloaded",
            ItemStatus::Failed => "failed",
            ItemStatus::Expired => "expired",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderItem {
    pub item_id: ItemId,
    pub order_id: OrderId,
    pub record_id: Option<RecordId>,
    pub status: ItemStatus,
    pub download_url: Option<String>,
    pub size: Option<u64>,
}

/// One server-side order and the items listed for it so far.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub order_id: OrderId,
    pub items: Vec<OrderItem>,
}

impl Order {
    /// Groups items by parent order, keeping first-seen order.
    pub fn group(items: Vec<OrderItem>) -> Vec<Order> {
        let mut orders: Vec<Order> = Vec::new();
        for item in items {
            match orders.iter_mut().find(|o| o.order_id == item.order_id) {
                Some(order) => order.items.push(item),
                None => orders.push(Order {
                    order_id: item.order_id.clone(),
                    items: vec![item],
                }),
            }
        }
        orders
    }
}

/// Overall result of a multi-item operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    PartiallySucceeded,
    Failed,
}

impl Outcome {
    pub fn from_counts(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => Outcome::Succeeded,
            (0, _) => Outcome::Failed,
            _ => Outcome::PartiallySucceeded,
        }
    }
}
