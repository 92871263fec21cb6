//! Listing data model as stored in the catalog collection, plus the request-shaped
//! inputs accepted by the insert and update endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored field paths, dot-separated as the store addresses nested documents.
pub mod paths {
    pub const ID: &str = "_id";
    pub const LISTING_ID: &str = "listing_id";
    pub const SOURCE_SYSTEM_KEY: &str = "source_system_key";
    pub const RDM_SOURCE_SYSTEM_KEY: &str = "rdm_source_system_key";
    pub const LAST_CHANGE_DATE: &str = "last_change_date";
    pub const INSERTED_BY: &str = "inserted_by";

    pub const PROPERTY_TYPE: &str = "property.property_type";
    pub const STANDARD_STATUS: &str = "property.listing.standard_status";
    pub const LISTING_RDM_SOURCE_SYSTEM_KEY: &str = "property.listing.rdm_source_system_key";
    pub const LISTING_SOURCE_SYSTEM_KEY: &str = "property.listing.source_system_key";
    pub const LIST_PRICE: &str = "property.listing.price.list_price";
    pub const CLOSE_PRICE: &str = "property.listing.price.close_price";
    pub const LISTING_CONTRACT_DATE: &str = "property.listing.dates.listing_contract_date";
    pub const EXPIRATION_DATE: &str = "property.listing.dates.expiration_date";
    pub const CANCELLATION_DATE: &str = "property.listing.dates.cancellation_date";
    pub const PENDING_TIMESTAMP: &str = "property.listing.dates.pending_timestamp";
    pub const CLOSE_DATE: &str = "property.listing.dates.close_date";
    pub const DATES_LAST_CHANGE_DATE: &str = "property.listing.dates.last_change_date";
    pub const LIST_AGENT_MLS_ID: &str = "property.listing.agent_office.list_agent.list_agent_mls_id";

    pub const UNPARSED_ADDRESS: &str = "property.location.address.unparsed_address";
    pub const CITY: &str = "property.location.address.city";
    pub const STATE_OR_PROVINCE: &str = "property.location.address.state_or_province";
    pub const POSTAL_CODE: &str = "property.location.address.postal_code";
    pub const SUBDIVISION_NAME: &str = "property.location.area.subdivision_name";
    pub const BEDROOMS_TOTAL: &str = "property.structure.bedrooms_total";
    pub const ARCHITECTURE_STYLE: &str = "property.structure.architecture_style";

    pub const LIST_AGENT_MASTER_ID: &str = "master_id.list_agent_master_id";
    pub const LIST_OFFICE_MASTER_ID: &str = "master_id.list_office_master_id";
    pub const COMPANY_MASTER_ID: &str = "master_id.company_master_id";
    pub const COMPANY_STAFF_MASTER_ID: &str = "master_id.company_staff_master_id";

    pub const LISTING_GUID: &str = "dash.listing_guid";
    pub const LISTING_AGENT_GUID: &str = "dash.listing_agent_guid";
    pub const COMPANY_STAFF_GUID: &str = "dash.company_staff_guid";

    pub const IS_BROKERAGE_LISTING: &str = "brokerage.is_brokerage_listing";
    pub const IS_LUXURY_LISTING: &str = "brokerage.is_luxury_listing";
}

/// The canonical catalog record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Listing {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub listing_id: String,
    pub source_system_key: String,
    pub rdm_source_system_key: String,
    pub property: Property,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_id: Option<MasterId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dash: Option<Dash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brokerage: Option<BrokerageFlags>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_change_date: Option<bson::DateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted_by: Option<String>,
}

impl Listing {
    /// Store key for a listing: `<source>_<listingId>`.
    #[must_use]
    pub fn document_id(source_system_key: &str, listing_id: &str) -> String {
        format!("{source_system_key}_{listing_id}")
    }

    #[must_use]
    pub fn listing_contract_date(&self) -> Option<DateTime<Utc>> {
        self.property
            .listing
            .dates
            .as_ref()
            .and_then(|d| d.listing_contract_date)
            .map(to_chrono)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Property {
    pub property_type: String,
    pub listing: ListingDetails,
    pub location: Location,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure: Option<Structure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingDetails {
    pub listing_id: String,
    pub source_system_key: String,
    pub rdm_source_system_key: String,
    pub standard_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dates: Option<Dates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_office: Option<AgentOffice>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Price {
    pub list_price: f64,
    pub close_price: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dates {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listing_contract_date: Option<bson::DateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<bson::DateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_date: Option<bson::DateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_timestamp: Option<bson::DateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_date: Option<bson::DateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_change_date: Option<bson::DateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted_date: Option<bson::DateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOffice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_agent: Option<ListAgent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListAgent {
    pub list_agent_mls_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<Area>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Address {
    pub unparsed_address: String,
    pub city: String,
    pub county_or_parish: String,
    pub state_or_province: String,
    pub country: String,
    pub postal_code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Area {
    pub subdivision_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Structure {
    pub bedrooms_total: i32,
    pub architecture_style: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterId {
    pub list_agent_master_id: String,
    pub list_office_master_id: String,
    pub company_master_id: String,
    pub company_staff_master_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dash {
    pub listing_guid: String,
    pub listing_agent_guid: String,
    pub company_staff_guid: String,
}

/// Flags marking a listing as owned by the catalog operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerageFlags {
    pub is_brokerage_listing: bool,
    pub is_luxury_listing: bool,
}

/// Optional lifecycle dates carried by insert and update requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DateFields {
    pub listing_contract_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub cancellation_date: Option<DateTime<Utc>>,
    pub pending_timestamp: Option<DateTime<Utc>>,
    pub close_date: Option<DateTime<Utc>>,
}

/// Request body for adding a listing from an internal source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingInput {
    pub listing_id: String,
    pub rdm_source_system_key: String,
    pub property_type: String,
    pub standard_status: String,
    pub price: Option<Price>,
    pub dates: DateFields,
    pub address: Option<Address>,
}

/// Price fields of an update; zero means "leave unchanged".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceUpdate {
    pub list_price: f64,
    pub close_price: f64,
}

/// Request body for updating an existing listing. Empty status, zero prices and
/// absent dates are "do not change".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateListingRequest {
    pub listing_id: String,
    pub source_system_key: String,
    pub standard_status: String,
    pub price: Option<PriceUpdate>,
    pub dates: Option<DateFields>,
}

#[must_use]
pub fn to_chrono(dt: bson::DateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[must_use]
pub fn to_bson_datetime(dt: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn listing_roundtrips_through_bson_with_sparse_fields() {
        let listing = Listing {
            id: Some(Listing::document_id("SOLO", "L-1")),
            listing_id: "L-1".into(),
            source_system_key: "SOLO".into(),
            ..Listing::default()
        };
        let doc = bson::to_document(&listing).unwrap();
        assert_eq!(doc.get_str("_id").unwrap(), "SOLO_L-1");
        assert!(!doc.contains_key("master_id"));
        let back: Listing = bson::from_document(doc).unwrap();
        assert_eq!(back, listing);
    }

    #[test]
    fn datetime_conversion_keeps_millis() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(to_chrono(to_bson_datetime(t)), t);
    }
}
