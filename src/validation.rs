//! Business rules for inserting and updating listings.
//!
//! Status is a flat enumeration. No status-to-status transition is forbidden;
//! each target status only gates which fields must accompany it and how those
//! dates relate to the listing contract date.

use std::fmt;
use std::str::FromStr;

use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ListingError;
use crate::types::{paths, to_bson_datetime, DateFields, Listing, ListingInput, UpdateListingRequest};

pub const DEFAULT_CURRENCY: &str = "USD";

/// Sources allowed to add listings.
pub const INSERT_SOURCES: [&str; 3] = ["SOLO", "ELL", "LC"];

/// Sources allowed to update any listing they address.
pub const UPDATE_SOURCES: [&str; 2] = ["SOLO", "ELL"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StandardStatus {
    Active,
    Inactive,
    Sold,
    Canceled,
    Hold,
    Unknown,
    Expired,
    Temp,
    Terminated,
    Pending,
    Withdrawn,
}

const STATUS_NAMES: [(StandardStatus, &str); 11] = [
    (StandardStatus::Active, "ACTIVE"),
    (StandardStatus::Inactive, "INACTIVE"),
    (StandardStatus::Sold, "SOLD"),
    (StandardStatus::Canceled, "CANCELED"),
    (StandardStatus::Hold, "HOLD"),
    (StandardStatus::Unknown, "UNKNOWN"),
    (StandardStatus::Expired, "EXPIRED"),
    (StandardStatus::Temp, "TEMP"),
    (StandardStatus::Terminated, "TERMINATED"),
    (StandardStatus::Pending, "PENDING"),
    (StandardStatus::Withdrawn, "WITHDRAWN"),
];

impl StandardStatus {
    pub fn all() -> impl Iterator<Item = Self> {
        STATUS_NAMES.iter().map(|(s, _)| *s)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        STATUS_NAMES.iter().find(|(s, _)| *s == self).map_or("", |(_, n)| n)
    }

    /// Exact, case-sensitive lookup in the name table.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        STATUS_NAMES.iter().find(|(_, n)| *n == name).map(|(s, _)| *s)
    }
}

impl fmt::Display for StandardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StandardStatus {
    type Err = ListingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| unrecognized_status(s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropertyType {
    Sfr,
    Mfd,
    Condo,
    Coop,
    Townhouse,
    Mfr,
    Land,
    Farm,
    Rental,
    CommercialSale,
    CommercialLease,
}

const PROPERTY_TYPE_NAMES: [(PropertyType, &str); 11] = [
    (PropertyType::Sfr, "SFR"),
    (PropertyType::Mfd, "MFD"),
    (PropertyType::Condo, "CONDO"),
    (PropertyType::Coop, "COOP"),
    (PropertyType::Townhouse, "TOWNHOUSE"),
    (PropertyType::Mfr, "MFR"),
    (PropertyType::Land, "LAND"),
    (PropertyType::Farm, "FARM"),
    (PropertyType::Rental, "RENTAL"),
    (PropertyType::CommercialSale, "COMMERCIAL_SALE"),
    (PropertyType::CommercialLease, "COMMERCIAL_LEASE"),
];

impl PropertyType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        PROPERTY_TYPE_NAMES.iter().find(|(p, _)| *p == self).map_or("", |(_, n)| n)
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        PROPERTY_TYPE_NAMES.iter().find(|(_, n)| *n == name).map(|(p, _)| *p)
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn unrecognized_status(s: &str) -> ListingError {
    ListingError::InvalidArgument(format!(
        "Standard Status value was not recognized as an acceptable value : {s}"
    ))
}

/// Dates and close price a status rule looks at.
struct StatusFields<'a> {
    dates: Option<&'a DateFields>,
    close_price: f64,
}

/// Applies the required-field and temporal rule of `status`.
///
/// `contract` is the listing contract date the dates must not precede; when it
/// is unknown only presence is checked.
fn check_status_rule(
    status: StandardStatus,
    fields: &StatusFields<'_>,
    contract: Option<DateTime<Utc>>,
) -> Result<(), ListingError> {
    let before_contract = |d: DateTime<Utc>| contract.is_some_and(|c| d < c);
    let dates = fields.dates;
    let (date, message) = match status {
        StandardStatus::Sold => {
            let close = dates.and_then(|d| d.close_date);
            if close.is_none() || fields.close_price == 0.0 {
                return Err(ListingError::InvalidArgument(
                    "Closed Date and Close Price required for SOLD listing".into(),
                ));
            }
            (close, "Close date must be later than ListingContractDate")
        }
        StandardStatus::Canceled => (
            dates.and_then(|d| d.cancellation_date),
            "Cancellation Date required for CANCELED listing and Cancellation date must be later than ListingContractDate",
        ),
        StandardStatus::Pending => (
            dates.and_then(|d| d.pending_timestamp),
            "Pending Timestamp required for PENDING listing and Pending Timestamp must be later than ListingContractDate",
        ),
        StandardStatus::Expired => (
            dates.and_then(|d| d.expiration_date),
            "Expiration Date required for EXPIRED listing and expiration date must be later than ListingContractDate",
        ),
        _ => return Ok(()),
    };
    match date {
        Some(d) if !before_contract(d) => Ok(()),
        _ => Err(ListingError::InvalidArgument(message.into())),
    }
}

/// Checks a new listing and returns it with defaults applied.
///
/// Missing or malformed request fields are reported together; the address,
/// country, price and status rules follow.
///
/// # Errors
/// `InvalidArgument` describing every complaint found at the failing stage.
pub fn validate_insert(mut input: ListingInput) -> Result<ListingInput, ListingError> {
    let mut complaints = Vec::new();
    if input.listing_id.trim().is_empty() {
        complaints.push("ListingId: cannot be blank".to_owned());
    }
    if input.rdm_source_system_key.is_empty() {
        complaints.push("RdmSourceSystemKey: cannot be blank".to_owned());
    } else if !INSERT_SOURCES.contains(&input.rdm_source_system_key.as_str()) {
        complaints.push("RdmSourceSystemKey: must be a valid value".to_owned());
    }
    if input.property_type.is_empty() {
        complaints.push("PropertyType: cannot be blank".to_owned());
    } else if PropertyType::parse(&input.property_type).is_none() {
        complaints.push("PropertyType: must be a valid value".to_owned());
    }
    if input.standard_status.is_empty() {
        complaints.push("StandardStatus: cannot be blank".to_owned());
    } else if StandardStatus::parse(&input.standard_status).is_none() {
        complaints.push(format!(
            "StandardStatus: {} was not recognized as an acceptable value",
            input.standard_status
        ));
    }
    if input.price.is_none() {
        complaints.push("PriceInput: cannot be blank".to_owned());
    }
    if !complaints.is_empty() {
        return Err(ListingError::InvalidArgument(format!("Invalid input. {}.", complaints.join("; "))));
    }

    let is_land = PropertyType::parse(&input.property_type) == Some(PropertyType::Land);
    let address = input.address.clone().unwrap_or_default();
    let mut problems: Vec<&str> = Vec::new();
    if !is_land && address.unparsed_address.trim().is_empty() {
        problems.push("Unparsed Address can not be empty or null");
    }
    if address.city.trim().is_empty() {
        problems.push("City can not be empty or null");
    }
    if address.country.trim().is_empty() {
        problems.push("Country can not be empty or null");
    } else if address.country == "USA"
        && (address.county_or_parish.trim().is_empty() || address.state_or_province.trim().is_empty())
    {
        problems.push("County/Parish and State/Province can not be nil for USA");
    }
    if input.price.as_ref().is_some_and(|p| p.list_price < 0.0) {
        problems.push("List Price invalid");
    }
    if !problems.is_empty() {
        return Err(ListingError::InvalidArgument(problems.join("; ")));
    }

    if let Some(price) = input.price.as_mut()
        && price.currency.trim().is_empty()
    {
        price.currency = DEFAULT_CURRENCY.to_owned();
    }

    let status: StandardStatus = input.standard_status.parse()?;
    let fields = StatusFields {
        dates: Some(&input.dates),
        close_price: input.price.as_ref().map_or(0.0, |p| p.close_price),
    };
    check_status_rule(status, &fields, input.dates.listing_contract_date)?;
    Ok(input)
}

/// True when `source` may update any listing, or `prior` is an owner listing
/// carrying all three internal master ids.
#[must_use]
pub fn is_update_authorized(source: &str, prior: &Listing) -> bool {
    if UPDATE_SOURCES.contains(&source) {
        return true;
    }
    let owned = prior.brokerage.as_ref().is_some_and(|b| b.is_brokerage_listing);
    let ids_complete = prior.master_id.as_ref().is_some_and(|m| {
        !m.list_agent_master_id.is_empty()
            && !m.list_office_master_id.is_empty()
            && !m.company_master_id.is_empty()
    });
    owned && ids_complete
}

/// Checks an update against the record it modifies.
///
/// An empty status leaves the status untouched and skips every status rule.
///
/// # Errors
/// `Unauthenticated` when the caller may not update `prior`; `InvalidArgument`
/// for the first violated field rule.
pub fn validate_update(req: &UpdateListingRequest, prior: &Listing) -> Result<(), ListingError> {
    if !is_update_authorized(&req.source_system_key, prior) {
        return Err(ListingError::Unauthenticated(
            "The request to update this listing is not authorized due to invalid source, missing master ids, or is not flagged as an owner listing".into(),
        ));
    }
    let status = if req.standard_status.is_empty() {
        None
    } else {
        Some(req.standard_status.parse::<StandardStatus>()?)
    };
    if req.price.is_some_and(|p| p.list_price < 0.0) {
        return Err(ListingError::InvalidArgument("List Price invalid.".into()));
    }
    if let Some(status) = status {
        let fields = StatusFields {
            dates: req.dates.as_ref(),
            close_price: req.price.map_or(0.0, |p| p.close_price),
        };
        check_status_rule(status, &fields, prior.listing_contract_date())?;
    }
    Ok(())
}

/// Flattened `$set` of an update: only fields the request actually sets, plus
/// both copies of the last change date.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateDelta {
    set: Document,
}

impl UpdateDelta {
    /// # Errors
    /// `InvalidArgument` when the request changes nothing.
    pub fn from_request(req: &UpdateListingRequest, last_change: DateTime<Utc>) -> Result<Self, ListingError> {
        let mut set = Document::new();
        if !req.standard_status.is_empty() {
            set.insert(paths::STANDARD_STATUS, req.standard_status.as_str());
        }
        if let Some(p) = req.price {
            if p.list_price != 0.0 {
                set.insert(paths::LIST_PRICE, p.list_price);
            }
            if p.close_price != 0.0 {
                set.insert(paths::CLOSE_PRICE, p.close_price);
            }
        }
        if let Some(d) = &req.dates {
            for (path, value) in [
                (paths::LISTING_CONTRACT_DATE, d.listing_contract_date),
                (paths::EXPIRATION_DATE, d.expiration_date),
                (paths::CANCELLATION_DATE, d.cancellation_date),
                (paths::PENDING_TIMESTAMP, d.pending_timestamp),
                (paths::CLOSE_DATE, d.close_date),
            ] {
                if let Some(v) = value {
                    set.insert(path, to_bson_datetime(v));
                }
            }
        }
        if set.is_empty() {
            return Err(ListingError::InvalidArgument("no fields to update".into()));
        }
        let stamp = Bson::DateTime(to_bson_datetime(last_change));
        set.insert(paths::LAST_CHANGE_DATE, stamp.clone());
        set.insert(paths::DATES_LAST_CHANGE_DATE, stamp);
        Ok(Self { set })
    }

    #[must_use]
    pub const fn fields(&self) -> &Document {
        &self.set
    }

    #[must_use]
    pub fn into_update_document(self) -> Document {
        bson::doc! { "$set": self.set }
    }
}

/// Next change date for a record: never earlier than the one on file.
#[must_use]
pub fn next_change_date(now: DateTime<Utc>, prior: &Listing) -> DateTime<Utc> {
    prior
        .last_change_date
        .map(crate::types::to_chrono)
        .map_or(now, |p| p.max(now))
}
