//! Builds predicate queries for the catalog read endpoints.
//!
//! Every builder returns an ordered conjunction of clauses. Indexed, selective
//! fields (source key, listing id) come first; the optional common filter goes
//! last. An empty request yields an empty conjunction, which matches everything.

use bson::Bson;
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ListingError;
use crate::types::{paths, to_bson_datetime};
use crate::validation::StandardStatus;

use super::types::{Filter, MAX_IN_SET};

const SOLD_WINDOW_MONTHS: i32 = 6;
const DATE_FORMAT_MSG: &str = "date range should be in YYYY-MM-DD format";

/// Optional sub-filter accepted by every collection read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingFilter {
    pub property_types: Vec<String>,
    pub standard_statuses: Vec<String>,
    pub architecture_styles: Vec<String>,
    pub rdm_source_system_key: String,
    pub list_price_min: f64,
    pub list_price_max: f64,
    pub bedrooms_min: i32,
    pub postal_codes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingIdRequest {
    pub listing_id: String,
    pub source_system_key: String,
    pub postal_code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingGuidRequest {
    pub listing_guid: String,
    pub source_system_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CityRequest {
    pub city: String,
    pub state: String,
    pub filter: Option<ListingFilter>,
    pub limit: i32,
    pub offset: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentIdRequest {
    pub list_agent_mls_id: String,
    pub source_system_key: String,
    pub filter: Option<ListingFilter>,
    pub limit: i32,
    pub offset: i32,
}

/// Single-field lookups that share one shape: a required value plus the common filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupField {
    State,
    PostalCode,
    AgentMasterId,
    AgentGuid,
    OfficeMasterId,
    CompanyMasterId,
    CompanyStaffMasterId,
    CompanyStaffGuid,
    Subdivision,
}

impl LookupField {
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::State => paths::STATE_OR_PROVINCE,
            Self::PostalCode => paths::POSTAL_CODE,
            Self::AgentMasterId => paths::LIST_AGENT_MASTER_ID,
            Self::AgentGuid => paths::LISTING_AGENT_GUID,
            Self::OfficeMasterId => paths::LIST_OFFICE_MASTER_ID,
            Self::CompanyMasterId => paths::COMPANY_MASTER_ID,
            Self::CompanyStaffMasterId => paths::COMPANY_STAFF_MASTER_ID,
            Self::CompanyStaffGuid => paths::COMPANY_STAFF_GUID,
            Self::Subdivision => paths::SUBDIVISION_NAME,
        }
    }

    #[must_use]
    pub const fn field_name(self) -> &'static str {
        match self {
            Self::State => "State",
            Self::PostalCode => "PostalCode",
            Self::AgentMasterId => "ListAgentMasterId",
            Self::AgentGuid => "ListingAgentGuid",
            Self::OfficeMasterId => "ListOfficeMasterId",
            Self::CompanyMasterId => "CompanyMasterId",
            Self::CompanyStaffMasterId => "CompanyStaffMasterId",
            Self::CompanyStaffGuid => "CompanyStaffGuid",
            Self::Subdivision => "SubdivisionName",
        }
    }

    /// Lookups served by an index built with a case-insensitive collation.
    #[must_use]
    pub const fn case_insensitive(self) -> bool {
        matches!(self, Self::AgentMasterId)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupRequest {
    pub field: LookupField,
    pub value: String,
    #[serde(default)]
    pub filter: Option<ListingFilter>,
    #[serde(default)]
    pub limit: i32,
    #[serde(default)]
    pub offset: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BySourceRequest {
    /// Comma-separated source keys.
    pub source_system_key: String,
    /// Comma-separated agent GUIDs.
    pub listing_agent_guid: String,
    pub last_change_since: Option<DateTime<Utc>>,
    pub list_agent_master_id: String,
    pub list_office_master_id: String,
    pub company_master_id: String,
    pub filter: Option<ListingFilter>,
    pub limit: i32,
    pub offset: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoldListingsRequest {
    pub start_date: String,
    pub end_date: String,
    pub limit: i32,
    pub offset: i32,
}

/// Search over the catalog-owner flags, or a listing-id wildcard when `q` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerSearchRequest {
    pub q: Option<String>,
    pub brokerage_only: bool,
    pub luxury_only: bool,
    pub standard_status: String,
    pub last_change_since: Option<DateTime<Utc>>,
    pub limit: i32,
    pub offset: i32,
}

/// Splits a comma-separated request field into trimmed, non-empty tokens.
#[must_use]
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect()
}

/// Parses a `YYYY-MM-DD` request date.
///
/// # Errors
/// Returns `InvalidArgument` for any other format.
pub fn parse_date(raw: &str) -> Result<NaiveDate, ListingError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ListingError::InvalidArgument(DATE_FORMAT_MSG.into()))
}

/// Calendar month shift where a day past the end of the target month rolls
/// into the following month (Aug 31 + 6 months is Mar 3, not Feb 28).
pub(crate) fn shift_months(d: NaiveDate, months: i32) -> Option<NaiveDate> {
    let total = d.year().checked_mul(12)?.checked_add(i32::try_from(d.month0()).ok()?)?.checked_add(months)?;
    let month = u32::try_from(total.rem_euclid(12)).ok()? + 1;
    let first = NaiveDate::from_ymd_opt(total.div_euclid(12), month, 1)?;
    first.checked_add_days(Days::new(u64::from(d.day0())))
}

fn midnight(d: NaiveDate) -> Bson {
    Bson::DateTime(to_bson_datetime(d.and_time(NaiveTime::MIN).and_utc()))
}

fn require(field: &str, value: &str) -> Result<(), ListingError> {
    if value.trim().is_empty() {
        return Err(ListingError::InvalidArgument(format!("Invalid input. {field}: cannot be blank.")));
    }
    Ok(())
}

/// Set-membership clause for a multi-valued request field.
///
/// # Errors
/// `InvalidArgument` when more than [`MAX_IN_SET`] values are given.
pub fn in_list(field: &str, path: &str, values: Vec<String>) -> Result<Option<Filter>, ListingError> {
    if values.len() > MAX_IN_SET {
        return Err(ListingError::InvalidArgument(format!(
            "Invalid input. {field}: at most {MAX_IN_SET} values are allowed, got {}.",
            values.len()
        )));
    }
    Ok(Filter::one_of(path, values))
}

/// Clauses for the optional common filter. Zero and empty values add nothing.
///
/// # Errors
/// `InvalidArgument` when a list field exceeds [`MAX_IN_SET`] values.
pub fn common_filter(filter: Option<&ListingFilter>) -> Result<Vec<Filter>, ListingError> {
    let Some(f) = filter else { return Ok(Vec::new()) };
    let mut out = Vec::new();
    out.extend(in_list("PropertyTypes", paths::PROPERTY_TYPE, f.property_types.clone())?);
    out.extend(in_list("StandardStatuses", paths::STANDARD_STATUS, f.standard_statuses.clone())?);
    out.extend(in_list("ArchitectureStyles", paths::ARCHITECTURE_STYLE, f.architecture_styles.clone())?);
    if !f.rdm_source_system_key.is_empty() {
        out.push(Filter::eq(paths::LISTING_RDM_SOURCE_SYSTEM_KEY, f.rdm_source_system_key.as_str()));
    }
    if f.list_price_min != 0.0 {
        out.push(Filter::gte(paths::LIST_PRICE, f.list_price_min));
    }
    if f.list_price_max != 0.0 {
        out.push(Filter::lte(paths::LIST_PRICE, f.list_price_max));
    }
    if f.bedrooms_min != 0 {
        out.push(Filter::gte(paths::BEDROOMS_TOTAL, f.bedrooms_min));
    }
    out.extend(in_list("PostalCodes", paths::POSTAL_CODE, f.postal_codes.clone())?);
    Ok(out)
}

/// Builds predicate queries against a fixed clock so results are reproducible.
#[derive(Debug, Clone)]
pub struct FilterBuilder {
    allowed_last_change_days: i64,
    now: DateTime<Utc>,
}

impl FilterBuilder {
    #[must_use]
    pub fn new(allowed_last_change_days: i64) -> Self {
        Self { allowed_last_change_days, now: Utc::now() }
    }

    #[must_use]
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    #[must_use]
    pub const fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// `last_change_date >= since`, accepted only inside the lookback window.
    ///
    /// # Errors
    /// Returns `InvalidRange` when `since` is not more recent than
    /// `now - allowed_last_change_days`, or when that lower bound is not a
    /// representable instant.
    pub fn last_changed_since(&self, since: DateTime<Utc>) -> Result<Filter, ListingError> {
        let oldest = TimeDelta::try_days(self.allowed_last_change_days)
            .and_then(|window| self.now.checked_sub_signed(window))
            .ok_or_else(|| {
                ListingError::InvalidRange(format!(
                    "lookback of {} days is out of range",
                    self.allowed_last_change_days
                ))
            })?;
        // Compared at whole-second resolution.
        if since.timestamp() > oldest.timestamp() {
            let since = DateTime::<Utc>::from_timestamp(since.timestamp(), 0).unwrap_or(since);
            Ok(Filter::gte(paths::LAST_CHANGE_DATE, to_bson_datetime(since)))
        } else {
            Err(ListingError::InvalidRange(format!(
                "Listings cannot be searched beyond last {} days",
                self.allowed_last_change_days
            )))
        }
    }

    /// # Errors
    /// Returns `InvalidArgument` when the listing id is blank.
    pub fn by_listing_id(&self, req: &ListingIdRequest) -> Result<Vec<Filter>, ListingError> {
        require("ListingId", &req.listing_id)?;
        let alternate = req.listing_id.replace('-', "_");
        let ids = if alternate == req.listing_id {
            vec![req.listing_id.clone()]
        } else {
            vec![req.listing_id.clone(), alternate]
        };
        let mut out = Vec::new();
        if !req.source_system_key.is_empty() {
            out.push(Filter::eq(paths::SOURCE_SYSTEM_KEY, req.source_system_key.as_str()));
        }
        out.push(Filter::In { path: paths::LISTING_ID.into(), values: ids.into_iter().map(Bson::from).collect() });
        if !req.postal_code.is_empty() {
            out.push(Filter::eq(paths::POSTAL_CODE, req.postal_code.as_str()));
        }
        Ok(out)
    }

    /// # Errors
    /// Returns `InvalidArgument` when the listing guid is blank.
    pub fn by_listing_guid(&self, req: &ListingGuidRequest) -> Result<Vec<Filter>, ListingError> {
        require("ListingGuid", &req.listing_guid)?;
        let mut out = Vec::new();
        if !req.source_system_key.is_empty() {
            out.push(Filter::eq(paths::SOURCE_SYSTEM_KEY, req.source_system_key.as_str()));
        }
        out.push(Filter::eq(paths::LISTING_GUID, req.listing_guid.as_str()));
        Ok(out)
    }

    /// # Errors
    /// Returns `InvalidArgument` when the city is blank.
    pub fn by_city(&self, req: &CityRequest) -> Result<Vec<Filter>, ListingError> {
        require("City", &req.city)?;
        let mut out = vec![Filter::eq(paths::CITY, req.city.as_str())];
        if !req.state.is_empty() {
            out.push(Filter::eq(paths::STATE_OR_PROVINCE, req.state.as_str()));
        }
        out.extend(common_filter(req.filter.as_ref())?);
        Ok(out)
    }

    /// # Errors
    /// Returns `InvalidArgument` when the agent MLS id is blank.
    pub fn by_agent_id(&self, req: &AgentIdRequest) -> Result<Vec<Filter>, ListingError> {
        require("ListAgentMlsId", &req.list_agent_mls_id)?;
        let mut out = Vec::new();
        if !req.source_system_key.is_empty() {
            out.push(Filter::eq(paths::SOURCE_SYSTEM_KEY, req.source_system_key.as_str()));
        }
        out.push(Filter::eq(paths::LIST_AGENT_MLS_ID, req.list_agent_mls_id.as_str()));
        out.extend(common_filter(req.filter.as_ref())?);
        Ok(out)
    }

    /// # Errors
    /// Returns `InvalidArgument` when the looked-up value is blank.
    pub fn by_lookup(&self, req: &LookupRequest) -> Result<Vec<Filter>, ListingError> {
        require(req.field.field_name(), &req.value)?;
        let mut out = vec![Filter::eq(req.field.path(), req.value.as_str())];
        out.extend(common_filter(req.filter.as_ref())?);
        Ok(out)
    }

    /// # Errors
    /// Returns `InvalidArgument` when no source key is given and `InvalidRange`
    /// when the last-change timestamp is outside the lookback window.
    pub fn by_source(&self, req: &BySourceRequest) -> Result<Vec<Filter>, ListingError> {
        let sources = split_list(&req.source_system_key);
        if sources.is_empty() {
            return Err(ListingError::InvalidArgument(
                "Invalid input. SourceSystemKey: cannot be blank.".into(),
            ));
        }
        let mut out = Vec::new();
        out.extend(in_list("SourceSystemKey", paths::SOURCE_SYSTEM_KEY, sources)?);
        out.extend(in_list("ListingAgentGuid", paths::LISTING_AGENT_GUID, split_list(&req.listing_agent_guid))?);
        if let Some(since) = req.last_change_since {
            out.push(self.last_changed_since(since)?);
        }
        for (path, value) in [
            (paths::LIST_AGENT_MASTER_ID, &req.list_agent_master_id),
            (paths::LIST_OFFICE_MASTER_ID, &req.list_office_master_id),
            (paths::COMPANY_MASTER_ID, &req.company_master_id),
        ] {
            if !value.is_empty() {
                out.push(Filter::eq(path, value.as_str()));
            }
        }
        out.extend(common_filter(req.filter.as_ref())?);
        Ok(out)
    }

    /// Close-date window for sold listings followed by `standard_status = SOLD`.
    ///
    /// Both dates: `[start, end]`, at most six months apart. Start only:
    /// `[start, now + 6 months]`. Neither: the six months up to today, at UTC
    /// midnight. End only is rejected.
    ///
    /// # Errors
    /// `InvalidArgument` for malformed dates or a missing start date, and
    /// `InvalidRange` when the window exceeds six months.
    pub fn sold_listings(&self, req: &SoldListingsRequest) -> Result<Vec<Filter>, ListingError> {
        let (lower, upper) = match (req.start_date.trim(), req.end_date.trim()) {
            ("", "") => {
                let today = self.now.date_naive();
                let start = shift_months(today, -SOLD_WINDOW_MONTHS).unwrap_or(NaiveDate::MIN);
                (midnight(start), midnight(today))
            }
            (start, "") => {
                let start = parse_date(start)?;
                let upper = shift_months(self.now.date_naive(), SOLD_WINDOW_MONTHS)
                    .map_or(self.now, |d| d.and_time(self.now.time()).and_utc());
                (midnight(start), Bson::DateTime(to_bson_datetime(upper)))
            }
            ("", _) => return Err(ListingError::InvalidArgument("start date is required".into())),
            (start, end) => {
                let (start, end) = (parse_date(start)?, parse_date(end)?);
                let limit = shift_months(start, SOLD_WINDOW_MONTHS).unwrap_or(NaiveDate::MAX);
                if end > limit {
                    return Err(ListingError::InvalidRange(
                        "date range for sold listings should be within 6 months".into(),
                    ));
                }
                (midnight(start), midnight(end))
            }
        };
        Ok(vec![
            Filter::gte(paths::CLOSE_DATE, lower),
            Filter::lte(paths::CLOSE_DATE, upper),
            Filter::eq(paths::STANDARD_STATUS, StandardStatus::Sold.as_str()),
        ])
    }

    /// Predicate path of the owner-flag search (`q` unset).
    ///
    /// # Errors
    /// `InvalidArgument` when neither flag is requested or the status is not a
    /// known value; `InvalidRange` for a last-change timestamp outside the window.
    pub fn owner_listings(&self, req: &OwnerSearchRequest) -> Result<Vec<Filter>, ListingError> {
        if !req.standard_status.is_empty() && StandardStatus::parse(&req.standard_status).is_none() {
            return Err(ListingError::InvalidArgument(format!(
                "Standard Status value was not recognized as an acceptable value : {}",
                req.standard_status
            )));
        }
        if !req.brokerage_only && !req.luxury_only {
            return Err(ListingError::InvalidArgument(
                "input must be accompanied by valid search filters".into(),
            ));
        }
        // Luxury listings are always brokerage listings.
        let mut out = vec![Filter::eq(paths::IS_BROKERAGE_LISTING, true)];
        if req.luxury_only {
            out.push(Filter::eq(paths::IS_LUXURY_LISTING, true));
        }
        if !req.standard_status.is_empty() {
            out.push(Filter::eq(paths::STANDARD_STATUS, req.standard_status.as_str()));
        }
        if let Some(since) = req.last_change_since {
            out.push(self.last_changed_since(since)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn builder() -> FilterBuilder {
        FilterBuilder::new(7).at(Utc.with_ymd_and_hms(2024, 8, 15, 10, 0, 0).unwrap())
    }

    #[test]
    fn split_list_trims_and_drops_empty_tokens() {
        assert_eq!(split_list(" A, B,,C ,"), vec!["A", "B", "C"]);
        assert!(split_list(" , ").is_empty());
    }

    #[test]
    fn listing_id_matches_underscore_variant() {
        let f = builder()
            .by_listing_id(&ListingIdRequest { listing_id: "AB-12".into(), ..Default::default() })
            .unwrap();
        assert_eq!(f, vec![Filter::In { path: paths::LISTING_ID.into(), values: vec!["AB-12".into(), "AB_12".into()] }]);
    }

    #[test]
    fn parse_date_rejects_other_formats() {
        assert!(parse_date("2024-02-29").is_ok());
        assert!(parse_date("02/29/2024").is_err());
        assert!(parse_date("2024-2-30").is_err());
    }

    #[test]
    fn owner_search_requires_a_flag() {
        let err = builder().owner_listings(&OwnerSearchRequest::default()).unwrap_err();
        assert!(matches!(err, ListingError::InvalidArgument(_)));
        let luxury = builder()
            .owner_listings(&OwnerSearchRequest { luxury_only: true, ..Default::default() })
            .unwrap();
        assert_eq!(luxury.len(), 2);
    }

    #[test]
    fn shift_months_rolls_past_short_months() {
        let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
        assert_eq!(shift_months(d(2024, 8, 31), 6), Some(d(2025, 3, 3)));
        assert_eq!(shift_months(d(2024, 8, 31), -6), Some(d(2024, 3, 2)));
        assert_eq!(shift_months(d(2024, 1, 15), -1), Some(d(2023, 12, 15)));
        assert_eq!(shift_months(d(2024, 3, 1), 6), Some(d(2024, 9, 1)));
    }

    #[test]
    fn huge_lookback_is_an_error_not_a_panic() {
        let err = FilterBuilder::new(i64::MAX).last_changed_since(Utc::now()).unwrap_err();
        assert!(matches!(err, ListingError::InvalidRange(_)));
        let err = FilterBuilder::new(200_000_000).at(Utc::now()).last_changed_since(Utc::now()).unwrap_err();
        assert!(matches!(err, ListingError::InvalidRange(_)));
    }
}
