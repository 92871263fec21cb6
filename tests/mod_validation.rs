use chrono::{DateTime, TimeZone, Utc};
use mls_listings::ErrorKind;
use mls_listings::types::{
    Address, BrokerageFlags, DateFields, Dates, Listing, ListingDetails, ListingInput, MasterId, Price, PriceUpdate,
    Property, UpdateListingRequest, paths, to_bson_datetime,
};
use mls_listings::validation::{UpdateDelta, is_update_authorized, validate_insert, validate_update};

fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn sold_input() -> ListingInput {
    ListingInput {
        listing_id: "SOLO-77".into(),
        rdm_source_system_key: "SOLO".into(),
        property_type: "CONDO".into(),
        standard_status: "SOLD".into(),
        price: Some(Price { list_price: 450_000.0, close_price: 440_000.0, currency: String::new() }),
        dates: DateFields { listing_contract_date: Some(day(2024, 3, 1)), ..DateFields::default() },
        address: Some(Address {
            unparsed_address: "500 W 2nd St Unit 12".into(),
            city: "Austin".into(),
            county_or_parish: "Travis".into(),
            state_or_province: "TX".into(),
            country: "USA".into(),
            postal_code: "78701".into(),
        }),
    }
}

fn prior(source: &str) -> Listing {
    Listing {
        listing_id: "L-9".into(),
        source_system_key: source.into(),
        property: Property {
            listing: ListingDetails {
                standard_status: "ACTIVE".into(),
                dates: Some(Dates {
                    listing_contract_date: Some(to_bson_datetime(day(2024, 2, 1))),
                    ..Dates::default()
                }),
                ..ListingDetails::default()
            },
            ..Property::default()
        },
        ..Listing::default()
    }
}

fn update(status: &str) -> UpdateListingRequest {
    UpdateListingRequest {
        listing_id: "L-9".into(),
        source_system_key: "SOLO".into(),
        standard_status: status.into(),
        ..UpdateListingRequest::default()
    }
}

#[test]
fn sold_insert_needs_a_close_date() {
    let err = validate_insert(sold_input()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn sold_insert_close_date_must_follow_contract() {
    let mut input = sold_input();
    input.dates.close_date = Some(day(2024, 2, 1));
    assert_eq!(validate_insert(input).unwrap_err().kind(), ErrorKind::InvalidArgument);
}

#[test]
fn sold_insert_with_close_date_and_price_passes() {
    let mut input = sold_input();
    input.dates.close_date = Some(day(2024, 6, 1));
    let ok = validate_insert(input).unwrap();
    assert_eq!(ok.price.unwrap().currency, "USD");
}

#[test]
fn sold_insert_without_close_price_fails() {
    let mut input = sold_input();
    input.dates.close_date = Some(day(2024, 6, 1));
    input.price.as_mut().unwrap().close_price = 0.0;
    assert!(validate_insert(input).is_err());
}

#[test]
fn usa_requires_county_and_state() {
    let mut input = sold_input();
    input.standard_status = "ACTIVE".into();
    let address = input.address.as_mut().unwrap();
    address.county_or_parish.clear();
    address.city.clear();
    let msg = validate_insert(input).unwrap_err().to_string();
    assert!(msg.contains("City"));
    assert!(msg.contains("County/Parish"));
}

#[test]
fn negative_list_price_is_rejected() {
    let mut input = sold_input();
    input.standard_status = "ACTIVE".into();
    input.price.as_mut().unwrap().list_price = -1.0;
    assert!(validate_insert(input).unwrap_err().message().contains("List Price"));
}

#[test]
fn canceled_update_without_date_fails_regardless_of_other_fields() {
    let mut req = update("CANCELED");
    req.price = Some(PriceUpdate { list_price: 10.0, close_price: 5.0 });
    req.dates = Some(DateFields {
        close_date: Some(day(2024, 5, 1)),
        pending_timestamp: Some(day(2024, 4, 1)),
        ..DateFields::default()
    });
    assert_eq!(validate_update(&req, &prior("SOLO")).unwrap_err().kind(), ErrorKind::InvalidArgument);
}

#[test]
fn update_dates_are_checked_against_the_stored_contract_date() {
    let mut req = update("PENDING");
    req.dates = Some(DateFields { pending_timestamp: Some(day(2024, 1, 15)), ..DateFields::default() });
    assert!(validate_update(&req, &prior("SOLO")).is_err());
    req.dates = Some(DateFields { pending_timestamp: Some(day(2024, 2, 15)), ..DateFields::default() });
    assert!(validate_update(&req, &prior("SOLO")).is_ok());
}

#[test]
fn omitted_status_skips_status_rules() {
    let mut req = update("");
    req.price = Some(PriceUpdate { list_price: 99.0, close_price: 0.0 });
    assert!(validate_update(&req, &prior("SOLO")).is_ok());
}

#[test]
fn unknown_status_is_rejected() {
    assert_eq!(validate_update(&update("CLOSED"), &prior("SOLO")).unwrap_err().kind(), ErrorKind::InvalidArgument);
}

#[test]
fn foreign_sources_need_an_owner_listing() {
    let mut req = update("ACTIVE");
    req.source_system_key = "MLSX".into();
    let mut target = prior("MLSX");
    assert_eq!(validate_update(&req, &target).unwrap_err().kind(), ErrorKind::Unauthenticated);

    target.brokerage = Some(BrokerageFlags { is_brokerage_listing: true, is_luxury_listing: false });
    target.master_id = Some(MasterId {
        list_agent_master_id: "A1".into(),
        list_office_master_id: "O1".into(),
        company_master_id: String::new(),
        company_staff_master_id: String::new(),
    });
    assert!(!is_update_authorized("MLSX", &target));

    target.master_id.as_mut().unwrap().company_master_id = "C1".into();
    assert!(is_update_authorized("MLSX", &target));
    assert!(validate_update(&req, &target).is_ok());
}

#[test]
fn authorization_is_checked_before_fields() {
    let mut req = update("CANCELED");
    req.source_system_key = "MLSX".into();
    assert_eq!(validate_update(&req, &prior("MLSX")).unwrap_err().kind(), ErrorKind::Unauthenticated);
}

#[test]
fn delta_skips_unset_fields() {
    let mut req = update("");
    req.price = Some(PriceUpdate { list_price: 0.0, close_price: 12.5 });
    let delta = UpdateDelta::from_request(&req, day(2024, 6, 1)).unwrap();
    assert!(!delta.fields().contains_key(paths::STANDARD_STATUS));
    assert!(!delta.fields().contains_key(paths::LIST_PRICE));
    assert_eq!(delta.fields().get_f64(paths::CLOSE_PRICE).unwrap(), 12.5);
    let doc = delta.into_update_document();
    assert!(doc.get_document("$set").unwrap().contains_key(paths::LAST_CHANGE_DATE));
}
