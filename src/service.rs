//! Catalog operations over a [`DocumentStore`].
//!
//! Each read validates and builds its query, runs it, and decodes the results.
//! A document that fails to decode is logged and skipped. A well-formed read
//! that matches nothing is `NotFound`.

use std::sync::Arc;

use async_trait::async_trait;
use bson::Document;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::changefeed::{ChannelSink, EventSink, Subscriber, SubscriptionEnd, SubscriptionRequest};
use crate::config::ServiceConfig;
use crate::errors::ListingError;
use crate::logger::AUDIT_TARGET;
use crate::query::{
    AddressSearchRequest, AgentIdRequest, BySourceRequest, CityRequest, Filter, FilterBuilder, FindOptions,
    ListingGuidRequest, ListingIdRequest, LookupRequest, OwnerSearchRequest, Page, Pipeline, SoldListingsRequest,
    address_search, listing_id_search, resolve,
};
use crate::store::{DocumentCursor, DocumentStore, StoreError, UpdateOutcome};
use crate::types::{
    Dates, Listing, ListingDetails, ListingInput, Location, Property, UpdateListingRequest, paths, to_bson_datetime,
};
use crate::validation::{UpdateDelta, next_change_date, validate_insert, validate_update};

/// Receives listings pushed by [`ListingService::stream_listings`].
#[async_trait]
pub trait ListingSink: Send {
    async fn send(&mut self, listing: Listing) -> Result<(), ListingError>;
}

#[async_trait]
impl ListingSink for ChannelSink<Listing> {
    async fn send(&mut self, listing: Listing) -> Result<(), ListingError> {
        self.sender()
            .send(listing)
            .await
            .map_err(|_| ListingError::Internal("listing receiver closed".into()))
    }
}

pub struct ListingService<S: ?Sized> {
    store: Arc<S>,
    config: ServiceConfig,
    fixed_now: Option<DateTime<Utc>>,
}

impl<S: ?Sized> Clone for ListingService<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), config: self.config.clone(), fixed_now: self.fixed_now }
    }
}

fn blank(fields: &[(&str, &str)]) -> Result<(), ListingError> {
    let missing: Vec<String> = fields
        .iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(name, _)| format!("{name}: cannot be blank"))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ListingError::InvalidArgument(format!("Invalid input. {}.", missing.join("; "))))
    }
}

impl<S: DocumentStore + ?Sized> ListingService<S> {
    pub fn new(store: Arc<S>, config: ServiceConfig) -> Self {
        Self { store, config, fixed_now: None }
    }

    /// Pins the clock used for lookback and sold-date windows.
    #[must_use]
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.fixed_now = Some(now);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.fixed_now.unwrap_or_else(Utc::now)
    }

    fn builder(&self) -> FilterBuilder {
        FilterBuilder::new(self.config.api.by_source.allowed_last_change_days).at(self.now())
    }

    fn page(&self, limit: i32, offset: i32) -> Page {
        resolve(limit, offset, &self.config.api.pagination)
    }

    fn find_options(&self, page: Option<Page>, case_insensitive: bool) -> FindOptions {
        FindOptions {
            limit: page.map(|p| p.limit),
            skip: page.map(|p| p.offset.unsigned_abs()),
            max_time: Some(self.config.max_query_time()),
            case_insensitive,
        }
    }

    async fn collect(&self, mut cursor: DocumentCursor, what: &str) -> Result<Vec<Listing>, ListingError> {
        let mut out = Vec::new();
        while let Some(item) = cursor.next().await {
            match bson::from_document::<Listing>(item?) {
                Ok(listing) => out.push(listing),
                Err(e) => log::error!("unable to decode the document: {e}"),
            }
        }
        if out.is_empty() {
            log::warn!("unable to find listings for {what}");
            return Err(ListingError::NotFound(format!("Unable to find mls listings for {what}")));
        }
        Ok(out)
    }

    /// Runs a built query and decodes the matches.
    ///
    /// # Errors
    /// `Internal` for store failures, `NotFound` when nothing matches.
    pub async fn run(&self, pipeline: Pipeline, opts: FindOptions, what: &str) -> Result<Vec<Listing>, ListingError> {
        let cursor = match pipeline {
            Pipeline::Predicates(clauses) => self.store.find(&clauses, &opts).await,
            Pipeline::Search(stages) => self.store.aggregate(&stages).await,
        }
        .map_err(|e| {
            log::error!("error while processing the request to search listings: {e}");
            ListingError::from(e)
        })?;
        self.collect(cursor, what).await
    }

    pub async fn get_by_listing_id(&self, req: &ListingIdRequest) -> Result<Vec<Listing>, ListingError> {
        let clauses = self.builder().by_listing_id(req)?;
        self.run(Pipeline::Predicates(clauses), self.find_options(None, true), &req.listing_id).await
    }

    pub async fn get_by_listing_guid(&self, req: &ListingGuidRequest) -> Result<Vec<Listing>, ListingError> {
        let clauses = self.builder().by_listing_guid(req)?;
        self.run(Pipeline::Predicates(clauses), self.find_options(None, false), &req.listing_guid).await
    }

    pub async fn get_by_city(&self, req: &CityRequest) -> Result<Vec<Listing>, ListingError> {
        let clauses = self.builder().by_city(req)?;
        let opts = self.find_options(Some(self.page(req.limit, req.offset)), true);
        self.run(Pipeline::Predicates(clauses), opts, &req.city).await
    }

    pub async fn get_by_lookup(&self, req: &LookupRequest) -> Result<Vec<Listing>, ListingError> {
        let clauses = self.builder().by_lookup(req)?;
        let opts = self.find_options(Some(self.page(req.limit, req.offset)), req.field.case_insensitive());
        self.run(Pipeline::Predicates(clauses), opts, &req.value).await
    }

    pub async fn get_by_agent_id(&self, req: &AgentIdRequest) -> Result<Vec<Listing>, ListingError> {
        let clauses = self.builder().by_agent_id(req)?;
        let opts = self.find_options(Some(self.page(req.limit, req.offset)), false);
        self.run(Pipeline::Predicates(clauses), opts, &req.list_agent_mls_id).await
    }

    pub async fn get_by_source(&self, req: &BySourceRequest) -> Result<Vec<Listing>, ListingError> {
        let clauses = self.builder().by_source(req)?;
        let opts = self.find_options(Some(self.page(req.limit, req.offset)), false);
        self.run(Pipeline::Predicates(clauses), opts, &req.source_system_key).await
    }

    pub async fn get_sold_listings(&self, req: &SoldListingsRequest) -> Result<Vec<Listing>, ListingError> {
        let clauses = self.builder().sold_listings(req)?;
        let opts = self.find_options(Some(self.page(req.limit, req.offset)), false);
        self.run(Pipeline::Predicates(clauses), opts, "sold listings").await
    }

    pub async fn get_by_address(&self, req: &AddressSearchRequest) -> Result<Vec<Listing>, ListingError> {
        let stages = address_search(req, &self.config.api.by_address.search_index)?;
        self.run(Pipeline::Search(stages), FindOptions::default(), &req.unparsed_address).await
    }

    /// Listing-id wildcard search when `q` is set, otherwise the owner-flag query.
    pub async fn search_listings(&self, req: &OwnerSearchRequest) -> Result<Vec<Listing>, ListingError> {
        let page = self.page(req.limit, req.offset);
        match req.q.as_deref() {
            Some(q) => {
                let stages = listing_id_search(q, &self.config.api.search.listing_id_index, page)?;
                self.run(Pipeline::Search(stages), FindOptions::default(), q).await
            }
            None => {
                let clauses = self.builder().owner_listings(req)?;
                self.run(Pipeline::Predicates(clauses), self.find_options(Some(page), false), "owner listings").await
            }
        }
    }

    /// Validates and stores a new listing from an internal source.
    ///
    /// # Errors
    /// `InvalidArgument` for rule violations, `AlreadyExists` when the
    /// `(source, listingId)` key is taken.
    pub async fn add_listing(&self, input: ListingInput, caller: &str) -> Result<Listing, ListingError> {
        let input = validate_insert(input)?;
        let listing = build_listing(input, caller, self.now());
        let id = listing.id.clone().unwrap_or_default();
        self.store.insert_one(bson::to_document(&listing)?).await.map_err(|e| match e {
            StoreError::DuplicateKey(_) => {
                ListingError::AlreadyExists(format!("Listing with {} already exists in the database", listing.listing_id))
            }
            other => other.into(),
        })?;
        log::info!(target: AUDIT_TARGET, "caller '{caller}' inserted listing {id}");
        Ok(listing)
    }

    /// Applies a partial update after authorisation and lifecycle checks.
    ///
    /// # Errors
    /// `InvalidArgument`, `Unauthenticated`, or `NotFound` when no listing has
    /// the given key.
    pub async fn update_listing(&self, req: &UpdateListingRequest, caller: &str) -> Result<Listing, ListingError> {
        blank(&[("ListingId", req.listing_id.as_str()), ("SourceSystemKey", req.source_system_key.as_str())])?;
        let key = vec![
            Filter::eq(paths::LISTING_ID, req.listing_id.as_str()),
            Filter::eq(paths::SOURCE_SYSTEM_KEY, req.source_system_key.as_str()),
        ];
        let not_found =
            || ListingError::NotFound(format!("Unable to find listing for given listingID {}", req.listing_id));
        let prior_doc = self.store.find_one(&key, &self.find_options(None, false)).await?.ok_or_else(not_found)?;
        let prior: Listing = bson::from_document(prior_doc)?;

        validate_update(req, &prior)?;
        let delta = UpdateDelta::from_request(req, next_change_date(self.now(), &prior))?;
        match self.store.find_one_and_update(&key, delta.into_update_document()).await? {
            UpdateOutcome::Updated(doc) => {
                log::info!(target: AUDIT_TARGET, "caller '{caller}' updated listing {} from {}", req.listing_id, req.source_system_key);
                Ok(bson::from_document(doc)?)
            }
            UpdateOutcome::NotMatched => Err(not_found()),
        }
    }

    /// Pushes every listing matching `clauses` to `sink`.
    ///
    /// Returns the number of listings delivered. Stops early, without error,
    /// when `cancel` fires.
    ///
    /// # Errors
    /// Store failures, or the sink's own failure, which ends the stream.
    pub async fn stream_listings<K>(
        &self,
        clauses: &[Filter],
        sink: &mut K,
        cancel: &CancellationToken,
    ) -> Result<usize, ListingError>
    where
        K: ListingSink + ?Sized,
    {
        let mut cursor = self.store.find(clauses, &self.find_options(None, false)).await?;
        let mut sent = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = cursor.next() => next,
            };
            let Some(item) = next else { break };
            let doc: Document = item?;
            let listing = match bson::from_document::<Listing>(doc) {
                Ok(l) => l,
                Err(e) => {
                    log::error!("unable to decode the document: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(listing).await {
                log::error!("error while streaming listings: {e}");
                return Err(e);
            }
            sent += 1;
        }
        Ok(sent)
    }

    /// A change-feed subscriber configured with this service's stream deadline.
    pub fn subscribe(&self, request: SubscriptionRequest, caller: &str) -> Subscriber<S> {
        Subscriber::new(Arc::clone(&self.store), request, self.config.stream_deadline()).with_caller(caller)
    }

    /// Streams change events into `sink` and reports how the subscription
    /// ended together with the last delivered resume marker.
    ///
    /// # Errors
    /// See [`Subscriber::run`].
    pub async fn stream_events<K>(
        &self,
        request: SubscriptionRequest,
        sink: &mut K,
        cancel: &CancellationToken,
        caller: &str,
    ) -> Result<(SubscriptionEnd, Option<String>), ListingError>
    where
        K: EventSink + ?Sized,
    {
        let subscriber = self.subscribe(request, caller);
        let end = subscriber.run(sink, cancel).await?;
        Ok((end, subscriber.last_resume_marker()))
    }

    /// # Errors
    /// `Internal` when the store does not answer.
    pub async fn health(&self) -> Result<(), ListingError> {
        self.store.ping().await.map_err(|e| {
            log::error!("error while pinging the store for health check: {e}");
            ListingError::Internal(format!("store unavailable: {e}"))
        })
    }
}

fn build_listing(input: ListingInput, caller: &str, now: DateTime<Utc>) -> Listing {
    let stamp = Some(to_bson_datetime(now));
    let d = &input.dates;
    let dates = Dates {
        listing_contract_date: d.listing_contract_date.map(to_bson_datetime),
        expiration_date: d.expiration_date.map(to_bson_datetime),
        cancellation_date: d.cancellation_date.map(to_bson_datetime),
        pending_timestamp: d.pending_timestamp.map(to_bson_datetime),
        close_date: d.close_date.map(to_bson_datetime),
        last_change_date: stamp,
        inserted_date: stamp,
    };
    // Internal sources use the same key for both source fields.
    let source = input.rdm_source_system_key;
    Listing {
        id: Some(Listing::document_id(&source, &input.listing_id)),
        listing_id: input.listing_id.clone(),
        source_system_key: source.clone(),
        rdm_source_system_key: source.clone(),
        property: Property {
            property_type: input.property_type,
            listing: ListingDetails {
                listing_id: input.listing_id,
                source_system_key: source.clone(),
                rdm_source_system_key: source,
                standard_status: input.standard_status,
                price: input.price,
                dates: Some(dates),
                agent_office: None,
            },
            location: Location { address: input.address, area: None },
            structure: None,
        },
        last_change_date: stamp,
        inserted_by: (!caller.is_empty()).then(|| caller.to_owned()),
        ..Listing::default()
    }
}
