//! Live listing change events over the store's change stream.
//!
//! One [`Subscriber`] serves one subscription on a single sequential path:
//! wait for the next notification, decode it, hand it to the sink, repeat.
//! A notification that fails to decode is skipped. A sink failure ends the
//! subscription with that failure.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::ListingError;
use crate::logger::{AUDIT_TARGET, CHANGEFEED_TARGET as LOG_TARGET};
use crate::query::Filter;
use crate::store::{DocumentStore, StartPosition, WatchOptions};
use crate::types::{Listing, paths};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
}

/// Watched when a subscription names no operation types. Deletes must be
/// requested explicitly.
pub const DEFAULT_OPERATIONS: [OperationType; 3] =
    [OperationType::Insert, OperationType::Update, OperationType::Replace];

impl OperationType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = ListingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "replace" => Ok(Self::Replace),
            "delete" => Ok(Self::Delete),
            other => Err(ListingError::InvalidArgument(format!("unknown change type '{other}'"))),
        }
    }
}

/// What a client asks to be notified about, and from where.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionRequest {
    pub source_system_key: Option<String>,
    pub property_type: Option<String>,
    /// Empty means [`DEFAULT_OPERATIONS`].
    pub operations: Vec<OperationType>,
    /// Resume strictly after this marker. Wins over `start_time`.
    pub resume_marker: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}

fn non_empty(v: Option<&String>) -> Option<&str> {
    v.map(String::as_str).filter(|s| !s.is_empty())
}

impl SubscriptionRequest {
    /// Operation types this subscription receives.
    #[must_use]
    pub fn effective_operations(&self) -> Vec<OperationType> {
        if self.operations.is_empty() { DEFAULT_OPERATIONS.to_vec() } else { self.operations.clone() }
    }

    /// Conjunction evaluated against raw notifications: optional source and
    /// property-type sub-filters, then the allowed operation types.
    #[must_use]
    pub fn compile_match(&self) -> Vec<Filter> {
        let mut clauses = Vec::new();
        if let Some(source) = non_empty(self.source_system_key.as_ref()) {
            clauses.push(Filter::eq(format!("fullDocument.{}", paths::SOURCE_SYSTEM_KEY), source));
        }
        if let Some(kind) = non_empty(self.property_type.as_ref()) {
            clauses.push(Filter::eq(format!("fullDocument.{}", paths::PROPERTY_TYPE), kind));
        }
        let ops = self
            .effective_operations()
            .into_iter()
            .map(|op| Filter::eq("operationType", op.as_str()))
            .collect();
        clauses.push(Filter::Or(ops));
        clauses
    }

    /// Watch options: the resume marker when present, else the start time,
    /// else "from now". Updates always carry the post-image.
    ///
    /// # Errors
    /// `InvalidArgument` for a start time outside the store's timestamp range.
    pub fn watch_options(&self) -> Result<WatchOptions, ListingError> {
        let start = match (non_empty(self.resume_marker.as_ref()), self.start_time) {
            (Some(marker), at) => {
                if at.is_some() {
                    log::warn!(target: LOG_TARGET, "both resume marker and start time given; resuming after {marker}");
                }
                StartPosition::ResumeAfter(marker.to_owned())
            }
            (None, Some(at)) => {
                let time = u32::try_from(at.timestamp()).map_err(|_| {
                    ListingError::InvalidArgument(format!("change start time {at} is out of range"))
                })?;
                StartPosition::AtOperationTime(bson::Timestamp { time, increment: 0 })
            }
            (None, None) => StartPosition::Now,
        };
        Ok(WatchOptions { start, full_document: true })
    }
}

/// One decoded change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation_type: OperationType,
    pub resume_marker: String,
    pub cluster_time: bson::Timestamp,
    pub change_time: DateTime<Utc>,
    /// Store key of the affected listing.
    pub document_key: String,
    pub listing_id: String,
    /// Absent for deletes.
    pub listing: Option<Listing>,
}

fn malformed(what: &str) -> ListingError {
    ListingError::Internal(format!("malformed change notification: {what}"))
}

fn key_string(v: &Bson) -> String {
    match v {
        Bson::String(s) => s.clone(),
        Bson::ObjectId(oid) => oid.to_hex(),
        other => other.to_string(),
    }
}

impl ChangeEvent {
    /// # Errors
    /// `Internal` when a required field is missing or the document does not
    /// decode as a listing.
    pub fn decode(raw: &Document) -> Result<Self, ListingError> {
        let resume_marker = raw
            .get_document("_id")
            .and_then(|id| id.get_str("_data"))
            .map_err(|_| malformed("missing _id._data"))?
            .to_owned();
        let operation_type: OperationType =
            raw.get_str("operationType").map_err(|_| malformed("missing operationType"))?.parse()?;
        let cluster_time = raw.get_timestamp("clusterTime").map_err(|_| malformed("missing clusterTime"))?;
        let document_key = raw
            .get_document("documentKey")
            .ok()
            .and_then(|k| k.get("_id"))
            .map(key_string)
            .ok_or_else(|| malformed("missing documentKey._id"))?;
        let listing = match raw.get("fullDocument") {
            Some(Bson::Document(full)) => Some(bson::from_document::<Listing>(full.clone())?),
            Some(Bson::Null) | None => None,
            Some(_) => return Err(malformed("fullDocument is not a document")),
        };
        let listing_id = listing
            .as_ref()
            .map(|l| l.listing_id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| document_key.clone());
        let change_time =
            DateTime::<Utc>::from_timestamp(i64::from(cluster_time.time), 0).unwrap_or(DateTime::<Utc>::MIN_UTC);
        Ok(Self { operation_type, resume_marker, cluster_time, change_time, document_key, listing_id, listing })
    }
}

/// Receives events one at a time. An error ends the subscription.
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: ChangeEvent) -> Result<(), ListingError>;
}

/// Forwards events into a bounded channel; a dropped receiver is a sink failure.
pub struct ChannelSink<T> {
    tx: mpsc::Sender<T>,
}

impl<T> ChannelSink<T> {
    #[must_use]
    pub const fn new(tx: mpsc::Sender<T>) -> Self {
        Self { tx }
    }

    #[must_use]
    pub const fn sender(&self) -> &mpsc::Sender<T> {
        &self.tx
    }
}

#[async_trait]
impl EventSink for ChannelSink<ChangeEvent> {
    async fn send(&mut self, event: ChangeEvent) -> Result<(), ListingError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ListingError::Internal("event receiver closed".into()))
    }
}

/// Why a subscription ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEnd {
    Canceled,
    DeadlineElapsed,
    /// The store closed the change stream.
    Exhausted,
}

/// Shared view of the last delivered resume marker.
#[derive(Debug, Clone, Default)]
pub struct MarkerHandle(Arc<RwLock<Option<String>>>);

impl MarkerHandle {
    #[must_use]
    pub fn get(&self) -> Option<String> {
        self.0.read().clone()
    }

    fn set(&self, marker: String) {
        *self.0.write() = Some(marker);
    }
}

pub struct Subscriber<S: ?Sized> {
    store: Arc<S>,
    request: SubscriptionRequest,
    deadline: Duration,
    marker: MarkerHandle,
    caller: String,
}

impl<S: DocumentStore + ?Sized> Subscriber<S> {
    pub fn new(store: Arc<S>, request: SubscriptionRequest, deadline: Duration) -> Self {
        Self { store, request, deadline, marker: MarkerHandle::default(), caller: String::new() }
    }

    /// Identity recorded in the audit log.
    #[must_use]
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    /// Marker of the most recently delivered event.
    #[must_use]
    pub fn last_resume_marker(&self) -> Option<String> {
        self.marker.get()
    }

    /// Handle that keeps reporting the marker while [`Subscriber::run`] is in flight.
    #[must_use]
    pub fn marker_handle(&self) -> MarkerHandle {
        self.marker.clone()
    }

    fn deadline_elapsed(&self) -> SubscriptionEnd {
        log::debug!(target: LOG_TARGET, "subscription deadline of {:?} elapsed", self.deadline);
        SubscriptionEnd::DeadlineElapsed
    }

    /// Streams events into `sink` until cancellation, the deadline, the end of
    /// the change stream, or a failure.
    ///
    /// # Errors
    /// Open failures are classified: a lost resume point or an out-of-range
    /// start time is `OutOfRange`. Sink failures are returned unchanged.
    pub async fn run<K>(&self, sink: &mut K, cancel: &CancellationToken) -> Result<SubscriptionEnd, ListingError>
    where
        K: EventSink + ?Sized,
    {
        log::info!(target: AUDIT_TARGET, "caller '{}' subscribed to listing changes: {:?}", self.caller, self.request);
        let clauses = self.request.compile_match();
        let opts = self.request.watch_options()?;
        let mut cursor = self.store.watch(&clauses, &opts).await.map_err(|e| {
            log::error!(target: LOG_TARGET, "unable to open change stream: {e}");
            ListingError::from(e)
        })?;

        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(SubscriptionEnd::Canceled),
                () = &mut deadline => return Ok(self.deadline_elapsed()),
                next = cursor.next() => next,
            };
            let raw = match next {
                None => return Ok(SubscriptionEnd::Exhausted),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(raw)) => raw,
            };
            let event = match ChangeEvent::decode(&raw) {
                Ok(event) => event,
                Err(e) => {
                    log::warn!(target: LOG_TARGET, "skipping undecodable change notification: {e}");
                    continue;
                }
            };
            if cancel.is_cancelled() {
                return Ok(SubscriptionEnd::Canceled);
            }
            let marker = event.resume_marker.clone();
            let op = event.operation_type;
            // A blocked sink must not outlive cancellation or the deadline.
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(SubscriptionEnd::Canceled),
                () = &mut deadline => return Ok(self.deadline_elapsed()),
                sent = sink.send(event) => sent,
            };
            if let Err(e) = sent {
                log::error!(target: LOG_TARGET, "error while streaming listing changes: {e}");
                return Err(e);
            }
            log::debug!(target: LOG_TARGET, "sent {op} event {marker}");
            self.marker.set(marker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn default_match_excludes_deletes() {
        let clauses = SubscriptionRequest::default().compile_match();
        assert_eq!(clauses.len(), 1);
        let Filter::Or(ops) = &clauses[0] else { panic!("expected operation disjunction") };
        assert_eq!(ops.len(), 3);
        assert!(!ops.contains(&Filter::eq("operationType", "delete")));
    }

    #[test]
    fn resume_marker_wins_over_start_time() {
        let req = SubscriptionRequest {
            resume_marker: Some("00000000000000ff".into()),
            start_time: Some(Utc::now()),
            ..Default::default()
        };
        assert_eq!(req.watch_options().unwrap().start, StartPosition::ResumeAfter("00000000000000ff".into()));
    }

    #[test]
    fn decodes_delete_without_document() {
        let raw = doc! {
            "_id": { "_data": "0000000000000001" },
            "operationType": "delete",
            "clusterTime": bson::Timestamp { time: 1_700_000_000, increment: 1 },
            "documentKey": { "_id": "SOLO_1" },
        };
        let ev = ChangeEvent::decode(&raw).unwrap();
        assert_eq!(ev.operation_type, OperationType::Delete);
        assert_eq!(ev.listing_id, "SOLO_1");
        assert!(ev.listing.is_none());
        assert_eq!(ev.change_time.timestamp(), 1_700_000_000);
    }

    #[test]
    fn missing_cluster_time_fails_decode() {
        let raw = doc! { "_id": { "_data": "01" }, "operationType": "insert", "documentKey": { "_id": 1 } };
        assert!(ChangeEvent::decode(&raw).is_err());
    }
}
