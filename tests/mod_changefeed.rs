use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use chrono::Utc;
use mls_listings::changefeed::{ChannelSink, DEFAULT_OPERATIONS};
use mls_listings::store::memory::encode_marker;
use mls_listings::{
    ChangeEvent, DocumentStore, ErrorKind, EventSink, InMemoryStore, Listing, ListingError, OperationType,
    Subscriber, SubscriptionEnd, SubscriptionRequest,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const HOUR: Duration = Duration::from_secs(3600);

fn listing(id: &str, source: &str) -> Document {
    let l = Listing {
        id: Some(Listing::document_id(source, id)),
        listing_id: id.into(),
        source_system_key: source.into(),
        ..Listing::default()
    };
    bson::to_document(&l).unwrap()
}

async fn seeded() -> (Arc<InMemoryStore>, String) {
    let store = Arc::new(InMemoryStore::new());
    store.insert_one(listing("seed", "SOLO")).await.unwrap();
    let marker = store.latest_marker().unwrap();
    (store, marker)
}

fn resume_after(marker: &str) -> SubscriptionRequest {
    SubscriptionRequest { resume_marker: Some(marker.to_owned()), ..SubscriptionRequest::default() }
}

/// Runs `sub` until `n` events arrive, then cancels it.
async fn take(sub: &Subscriber<InMemoryStore>, n: usize) -> (Result<SubscriptionEnd, ListingError>, Vec<ChangeEvent>) {
    let (tx, mut rx) = mpsc::channel(16);
    let mut sink = ChannelSink::new(tx);
    let cancel = CancellationToken::new();
    let consumer = async {
        let mut got = Vec::new();
        while got.len() < n {
            match rx.recv().await {
                Some(ev) => got.push(ev),
                None => break,
            }
        }
        cancel.cancel();
        got
    };
    let work = async { tokio::join!(sub.run(&mut sink, &cancel), consumer) };
    tokio::time::timeout(Duration::from_secs(5), work).await.expect("subscription did not finish")
}

#[tokio::test]
async fn stale_marker_is_out_of_range() {
    let store = Arc::new(InMemoryStore::with_retention(2));
    for i in 0..5 {
        store.insert_one(listing(&format!("L{i}"), "SOLO")).await.unwrap();
    }
    let sub = Subscriber::new(store, resume_after(&encode_marker(1)), HOUR);
    let (tx, _rx) = mpsc::channel(1);
    let err = sub.run(&mut ChannelSink::new(tx), &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    assert!(sub.last_resume_marker().is_none());
}

#[tokio::test]
async fn unknown_marker_is_not_out_of_range() {
    let (store, _) = seeded().await;
    let sub = Subscriber::new(store, resume_after("not-a-marker"), HOUR);
    let (tx, _rx) = mpsc::channel(1);
    let err = sub.run(&mut ChannelSink::new(tx), &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn evicted_start_time_is_out_of_range() {
    let store = Arc::new(InMemoryStore::with_retention(1));
    for i in 0..3 {
        store.insert_one(listing(&format!("L{i}"), "SOLO")).await.unwrap();
    }
    let req = SubscriptionRequest { start_time: Some(Utc::now() - chrono::Duration::hours(1)), ..Default::default() };
    let sub = Subscriber::new(store, req, HOUR);
    let (tx, _rx) = mpsc::channel(1);
    let err = sub.run(&mut ChannelSink::new(tx), &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
}

#[tokio::test]
async fn undecodable_notification_is_skipped() {
    let (store, from) = seeded().await;
    store.insert_one(listing("A", "SOLO")).await.unwrap();
    store.push_raw_change(doc! {
        "operationType": "insert",
        "documentKey": { "_id": "SOLO_bad" },
        "fullDocument": "not a listing",
    });
    store.insert_one(listing("B", "SOLO")).await.unwrap();
    let last = store.latest_marker().unwrap();

    let sub = Subscriber::new(store, resume_after(&from), HOUR);
    let (end, events) = take(&sub, 2).await;
    assert_eq!(end.unwrap(), SubscriptionEnd::Canceled);
    let ids: Vec<&str> = events.iter().map(|e| e.listing_id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B"]);
    assert_eq!(sub.last_resume_marker(), Some(last));
}

#[tokio::test]
async fn deletes_need_to_be_requested() {
    let (store, from) = seeded().await;
    store.insert_one(listing("A", "SOLO")).await.unwrap();
    assert!(store.delete_one(&Bson::from("SOLO_A")));
    store.insert_one(listing("B", "SOLO")).await.unwrap();

    let sub = Subscriber::new(Arc::clone(&store), resume_after(&from), HOUR);
    let (_, events) = take(&sub, 2).await;
    assert!(events.iter().all(|e| DEFAULT_OPERATIONS.contains(&e.operation_type)));
    assert_eq!(events[1].listing_id, "B");

    let deletes = SubscriptionRequest { operations: vec![OperationType::Delete], ..resume_after(&from) };
    let sub = Subscriber::new(store, deletes, HOUR);
    let (_, events) = take(&sub, 1).await;
    assert_eq!(events[0].operation_type, OperationType::Delete);
    assert_eq!(events[0].document_key, "SOLO_A");
    assert!(events[0].listing.is_none());
}

#[tokio::test]
async fn source_filter_applies_to_the_full_document() {
    let store = Arc::new(InMemoryStore::new());
    let req = SubscriptionRequest {
        source_system_key: Some("ELL".into()),
        start_time: Some(Utc::now() - chrono::Duration::minutes(5)),
        ..Default::default()
    };
    store.insert_one(listing("A", "SOLO")).await.unwrap();
    store.insert_one(listing("B", "ELL")).await.unwrap();
    store.insert_one(listing("C", "SOLO")).await.unwrap();
    store.insert_one(listing("D", "ELL")).await.unwrap();

    let sub = Subscriber::new(store, req, HOUR);
    let (_, events) = take(&sub, 2).await;
    let ids: Vec<&str> = events.iter().map(|e| e.listing_id.as_str()).collect();
    assert_eq!(ids, vec!["B", "D"]);
}

#[tokio::test]
async fn live_changes_arrive_in_order() {
    let store = Arc::new(InMemoryStore::new());
    let sub = Subscriber::new(Arc::clone(&store), SubscriptionRequest::default(), HOUR);
    let producer = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        for id in ["X", "Y", "Z"] {
            store.insert_one(listing(id, "LC")).await.unwrap();
        }
    };
    let ((_, events), ()) = tokio::join!(take(&sub, 3), producer);
    let ids: Vec<&str> = events.iter().map(|e| e.listing_id.as_str()).collect();
    assert_eq!(ids, vec!["X", "Y", "Z"]);
    assert!(events.windows(2).all(|w| w[0].resume_marker < w[1].resume_marker));
}

struct FlakySink {
    accepted: usize,
    fail_after: usize,
}

#[async_trait]
impl EventSink for FlakySink {
    async fn send(&mut self, _event: ChangeEvent) -> Result<(), ListingError> {
        if self.accepted == self.fail_after {
            return Err(ListingError::Internal("client went away".into()));
        }
        self.accepted += 1;
        Ok(())
    }
}

#[tokio::test]
async fn sink_failure_ends_the_subscription() {
    let (store, from) = seeded().await;
    store.insert_one(listing("A", "SOLO")).await.unwrap();
    let delivered = store.latest_marker().unwrap();
    store.insert_one(listing("B", "SOLO")).await.unwrap();
    store.insert_one(listing("C", "SOLO")).await.unwrap();

    let sub = Subscriber::new(store, resume_after(&from), HOUR);
    let mut sink = FlakySink { accepted: 0, fail_after: 1 };
    let err = sub.run(&mut sink, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.message(), "client went away");
    assert_eq!(sink.accepted, 1);
    assert_eq!(sub.last_resume_marker(), Some(delivered));
}

#[tokio::test]
async fn nothing_is_delivered_after_cancellation() {
    let (store, from) = seeded().await;
    store.insert_one(listing("A", "SOLO")).await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let sub = Subscriber::new(store, resume_after(&from), HOUR);
    let mut sink = FlakySink { accepted: 0, fail_after: usize::MAX };
    assert_eq!(sub.run(&mut sink, &cancel).await.unwrap(), SubscriptionEnd::Canceled);
    assert_eq!(sink.accepted, 0);
}

#[tokio::test]
async fn deadline_closes_an_idle_subscription() {
    let store = Arc::new(InMemoryStore::new());
    let sub = Subscriber::new(store, SubscriptionRequest::default(), Duration::from_millis(30));
    let mut sink = FlakySink { accepted: 0, fail_after: usize::MAX };
    let end = tokio::time::timeout(Duration::from_secs(5), sub.run(&mut sink, &CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(end, SubscriptionEnd::DeadlineElapsed);
}

async fn backlog_of_four() -> (Arc<InMemoryStore>, String, String) {
    let (store, from) = seeded().await;
    store.insert_one(listing("A", "SOLO")).await.unwrap();
    let first = store.latest_marker().unwrap();
    for id in ["B", "C", "D"] {
        store.insert_one(listing(id, "SOLO")).await.unwrap();
    }
    (store, from, first)
}

#[tokio::test]
async fn deadline_fires_while_the_sink_is_blocked() {
    let (store, from, first) = backlog_of_four().await;
    let (tx, mut rx) = mpsc::channel(1);
    let mut sink = ChannelSink::new(tx);
    let sub = Subscriber::new(store, resume_after(&from), Duration::from_millis(50));
    let end = tokio::time::timeout(Duration::from_secs(2), sub.run(&mut sink, &CancellationToken::new()))
        .await
        .expect("run stayed blocked on the sink")
        .unwrap();
    assert_eq!(end, SubscriptionEnd::DeadlineElapsed);
    assert_eq!(sub.last_resume_marker(), Some(first));
    assert_eq!(rx.recv().await.unwrap().listing_id, "A");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn cancel_fires_while_the_sink_is_blocked() {
    let (store, from, first) = backlog_of_four().await;
    let (tx, mut rx) = mpsc::channel(1);
    let mut sink = ChannelSink::new(tx);
    let cancel = CancellationToken::new();
    let sub = Subscriber::new(store, resume_after(&from), HOUR);
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    };
    let (end, ()) = tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(sub.run(&mut sink, &cancel), canceller)
    })
    .await
    .expect("run ignored cancellation while the sink was blocked");
    assert_eq!(end.unwrap(), SubscriptionEnd::Canceled);
    assert_eq!(sub.last_resume_marker(), Some(first));
    assert_eq!(rx.recv().await.unwrap().listing_id, "A");
    assert!(rx.try_recv().is_err());
}
