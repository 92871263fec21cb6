//! In-process document store with a bounded change log.
//!
//! Used as the test double for the store and by the CLI previews. Resume
//! markers are 16 hex digits encoding the change sequence number.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use futures::StreamExt;
use futures::stream;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{
    ChangeCursor, DocumentCursor, DocumentStore, StartPosition, StoreError, UpdateOutcome, WatchOptions,
};
use crate::query::eval::get_path;
use crate::query::search::{parse_query_string, wildcard_regex};
use crate::query::{Filter, FindOptions, eval_all};

pub const DEFAULT_RETENTION: usize = 1024;
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct ChangeRecord {
    seq: u64,
    cluster_time: bson::Timestamp,
    notification: Document,
}

#[derive(Debug, Default)]
struct State {
    docs: Vec<Document>,
    log: VecDeque<ChangeRecord>,
    seq: u64,
    last_time: u32,
    evicted: bool,
}

impl State {
    fn position(&self, id: &Bson) -> Option<usize> {
        self.docs.iter().position(|d| d.get("_id") == Some(id))
    }

    fn next_cluster_time(&mut self) -> (u64, bson::Timestamp) {
        self.seq += 1;
        let now = u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX);
        self.last_time = self.last_time.max(now);
        // Truncation keeps the increment monotonic within any realistic second.
        #[allow(clippy::cast_possible_truncation)]
        let increment = self.seq as u32;
        (self.seq, bson::Timestamp { time: self.last_time, increment })
    }
}

struct Inner {
    state: RwLock<State>,
    tx: broadcast::Sender<ChangeRecord>,
    retention: usize,
}

/// Cloneable handle; clones share the same collection.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

pub fn encode_marker(seq: u64) -> String {
    hex::encode(seq.to_be_bytes())
}

pub fn decode_marker(marker: &str) -> Option<u64> {
    let bytes: [u8; 8] = hex::decode(marker).ok()?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn ts_key(t: bson::Timestamp) -> (u32, u32) {
    (t.time, t.increment)
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                set_path(child, rest, value);
            }
        }
    }
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// A store whose change log keeps at most `retention` notifications.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner { state: RwLock::new(State::default()), tx, retention: retention.max(1) }),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.read().docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marker of the newest logged change, if any.
    #[must_use]
    pub fn latest_marker(&self) -> Option<String> {
        self.inner.state.read().log.back().map(|r| encode_marker(r.seq))
    }

    fn record(&self, state: &mut State, operation: &str, key: Bson, full: Option<Document>) {
        let (seq, cluster_time) = state.next_cluster_time();
        let mut notification = doc! {
            "_id": { "_data": encode_marker(seq) },
            "operationType": operation,
            "clusterTime": cluster_time,
            "wallTime": bson::DateTime::now(),
            "documentKey": { "_id": key },
        };
        if let Some(full) = full {
            notification.insert("fullDocument", full);
        }
        self.push(state, ChangeRecord { seq, cluster_time, notification });
    }

    fn push(&self, state: &mut State, record: ChangeRecord) {
        state.log.push_back(record.clone());
        while state.log.len() > self.inner.retention {
            state.log.pop_front();
            state.evicted = true;
        }
        // No receivers is fine.
        let _ = self.inner.tx.send(record);
    }

    /// Appends a notification as-is, stamped with the next marker and cluster
    /// time. Lets callers feed notifications a decoder will reject.
    pub fn push_raw_change(&self, mut notification: Document) -> String {
        let mut state = self.inner.state.write();
        let (seq, cluster_time) = state.next_cluster_time();
        let marker = encode_marker(seq);
        notification.insert("_id", doc! { "_data": marker.clone() });
        notification.insert("clusterTime", cluster_time);
        self.push(&mut state, ChangeRecord { seq, cluster_time, notification });
        marker
    }

    /// Replaces the document with the same `_id`.
    pub fn replace_one(&self, doc: Document) -> Result<bool, StoreError> {
        let id = doc.get("_id").cloned().ok_or_else(|| StoreError::Backend("document has no _id".into()))?;
        let mut state = self.inner.state.write();
        let Some(pos) = state.position(&id) else { return Ok(false) };
        state.docs[pos] = doc.clone();
        self.record(&mut state, "replace", id, Some(doc));
        Ok(true)
    }

    pub fn delete_one(&self, id: &Bson) -> bool {
        let mut state = self.inner.state.write();
        let Some(pos) = state.position(id) else { return false };
        state.docs.remove(pos);
        self.record(&mut state, "delete", id.clone(), None);
        true
    }

    fn matching(&self, clauses: &[Filter], case_insensitive: bool) -> Vec<Document> {
        let state = self.inner.state.read();
        state.docs.iter().filter(|d| eval_all(d, clauses, case_insensitive)).cloned().collect()
    }

    fn backlog(state: &State, start: &StartPosition) -> Result<Vec<ChangeRecord>, StoreError> {
        match start {
            StartPosition::Now => Ok(Vec::new()),
            StartPosition::ResumeAfter(marker) => {
                let seq = decode_marker(marker)
                    .filter(|s| *s <= state.seq)
                    .ok_or_else(|| StoreError::InvalidResumeToken(marker.clone()))?;
                let oldest = state.log.front().map_or(state.seq + 1, |r| r.seq);
                if seq + 1 < oldest {
                    return Err(StoreError::ResumePointLost(format!(
                        "resume marker {marker} is no longer in the change log"
                    )));
                }
                Ok(state.log.iter().filter(|r| r.seq > seq).cloned().collect())
            }
            StartPosition::AtOperationTime(at) => {
                let before_log = state.log.front().is_some_and(|r| ts_key(*at) < ts_key(r.cluster_time));
                if state.evicted && before_log {
                    return Err(StoreError::StartTimeOutOfRange(format!(
                        "start time {}:{} predates the change log",
                        at.time, at.increment
                    )));
                }
                Ok(state.log.iter().filter(|r| ts_key(r.cluster_time) >= ts_key(*at)).cloned().collect())
            }
        }
    }

    fn run_search(&self, search: &Document) -> Result<Vec<Document>, StoreError> {
        let docs = self.inner.state.read().docs.clone();
        if let Ok(qs) = search.get_document("queryString") {
            let default_path = qs.get_str("defaultPath").unwrap_or_default();
            let query = qs.get_str("query").map_err(|e| StoreError::Backend(e.to_string()))?;
            let terms = parse_query_string(query, default_path);
            return Ok(docs
                .into_iter()
                .filter(|d| {
                    terms.iter().all(|(path, value)| {
                        matches!(get_path(d, path), Some(Bson::String(s))
                            if s.to_lowercase().contains(&value.to_lowercase()))
                    })
                })
                .collect());
        }
        if let Ok(wc) = search.get_document("wildcard") {
            let path = wc.get_str("path").map_err(|e| StoreError::Backend(e.to_string()))?;
            let query = wc.get_str("query").map_err(|e| StoreError::Backend(e.to_string()))?;
            let re = wildcard_regex(query).ok_or_else(|| StoreError::Backend(format!("bad wildcard {query}")))?;
            return Ok(docs
                .into_iter()
                .filter(|d| matches!(get_path(d, path), Some(Bson::String(s)) if re.is_match(s)))
                .collect());
        }
        Err(StoreError::Backend("unsupported $search operator".into()))
    }
}

fn as_count(v: &Bson) -> Result<usize, StoreError> {
    let n = match v {
        Bson::Int32(i) => i64::from(*i),
        Bson::Int64(i) => *i,
        other => return Err(StoreError::Backend(format!("expected a count, got {other}"))),
    };
    usize::try_from(n).map_err(|_| StoreError::Backend(format!("negative count {n}")))
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn find(&self, clauses: &[Filter], opts: &FindOptions) -> Result<DocumentCursor, StoreError> {
        let skip = usize::try_from(opts.skip.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = opts.limit.and_then(|l| usize::try_from(l).ok()).filter(|l| *l > 0).unwrap_or(usize::MAX);
        let docs: Vec<_> = self
            .matching(clauses, opts.case_insensitive)
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(Ok)
            .collect();
        Ok(stream::iter(docs).boxed())
    }

    async fn aggregate(&self, stages: &[Document]) -> Result<DocumentCursor, StoreError> {
        let mut docs: Option<Vec<Document>> = None;
        for stage in stages {
            let (name, arg) = stage.iter().next().ok_or_else(|| StoreError::Backend("empty stage".into()))?;
            let current = match (name.as_str(), arg) {
                ("$search", Bson::Document(search)) => self.run_search(search)?,
                ("$skip", n) => {
                    let n = as_count(n)?;
                    docs.take().unwrap_or_else(|| self.matching(&[], false)).into_iter().skip(n).collect()
                }
                ("$limit", n) => {
                    let n = as_count(n)?;
                    docs.take().unwrap_or_else(|| self.matching(&[], false)).into_iter().take(n).collect()
                }
                (other, _) => return Err(StoreError::Backend(format!("unsupported stage {other}"))),
            };
            docs = Some(current);
        }
        Ok(stream::iter(docs.unwrap_or_default().into_iter().map(Ok)).boxed())
    }

    async fn watch(&self, clauses: &[Filter], opts: &WatchOptions) -> Result<ChangeCursor, StoreError> {
        // Subscribe under the lock so nothing falls between backlog and live feed.
        let (backlog, rx, last_seq) = {
            let state = self.inner.state.read();
            let backlog = Self::backlog(&state, &opts.start)?;
            (VecDeque::from(backlog), self.inner.tx.subscribe(), state.seq)
        };
        let clauses = clauses.to_vec();
        let full_document = opts.full_document;
        let prepare = move |record: ChangeRecord| -> Option<Document> {
            let mut n = record.notification;
            if !eval_all(&n, &clauses, false) {
                return None;
            }
            if !full_document && matches!(n.get_str("operationType"), Ok("update")) {
                n.remove("fullDocument");
            }
            Some(n)
        };
        let cursor = stream::unfold((backlog, rx, last_seq, prepare), |(mut backlog, mut rx, mut last, prepare)| async move {
            // u64::MAX marks a stream already ended by lag.
            if last == u64::MAX {
                return None;
            }
            loop {
                let record = if let Some(r) = backlog.pop_front() {
                    r
                } else {
                    match rx.recv().await {
                        Ok(r) if r.seq <= last => continue,
                        Ok(r) => r,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            let err = StoreError::ResumePointLost(format!("change stream fell {n} notifications behind"));
                            return Some((Err(err), (backlog, rx, u64::MAX, prepare)));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                };
                last = last.max(record.seq);
                if let Some(n) = prepare(record) {
                    return Some((Ok(n), (backlog, rx, last, prepare)));
                }
            }
        });
        Ok(cursor.boxed())
    }

    async fn find_one(&self, clauses: &[Filter], opts: &FindOptions) -> Result<Option<Document>, StoreError> {
        Ok(self.matching(clauses, opts.case_insensitive).into_iter().next())
    }

    async fn insert_one(&self, mut doc: Document) -> Result<(), StoreError> {
        let id = doc.get("_id").cloned().unwrap_or_else(|| Bson::ObjectId(bson::oid::ObjectId::new()));
        doc.insert("_id", id.clone());
        let mut state = self.inner.state.write();
        if state.position(&id).is_some() {
            return Err(StoreError::DuplicateKey(format!("_id {id} already exists")));
        }
        state.docs.push(doc.clone());
        self.record(&mut state, "insert", id, Some(doc));
        Ok(())
    }

    async fn find_one_and_update(&self, clauses: &[Filter], update: Document) -> Result<UpdateOutcome, StoreError> {
        let set = update
            .get_document("$set")
            .map_err(|_| StoreError::Backend("update must be a $set document".into()))?;
        let mut state = self.inner.state.write();
        let Some(pos) = state.docs.iter().position(|d| eval_all(d, clauses, false)) else {
            return Ok(UpdateOutcome::NotMatched);
        };
        let mut updated = state.docs[pos].clone();
        for (path, value) in set {
            set_path(&mut updated, path, value.clone());
        }
        state.docs[pos] = updated.clone();
        let id = updated.get("_id").cloned().unwrap_or(Bson::Null);
        self.record(&mut state, "update", id, Some(updated.clone()));
        Ok(UpdateOutcome::Updated(updated))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_are_sixteen_hex_digits() {
        let m = encode_marker(42);
        assert_eq!(m.len(), 16);
        assert_eq!(decode_marker(&m), Some(42));
        assert_eq!(decode_marker("xyz"), None);
    }

    #[test]
    fn set_path_creates_intermediate_documents() {
        let mut d = doc! { "a": 1 };
        set_path(&mut d, "b.c.d", Bson::from("x"));
        assert_eq!(d, doc! { "a": 1, "b": { "c": { "d": "x" } } });
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = InMemoryStore::new();
        store.insert_one(doc! { "_id": "SOLO_1" }).await.unwrap();
        let err = store.insert_one(doc! { "_id": "SOLO_1" }).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn stale_marker_reports_lost_resume_point() {
        let store = InMemoryStore::with_retention(2);
        for i in 0..4 {
            store.insert_one(doc! { "_id": i }).await.unwrap();
        }
        let stale = encode_marker(1);
        let opts = WatchOptions { start: StartPosition::ResumeAfter(stale), full_document: true };
        assert!(matches!(store.watch(&[], &opts).await, Err(StoreError::ResumePointLost(_))));
        let fresh = WatchOptions { start: StartPosition::ResumeAfter(encode_marker(2)), full_document: true };
        assert!(store.watch(&[], &fresh).await.is_ok());
    }
}
