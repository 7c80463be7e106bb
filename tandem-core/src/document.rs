//! Mergeable rich-text document.
//!
//! [`CollabDocument`] wraps a yrs [`Doc`] whose root map `content` holds the
//! document's top-level fields. String fields are stored as collaborative
//! text so concurrent edits merge per character; every other JSON value is
//! stored atomically.
//!
//! Every committed transaction that changes the document is reported to the
//! registered listeners as a [`DocChange`] carrying the encoded delta, the
//! [`OriginTag`] of the mutation and a monotonically increasing sequence
//! number. Listeners run after the transaction is released, so they may read
//! the document.

use crate::json::{any_to_json, is_empty_value, json_to_any};
use crate::observer::{ListenerSet, Subscription};
use log::debug;
use serde_json::{Map as JsonMap, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, Map, OffsetKind, Options, Out, ReadTxn, StateVector, Text, TextPrelim,
    Transact, TransactionMut, Update, WriteTxn,
};

/// Root map holding the document fields.
pub const CONTENT_ROOT: &str = "content";

/// Where a mutation came from. Used only to decide whether a change is
/// published; merge semantics never look at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OriginTag {
    /// Produced by this client (an edit or a hydration write).
    Local,
    /// Applied from a delta received over the transport.
    RemoteApplied,
}

/// One committed change to a document.
#[derive(Debug, Clone)]
pub struct DocChange {
    /// Sequence number, strictly increasing per document instance.
    pub seq: u64,
    pub origin: OriginTag,
    /// yrs v1 update containing exactly this change.
    pub update: Arc<[u8]>,
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("malformed update: {0}")]
    Decode(#[from] yrs::encoding::read::Error),

    #[error("update could not be integrated: {0}")]
    Apply(#[from] yrs::error::UpdateError),

    #[error("document content must be a JSON object, got {0}")]
    InvalidContent(String),

    #[error("field `{0}` is not a text field")]
    NotText(String),

    #[error("range {index}..{end} is out of bounds for field `{field}` (length {len})")]
    OutOfBounds {
        field: String,
        index: u32,
        end: u32,
        len: u32,
    },
}

/// A document that can encode and apply deltas and report its changes.
///
/// The trait is object safe so sessions can hold `Arc<dyn MergeableDocument>`.
pub trait MergeableDocument: Send + Sync + 'static {
    /// Apply an encoded delta. Returns the sequence number of the resulting
    /// change, or `None` when the delta carried nothing new.
    fn apply_encoded(&self, update: &[u8], origin: OriginTag) -> Result<Option<u64>, DocumentError>;

    /// Observe committed changes until the returned subscription is dropped.
    fn on_change(&self, listener: Box<dyn Fn(&DocChange) + Send + Sync>) -> Subscription;

    /// Current content as a JSON object.
    fn query_structure(&self) -> Value;

    /// True when the document has no fields, or a single field with no
    /// content (the default empty node an editor creates).
    fn is_structurally_empty(&self) -> bool;

    /// Replace the whole content with `content` in one local transaction.
    /// Returns the sequence number of the change.
    fn replace_content(&self, content: &Value) -> Result<u64, DocumentError>;

    /// Like [`replace_content`](Self::replace_content), but only if the
    /// document is structurally empty when the write transaction starts.
    /// Returns `None`, leaving the document untouched, when it is not.
    fn replace_if_empty(&self, content: &Value) -> Result<Option<u64>, DocumentError>;

    /// Full state as a single update, suitable for bootstrapping a replica.
    fn encode_state(&self) -> Vec<u8>;

    /// Sequence number of the most recent change (0 if none).
    fn last_seq(&self) -> u64;
}

/// yrs-backed [`MergeableDocument`].
pub struct CollabDocument {
    doc: Doc,
    listeners: ListenerSet<DocChange>,
    seq: AtomicU64,
}

impl CollabDocument {
    pub fn new() -> Self {
        let options = Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        };
        Self {
            doc: Doc::with_options(options),
            listeners: ListenerSet::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Client id yrs uses for items created by this replica.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Set a top-level field. Strings become collaborative text.
    pub fn set_field(&self, field: &str, value: &Value) -> Result<Option<u64>, DocumentError> {
        self.mutate(OriginTag::Local, |txn| {
            let content = txn.get_or_insert_map(CONTENT_ROOT);
            insert_value(&content, txn, field, value);
            Ok(())
        })
    }

    pub fn remove_field(&self, field: &str) -> Result<Option<u64>, DocumentError> {
        self.mutate(OriginTag::Local, |txn| {
            let content = txn.get_or_insert_map(CONTENT_ROOT);
            content.remove(txn, field);
            Ok(())
        })
    }

    /// Insert `chunk` into a text field at `index` (UTF-16 code units).
    /// A missing field is created as empty text first.
    pub fn insert_text(
        &self,
        field: &str,
        index: u32,
        chunk: &str,
    ) -> Result<Option<u64>, DocumentError> {
        self.mutate(OriginTag::Local, |txn| {
            let content = txn.get_or_insert_map(CONTENT_ROOT);
            let text = match content.get(txn, field) {
                Some(Out::YText(text)) => text,
                Some(_) => return Err(DocumentError::NotText(field.to_string())),
                None => content.insert(txn, field, TextPrelim::new("")),
            };
            let len = text.len(txn);
            if index > len {
                return Err(DocumentError::OutOfBounds {
                    field: field.to_string(),
                    index,
                    end: index,
                    len,
                });
            }
            text.insert(txn, index, chunk);
            Ok(())
        })
    }

    /// Remove `len` UTF-16 code units from a text field starting at `index`.
    pub fn remove_text(&self, field: &str, index: u32, len: u32) -> Result<Option<u64>, DocumentError> {
        self.mutate(OriginTag::Local, |txn| {
            let content = txn.get_or_insert_map(CONTENT_ROOT);
            let text = match content.get(txn, field) {
                Some(Out::YText(text)) => text,
                _ => return Err(DocumentError::NotText(field.to_string())),
            };
            let current = text.len(txn);
            let end = index.saturating_add(len);
            if end > current {
                return Err(DocumentError::OutOfBounds {
                    field: field.to_string(),
                    index,
                    end,
                    len: current,
                });
            }
            if len > 0 {
                text.remove_range(txn, index, len);
            }
            Ok(())
        })
    }

    /// Plain-text value of a field, if it is a text field.
    pub fn text(&self, field: &str) -> Option<String> {
        let txn = self.doc.transact();
        let content = txn.get_map(CONTENT_ROOT)?;
        match content.get(&txn, field) {
            Some(Out::YText(text)) => Some(text.get_string(&txn)),
            _ => None,
        }
    }

    /// Run `f` in one write transaction tagged `origin`, then notify
    /// listeners if the transaction changed anything.
    ///
    /// A failing `f` may leave partial edits in the transaction; yrs has no
    /// rollback, so the operations above validate before writing.
    fn mutate<F>(&self, origin: OriginTag, f: F) -> Result<Option<u64>, DocumentError>
    where
        F: FnOnce(&mut TransactionMut) -> Result<(), DocumentError>,
    {
        let change = {
            let mut txn = self.doc.transact_mut();
            f(&mut txn)?;
            let changed = txn.before_state() != &txn.state_vector() || !txn.delete_set().is_empty();
            if changed {
                let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
                Some(DocChange {
                    seq,
                    origin,
                    update: Arc::from(txn.encode_update_v1()),
                })
            } else {
                None
            }
        };

        Ok(change.map(|change| {
            debug!(
                "document change seq={} origin={:?} ({} bytes)",
                change.seq,
                change.origin,
                change.update.len()
            );
            self.listeners.emit(&change);
            change.seq
        }))
    }
}

impl Default for CollabDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CollabDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabDocument")
            .field("client_id", &self.client_id())
            .field("seq", &self.last_seq())
            .finish()
    }
}

fn insert_value(content: &yrs::MapRef, txn: &mut TransactionMut, field: &str, value: &Value) {
    match value {
        Value::String(s) => {
            content.insert(txn, field, TextPrelim::new(s.as_str()));
        }
        other => {
            content.insert(txn, field, json_to_any(other));
        }
    }
}

impl MergeableDocument for CollabDocument {
    fn apply_encoded(&self, update: &[u8], origin: OriginTag) -> Result<Option<u64>, DocumentError> {
        let update = Update::decode_v1(update)?;
        self.mutate(origin, |txn| {
            txn.apply_update(update)?;
            Ok(())
        })
    }

    fn on_change(&self, listener: Box<dyn Fn(&DocChange) + Send + Sync>) -> Subscription {
        self.listeners.subscribe(listener)
    }

    fn query_structure(&self) -> Value {
        structure(&self.doc.transact())
    }

    fn is_structurally_empty(&self) -> bool {
        is_empty_structure(&self.query_structure())
    }

    fn replace_content(&self, content: &Value) -> Result<u64, DocumentError> {
        let fields = object_fields(content)?;
        let seq = self.mutate(OriginTag::Local, |txn| {
            overwrite(txn, fields);
            Ok(())
        })?;

        Ok(seq.unwrap_or_else(|| self.last_seq()))
    }

    fn replace_if_empty(&self, content: &Value) -> Result<Option<u64>, DocumentError> {
        let fields = object_fields(content)?;
        let mut replaced = false;
        let seq = self.mutate(OriginTag::Local, |txn| {
            if is_empty_structure(&structure(&*txn)) {
                overwrite(txn, fields);
                replaced = true;
            }
            Ok(())
        })?;

        if !replaced {
            debug!("replace_if_empty: document not empty, left untouched");
            return Ok(None);
        }
        Ok(Some(seq.unwrap_or_else(|| self.last_seq())))
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

fn structure<T: ReadTxn>(txn: &T) -> Value {
    match txn.get_map(CONTENT_ROOT) {
        Some(content) => any_to_json(&content.to_json(txn)),
        None => Value::Object(JsonMap::new()),
    }
}

/// No fields, or a single field with no content (the default empty node an
/// editor creates).
fn is_empty_structure(value: &Value) -> bool {
    match value {
        Value::Object(fields) => {
            fields.is_empty() || (fields.len() == 1 && fields.values().all(is_empty_value))
        }
        other => is_empty_value(other),
    }
}

fn object_fields(content: &Value) -> Result<&JsonMap<String, Value>, DocumentError> {
    match content {
        Value::Object(fields) => Ok(fields),
        other => Err(DocumentError::InvalidContent(type_name(other).to_string())),
    }
}

fn overwrite(txn: &mut TransactionMut, fields: &JsonMap<String, Value>) {
    let root = txn.get_or_insert_map(CONTENT_ROOT);
    root.clear(txn);
    for (field, value) in fields {
        insert_value(&root, txn, field, value);
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn record(doc: &CollabDocument) -> (Arc<Mutex<Vec<DocChange>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = doc.on_change(Box::new(move |change: &DocChange| {
            sink.lock().unwrap().push(change.clone());
        }));
        (seen, sub)
    }

    #[test]
    fn test_new_document_is_empty() {
        let doc = CollabDocument::new();
        assert!(doc.is_structurally_empty());
        assert_eq!(doc.query_structure(), json!({}));
        assert_eq!(doc.last_seq(), 0);
    }

    #[test]
    fn test_single_empty_field_counts_as_empty() {
        let doc = CollabDocument::new();
        doc.set_field("body", &json!("")).unwrap();
        assert!(doc.is_structurally_empty());

        doc.insert_text("body", 0, "x").unwrap();
        assert!(!doc.is_structurally_empty());
    }

    #[test]
    fn test_two_empty_fields_are_not_empty() {
        let doc = CollabDocument::new();
        doc.set_field("a", &json!("")).unwrap();
        doc.set_field("b", &json!("")).unwrap();
        assert!(!doc.is_structurally_empty());
    }

    #[test]
    fn test_local_edit_emits_local_change() {
        let doc = CollabDocument::new();
        let (seen, _sub) = record(&doc);

        let seq = doc.set_field("title", &json!("Notes")).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].origin, OriginTag::Local);
        assert_eq!(Some(seen[0].seq), seq);
        assert!(!seen[0].update.is_empty());
    }

    #[test]
    fn test_remote_apply_is_tagged_and_converges() {
        let a = CollabDocument::new();
        let b = CollabDocument::new();
        let (seen, _sub) = record(&b);

        a.set_field("title", &json!("Hello")).unwrap();
        b.apply_encoded(&a.encode_state(), OriginTag::RemoteApplied)
            .unwrap();

        assert_eq!(b.query_structure(), json!({ "title": "Hello" }));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].origin, OriginTag::RemoteApplied);
    }

    #[test]
    fn test_duplicate_update_is_a_no_op() {
        let a = CollabDocument::new();
        let b = CollabDocument::new();
        let (seen, _sub) = record(&b);

        a.insert_text("body", 0, "abc").unwrap();
        let state = a.encode_state();
        assert!(b.apply_encoded(&state, OriginTag::RemoteApplied).unwrap().is_some());
        assert!(b.apply_encoded(&state, OriginTag::RemoteApplied).unwrap().is_none());

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(b.text("body").as_deref(), Some("abc"));
    }

    #[test]
    fn test_concurrent_text_edits_merge() {
        let a = CollabDocument::new();
        let b = CollabDocument::new();
        a.insert_text("body", 0, "hello").unwrap();
        b.apply_encoded(&a.encode_state(), OriginTag::RemoteApplied)
            .unwrap();

        a.insert_text("body", 5, " world").unwrap();
        b.insert_text("body", 0, ">> ").unwrap();

        let from_a = a.encode_state();
        let from_b = b.encode_state();
        a.apply_encoded(&from_b, OriginTag::RemoteApplied).unwrap();
        b.apply_encoded(&from_a, OriginTag::RemoteApplied).unwrap();

        assert_eq!(a.text("body"), b.text("body"));
        assert_eq!(a.text("body").as_deref(), Some(">> hello world"));
    }

    #[test]
    fn test_replace_content_overwrites_fields() {
        let doc = CollabDocument::new();
        doc.set_field("old", &json!("gone")).unwrap();

        let seq = doc
            .replace_content(&json!({ "title": "A", "pinned": true }))
            .unwrap();

        assert_eq!(seq, doc.last_seq());
        assert_eq!(doc.query_structure(), json!({ "title": "A", "pinned": true }));
        assert_eq!(doc.text("title").as_deref(), Some("A"));
    }

    #[test]
    fn test_replace_content_rejects_non_object() {
        let doc = CollabDocument::new();
        let err = doc.replace_content(&json!(["nope"])).unwrap_err();
        assert!(matches!(err, DocumentError::InvalidContent(_)));
        assert_eq!(doc.last_seq(), 0);
    }

    #[test]
    fn test_replace_if_empty_fills_an_empty_document() {
        let doc = CollabDocument::new();
        doc.set_field("body", &json!("")).unwrap();
        let (seen, _sub) = record(&doc);

        let seq = doc.replace_if_empty(&json!({ "title": "Seeded" })).unwrap();

        assert_eq!(seq, Some(doc.last_seq()));
        assert_eq!(doc.query_structure(), json!({ "title": "Seeded" }));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_replace_if_empty_leaves_live_content_alone() {
        let doc = CollabDocument::new();
        let peer = CollabDocument::new();
        peer.set_field("title", &json!("live")).unwrap();
        doc.apply_encoded(&peer.encode_state(), OriginTag::RemoteApplied)
            .unwrap();
        let before = doc.last_seq();
        let (seen, _sub) = record(&doc);

        assert_eq!(doc.replace_if_empty(&json!({ "title": "stale" })).unwrap(), None);
        assert_eq!(doc.query_structure(), json!({ "title": "live" }));
        assert_eq!(doc.last_seq(), before);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_text_edit_bounds_are_checked() {
        let doc = CollabDocument::new();
        doc.insert_text("body", 0, "abc").unwrap();

        assert!(matches!(
            doc.insert_text("body", 9, "x"),
            Err(DocumentError::OutOfBounds { .. })
        ));
        assert!(matches!(
            doc.remove_text("body", 2, 5),
            Err(DocumentError::OutOfBounds { .. })
        ));

        doc.remove_text("body", 1, 1).unwrap();
        assert_eq!(doc.text("body").as_deref(), Some("ac"));
    }

    #[test]
    fn test_text_ops_on_non_text_field_fail() {
        let doc = CollabDocument::new();
        doc.set_field("count", &json!(3)).unwrap();
        assert!(matches!(
            doc.insert_text("count", 0, "x"),
            Err(DocumentError::NotText(_))
        ));
    }

    #[test]
    fn test_malformed_update_is_rejected() {
        let doc = CollabDocument::new();
        let err = doc
            .apply_encoded(&[0xff, 0xff, 0xff], OriginTag::RemoteApplied)
            .unwrap_err();
        assert!(matches!(err, DocumentError::Decode(_)));
        assert!(doc.is_structurally_empty());
    }

    #[test]
    fn test_remove_field() {
        let doc = CollabDocument::new();
        doc.set_field("a", &json!(1)).unwrap();
        doc.set_field("b", &json!(2)).unwrap();
        doc.remove_field("a").unwrap();
        assert_eq!(doc.query_structure(), json!({ "b": 2 }));
    }
}
