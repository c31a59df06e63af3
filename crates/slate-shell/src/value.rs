use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bson::Decimal128;
use bson::oid::ObjectId;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::cursor::Cursor;
use crate::date;
use crate::error::ShellError;
use crate::result::{
    BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult,
};

/// A value produced by a shell operation, with its semantic shape preserved.
///
/// Exactly one variant is active. Integers keep the width they were
/// classified with, so a document round-trips without widening.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeResult {
    String(String),
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Null,
    Void,
    Document(ResultDocument),
    Array(Vec<NativeResult>),
    /// A callable script value. Carries nothing; functions are opaque.
    Function,
    ObjectId(ObjectId),
    Decimal128(Decimal128),
    /// A 64-bit integer created through the `NumberLong` constructor.
    Long(i64),
    Timestamp {
        seconds: u32,
        increment: u32,
    },
    Regex {
        pattern: String,
        flags: String,
    },
    Symbol(String),
    Binary {
        subtype: u8,
        bytes: Vec<u8>,
    },
    Code {
        body: String,
    },
    CodeWithScope {
        body: String,
        scope: ResultDocument,
    },
    DbRef {
        database: Option<String>,
        collection: String,
        id: Box<NativeResult>,
    },
    MinKey,
    MaxKey,
    Uuid(Uuid),
    Date(bson::DateTime),
    Cursor(CursorHandle),
    AggregationCursor(CursorHandle),
    InsertOne(InsertOneResult),
    InsertMany(InsertManyResult),
    Delete(DeleteResult),
    Update(UpdateResult),
    BulkWrite(BulkWriteResult),
}

impl NativeResult {
    pub fn type_name(&self) -> &'static str {
        match self {
            NativeResult::String(_) => "String",
            NativeResult::Boolean(_) => "Boolean",
            NativeResult::Int32(_) => "Int32",
            NativeResult::Int64(_) => "Int64",
            NativeResult::Float32(_) => "Float32",
            NativeResult::Float64(_) => "Float64",
            NativeResult::Null => "Null",
            NativeResult::Void => "Void",
            NativeResult::Document(_) => "Document",
            NativeResult::Array(_) => "Array",
            NativeResult::Function => "Function",
            NativeResult::ObjectId(_) => "ObjectId",
            NativeResult::Decimal128(_) => "Decimal128",
            NativeResult::Long(_) => "Long",
            NativeResult::Timestamp { .. } => "Timestamp",
            NativeResult::Regex { .. } => "Regex",
            NativeResult::Symbol(_) => "Symbol",
            NativeResult::Binary { .. } => "Binary",
            NativeResult::Code { .. } => "Code",
            NativeResult::CodeWithScope { .. } => "CodeWithScope",
            NativeResult::DbRef { .. } => "DBRef",
            NativeResult::MinKey => "MinKey",
            NativeResult::MaxKey => "MaxKey",
            NativeResult::Uuid(_) => "UUID",
            NativeResult::Date(_) => "Date",
            NativeResult::Cursor(_) => "Cursor",
            NativeResult::AggregationCursor(_) => "AggregationCursor",
            NativeResult::InsertOne(_) => "InsertOneResult",
            NativeResult::InsertMany(_) => "InsertManyResult",
            NativeResult::Delete(_) => "DeleteResult",
            NativeResult::Update(_) => "UpdateResult",
            NativeResult::BulkWrite(_) => "BulkWriteResult",
        }
    }

    /// Render an identifier value the way write results report it.
    pub fn to_id_string(&self) -> Result<String, ShellError> {
        match self {
            NativeResult::String(s) | NativeResult::Symbol(s) => Ok(s.clone()),
            NativeResult::ObjectId(oid) => Ok(oid.to_hex()),
            NativeResult::Int32(n) => Ok(n.to_string()),
            NativeResult::Int64(n) | NativeResult::Long(n) => Ok(n.to_string()),
            NativeResult::Uuid(u) => Ok(u.to_string()),
            other => Err(ShellError::Argument(format!(
                "{} cannot be used as an id",
                other.type_name()
            ))),
        }
    }

    pub fn as_document(&self) -> Option<&ResultDocument> {
        match self {
            NativeResult::Document(doc) => Some(doc),
            _ => None,
        }
    }
}

/// Shell-style rendering, as scripts see it through `tostring`.
impl fmt::Display for NativeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeResult::String(s) => write!(f, "{s:?}"),
            NativeResult::Boolean(b) => write!(f, "{b}"),
            NativeResult::Int32(n) => write!(f, "{n}"),
            NativeResult::Int64(n) => write!(f, "{n}"),
            NativeResult::Float32(n) => write!(f, "{n}"),
            NativeResult::Float64(n) => write!(f, "{n}"),
            NativeResult::Null => f.write_str("null"),
            NativeResult::Void => f.write_str("undefined"),
            NativeResult::Document(doc) => write!(f, "{doc}"),
            NativeResult::Array(items) => {
                if items.is_empty() {
                    return f.write_str("[]");
                }
                f.write_str("[ ")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(" ]")
            }
            NativeResult::Function => f.write_str("[Function]"),
            NativeResult::ObjectId(oid) => write!(f, "ObjectId(\"{}\")", oid.to_hex()),
            NativeResult::Decimal128(d) => write!(f, "NumberDecimal(\"{d}\")"),
            NativeResult::Long(n) => write!(f, "NumberLong(\"{n}\")"),
            NativeResult::Timestamp { seconds, increment } => {
                write!(f, "Timestamp({{ t: {seconds}, i: {increment} }})")
            }
            NativeResult::Regex { pattern, flags } => write!(f, "/{pattern}/{flags}"),
            NativeResult::Symbol(s) => write!(f, "Symbol({s:?})"),
            NativeResult::Binary { subtype, bytes } => {
                write!(f, "BinData({subtype}, \"{}\")", STANDARD.encode(bytes))
            }
            NativeResult::Code { body } => write!(f, "Code({body:?})"),
            NativeResult::CodeWithScope { body, scope } => write!(f, "Code({body:?}, {scope})"),
            NativeResult::DbRef {
                database,
                collection,
                id,
            } => match database {
                Some(db) => write!(f, "DBRef({collection:?}, {id}, {db:?})"),
                None => write!(f, "DBRef({collection:?}, {id})"),
            },
            NativeResult::MinKey => f.write_str("MinKey()"),
            NativeResult::MaxKey => f.write_str("MaxKey()"),
            NativeResult::Uuid(u) => write!(f, "UUID(\"{u}\")"),
            NativeResult::Date(d) => match date::format_date(*d) {
                Ok(text) => write!(f, "ISODate(\"{text}\")"),
                Err(_) => write!(f, "Date({})", d.timestamp_millis()),
            },
            NativeResult::Cursor(_) => f.write_str("Cursor"),
            NativeResult::AggregationCursor(_) => f.write_str("AggregationCursor"),
            NativeResult::InsertOne(r) => write!(
                f,
                "{{ acknowledged: {}, insertedId: {:?} }}",
                r.acknowledged, r.inserted_id
            ),
            NativeResult::InsertMany(r) => write!(
                f,
                "{{ acknowledged: {}, insertedIds: {:?} }}",
                r.acknowledged, r.inserted_ids
            ),
            NativeResult::Delete(r) => write!(
                f,
                "{{ acknowledged: {}, deletedCount: {} }}",
                r.acknowledged, r.deleted_count
            ),
            NativeResult::Update(r) => write!(
                f,
                "{{ acknowledged: {}, matchedCount: {}, modifiedCount: {} }}",
                r.acknowledged, r.matched_count, r.modified_count
            ),
            NativeResult::BulkWrite(r) => write!(
                f,
                "{{ acknowledged: {}, insertedCount: {}, matchedCount: {}, modifiedCount: {}, \
                 deletedCount: {}, upsertedCount: {}, upsertedIds: {:?} }}",
                r.acknowledged,
                r.inserted_count,
                r.matched_count,
                r.modified_count,
                r.deleted_count,
                r.upserted_count,
                r.upserted_ids
            ),
        }
    }
}

// ── ResultDocument ──────────────────────────────────────────

/// Ordered string-keyed mapping. Inserting an existing key replaces its
/// value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultDocument {
    entries: Vec<(String, NativeResult)>,
}

impl ResultDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: NativeResult) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&NativeResult> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NativeResult)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for ResultDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return f.write_str("{}");
        }
        f.write_str("{ ")?;
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}: {value}")?;
        }
        f.write_str(" }")
    }
}

impl IntoIterator for ResultDocument {
    type Item = (String, NativeResult);
    type IntoIter = std::vec::IntoIter<(String, NativeResult)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<K: Into<String>> FromIterator<(K, NativeResult)> for ResultDocument {
    fn from_iter<I: IntoIterator<Item = (K, NativeResult)>>(iter: I) -> Self {
        let mut doc = ResultDocument::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

// ── CursorHandle ────────────────────────────────────────────

/// Shared reference to a cursor engine.
///
/// The engine keeps exclusive ownership of its bound stream; the handle only
/// lets the host and the script runtime reach the same engine. Two handles are
/// equal when they point at the same cursor.
#[derive(Clone)]
pub struct CursorHandle {
    inner: Arc<Mutex<Cursor>>,
    close_signal: Arc<AtomicBool>,
}

impl CursorHandle {
    pub fn new(cursor: Cursor) -> Self {
        let close_signal = cursor.close_signal();
        Self {
            inner: Arc::new(Mutex::new(cursor)),
            close_signal,
        }
    }

    /// Run `f` with exclusive access to the cursor.
    ///
    /// Re-entering the same cursor (e.g. from inside a `forEach` callback)
    /// fails instead of deadlocking.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&mut Cursor) -> Result<R, ShellError>,
    ) -> Result<R, ShellError> {
        let mut guard = self
            .inner
            .try_lock()
            .ok_or_else(|| ShellError::IllegalState("cursor is already in use".into()))?;
        f(&mut guard)
    }

    /// Readable while the cursor is busy; falls back to the close signal.
    pub fn is_closed(&self) -> bool {
        match self.inner.try_lock() {
            Some(cursor) => cursor.is_closed(),
            None => self.close_signal.load(Ordering::Acquire),
        }
    }

    /// Close the cursor. Never fails.
    ///
    /// A cursor that is busy (closed from inside its own `forEach`) observes
    /// the request before producing its next element.
    pub fn close(&self) {
        self.close_signal.store(true, Ordering::Release);
        if let Some(mut guard) = self.inner.try_lock() {
            guard.close();
        }
    }
}

impl PartialEq for CursorHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CursorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorHandle")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .finish()
    }
}
