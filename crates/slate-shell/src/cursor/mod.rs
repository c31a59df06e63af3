mod options;
mod source;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bson::{Bson, Document};

use crate::error::ShellError;
use crate::value::NativeResult;

pub use options::{CursorOptions, ReadPreference, ReadPreferenceMode, TagSet};
pub use source::{QuerySource, ResultStream};

/// Mapping applied to every element a cursor produces.
pub type Transform = Box<dyn FnMut(NativeResult) -> Result<NativeResult, ShellError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Find,
    Aggregate,
}

/// A lazily-configured cursor over a query or aggregation.
///
/// Modifiers accumulate until the first terminal call, which binds the
/// result stream once with everything accumulated. After that the cursor is
/// executed for good and modifiers fail with
/// [`ShellError::IllegalState`]. `close` can be called from any state.
///
/// Repeated `map` calls compose left to right: `map(f).map(g)` yields
/// `g(f(doc))`.
pub struct Cursor {
    kind: CursorKind,
    source: Box<dyn QuerySource>,
    options: CursorOptions,
    transforms: Vec<Transform>,
    stream: Option<Box<dyn ResultStream>>,
    executed: bool,
    bound: bool,
    closed: bool,
    exhausted: bool,
    close_signal: Arc<AtomicBool>,
}

impl Cursor {
    pub fn find(source: impl QuerySource + 'static) -> Self {
        Self::new(CursorKind::Find, Box::new(source))
    }

    pub fn aggregate(source: impl QuerySource + 'static) -> Self {
        Self::new(CursorKind::Aggregate, Box::new(source))
    }

    pub fn new(kind: CursorKind, source: Box<dyn QuerySource>) -> Self {
        Self {
            kind,
            source,
            options: CursorOptions::new(),
            transforms: Vec::new(),
            stream: None,
            executed: false,
            bound: false,
            closed: false,
            exhausted: false,
            close_signal: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn kind(&self) -> CursorKind {
        self.kind
    }

    pub fn options(&self) -> &CursorOptions {
        &self.options
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub(crate) fn close_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.close_signal)
    }

    // ── Modifiers ───────────────────────────────────────────

    fn building(&mut self) -> Result<&mut CursorOptions, ShellError> {
        self.observe_close();
        if self.closed {
            return Err(ShellError::closed());
        }
        if self.executed {
            return Err(ShellError::already_executed());
        }
        Ok(&mut self.options)
    }

    fn modify(&mut self, name: &str, value: impl Into<Bson>) -> Result<&mut Self, ShellError> {
        self.building()?.set(name, value);
        Ok(self)
    }

    pub fn sort(&mut self, spec: Document) -> Result<&mut Self, ShellError> {
        self.modify("sort", spec)
    }

    pub fn limit(&mut self, n: i64) -> Result<&mut Self, ShellError> {
        self.modify("limit", n)
    }

    pub fn skip(&mut self, n: i64) -> Result<&mut Self, ShellError> {
        if n < 0 {
            return Err(ShellError::Argument(format!("skip must be non-negative, got {n}")));
        }
        self.modify("skip", n)
    }

    pub fn batch_size(&mut self, n: i64) -> Result<&mut Self, ShellError> {
        if n < 0 {
            return Err(ShellError::Argument(format!(
                "batchSize must be non-negative, got {n}"
            )));
        }
        self.modify("batchSize", n)
    }

    /// Index hint, either an index name or a key pattern document.
    pub fn hint(&mut self, index: Bson) -> Result<&mut Self, ShellError> {
        match index {
            Bson::String(_) | Bson::Document(_) => self.modify("hint", index),
            other => Err(ShellError::Argument(format!(
                "hint must be an index name or key pattern, got {other}"
            ))),
        }
    }

    pub fn collation(&mut self, spec: Document) -> Result<&mut Self, ShellError> {
        self.modify("collation", spec)
    }

    pub fn comment(&mut self, comment: impl Into<String>) -> Result<&mut Self, ShellError> {
        self.modify("comment", comment.into())
    }

    pub fn max(&mut self, bound: Document) -> Result<&mut Self, ShellError> {
        self.modify("max", bound)
    }

    pub fn min(&mut self, bound: Document) -> Result<&mut Self, ShellError> {
        self.modify("min", bound)
    }

    pub fn max_time_ms(&mut self, ms: i64) -> Result<&mut Self, ShellError> {
        if ms < 0 {
            return Err(ShellError::Argument(format!(
                "maxTimeMS must be non-negative, got {ms}"
            )));
        }
        self.modify("maxTimeMS", ms)
    }

    pub fn no_cursor_timeout(&mut self) -> Result<&mut Self, ShellError> {
        self.modify("noCursorTimeout", true)
    }

    pub fn tailable(&mut self, await_data: bool) -> Result<&mut Self, ShellError> {
        let options = self.building()?;
        options.set("tailable", true);
        options.set("awaitData", await_data);
        Ok(self)
    }

    pub fn oplog_replay(&mut self) -> Result<&mut Self, ShellError> {
        self.modify("oplogReplay", true)
    }

    pub fn return_key(&mut self, enabled: bool) -> Result<&mut Self, ShellError> {
        self.modify("returnKey", enabled)
    }

    pub fn read_concern(&mut self, level: impl Into<String>) -> Result<&mut Self, ShellError> {
        self.modify("readConcern", bson::doc! { "level": level.into() })
    }

    pub fn read_preference(
        &mut self,
        mode: ReadPreferenceMode,
        tag_sets: &[Document],
    ) -> Result<&mut Self, ShellError> {
        let pref = ReadPreference::new(mode, tag_sets)?;
        self.modify("readPreference", pref.to_document())
    }

    pub fn projection(&mut self, spec: Document) -> Result<&mut Self, ShellError> {
        self.modify("projection", spec)
    }

    pub fn allow_partial_results(&mut self) -> Result<&mut Self, ShellError> {
        self.modify("allowPartialResults", true)
    }

    pub fn map(&mut self, transform: Transform) -> Result<&mut Self, ShellError> {
        self.building()?;
        self.transforms.push(transform);
        Ok(self)
    }

    // ── Unsupported legacy operations ───────────────────────

    pub fn add_option(&mut self, _flag: i64) -> Result<&mut Self, ShellError> {
        Err(ShellError::NotSupported("cursor.addOption".into()))
    }

    pub fn try_clone(&self) -> Result<Cursor, ShellError> {
        Err(ShellError::NotSupported("cursor.clone".into()))
    }

    pub fn size(&self) -> Result<u64, ShellError> {
        Err(ShellError::NotSupported("cursor.size".into()))
    }

    // ── Terminal operations ─────────────────────────────────

    fn observe_close(&mut self) {
        if !self.closed && self.close_signal.load(Ordering::Acquire) {
            self.close();
        }
    }

    /// `count` and `explain` freeze the modifiers without binding, so the
    /// first iterating call still executes the query.
    fn bind(&mut self) -> Result<Option<&mut (dyn ResultStream + 'static)>, ShellError> {
        if !self.bound {
            self.executed = true;
            self.bound = true;
            tracing::debug!(
                kind = ?self.kind,
                modifiers = %self.options.as_document(),
                "binding cursor"
            );
            match self.source.execute(&self.options) {
                Ok(stream) => self.stream = Some(stream),
                Err(e) => {
                    self.exhausted = true;
                    return Err(e);
                }
            }
        }
        Ok(self.stream.as_deref_mut())
    }

    fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        self.exhausted = true;
    }

    fn apply(&mut self, value: NativeResult) -> Result<NativeResult, ShellError> {
        self.transforms.iter_mut().try_fold(value, |acc, f| f(acc))
    }

    pub fn has_next(&mut self) -> Result<bool, ShellError> {
        self.observe_close();
        if self.closed || self.exhausted {
            return Ok(false);
        }
        let more = match self.bind()? {
            Some(stream) => stream.has_next()?,
            None => false,
        };
        if !more {
            self.release();
        }
        Ok(more)
    }

    /// Next element, or `None` once the stream is drained.
    pub fn next(&mut self) -> Result<Option<NativeResult>, ShellError> {
        self.observe_close();
        if self.closed {
            return Err(ShellError::closed());
        }
        if self.exhausted {
            return Ok(None);
        }
        let doc = match self.bind()? {
            Some(stream) => stream.next()?,
            None => None,
        };
        match doc {
            Some(doc) => {
                let value = NativeResult::from_document(doc)?;
                self.apply(value).map(Some)
            }
            None => {
                self.release();
                Ok(None)
            }
        }
    }

    pub fn for_each(
        &mut self,
        mut f: impl FnMut(NativeResult) -> Result<(), ShellError>,
    ) -> Result<(), ShellError> {
        self.observe_close();
        if self.closed {
            return Err(ShellError::closed());
        }
        while self.has_next()? {
            match self.next()? {
                Some(value) => f(value)?,
                None => break,
            }
        }
        Ok(())
    }

    pub fn to_array(&mut self) -> Result<Vec<NativeResult>, ShellError> {
        let mut out = Vec::new();
        self.for_each(|value| {
            out.push(value);
            Ok(())
        })?;
        Ok(out)
    }

    /// Count matching documents on the server. Marks the cursor executed.
    pub fn count(&mut self) -> Result<u64, ShellError> {
        self.observe_close();
        if self.closed {
            return Err(ShellError::closed());
        }
        self.executed = true;
        self.source.count(&self.options)
    }

    /// Count the remaining elements by iterating them.
    pub fn itcount(&mut self) -> Result<u64, ShellError> {
        let mut n = 0;
        self.for_each(|_| {
            n += 1;
            Ok(())
        })?;
        Ok(n)
    }

    pub fn explain(&mut self, verbosity: Option<&str>) -> Result<Document, ShellError> {
        self.observe_close();
        if self.closed {
            return Err(ShellError::closed());
        }
        self.executed = true;
        self.source.explain(&self.options, verbosity)
    }

    // ── Lifecycle ───────────────────────────────────────────

    /// Release the bound stream and close the cursor for good. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        if !self.closed {
            tracing::debug!(kind = ?self.kind, executed = self.executed, "cursor closed");
        }
        self.closed = true;
        self.close_signal.store(true, Ordering::Release);
    }

    /// True once closed explicitly or once the stream has been drained.
    pub fn is_closed(&self) -> bool {
        self.closed || self.exhausted || self.close_signal.load(Ordering::Acquire)
    }

    pub fn is_exhausted(&mut self) -> Result<bool, ShellError> {
        Ok(self.is_closed() && !self.has_next()?)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;
    use crate::memory::MemorySource;

    fn docs() -> Vec<Document> {
        (1..=5).map(|i| doc! { "_id": i, "x": 6 - i }).collect()
    }

    fn ids(values: &[NativeResult]) -> Vec<i32> {
        values
            .iter()
            .map(|v| match v.as_document().and_then(|d| d.get("_id")) {
                Some(NativeResult::Int32(n)) => *n,
                other => panic!("unexpected element: {other:?}"),
            })
            .collect()
    }

    #[test]
    fn modifiers_apply_together_in_one_binding() {
        let source = MemorySource::new(docs());
        let mut cursor = Cursor::find(source.clone());
        cursor.limit(3).unwrap().sort(doc! { "x": 1 }).unwrap();
        let out = cursor.to_array().unwrap();
        assert_eq!(ids(&out), vec![5, 4, 3]);
        assert_eq!(source.executions(), 1);
    }

    #[test]
    fn modifier_after_terminal_call_fails() {
        let mut cursor = Cursor::find(MemorySource::new(docs()));
        assert!(cursor.has_next().unwrap());
        assert_eq!(
            cursor.limit(1).err(),
            Some(ShellError::IllegalState("query already executed".into()))
        );
        assert!(
            cursor
                .map(Box::new(|v: NativeResult| -> Result<NativeResult, ShellError> { Ok(v) }))
                .is_err()
        );
    }

    #[test]
    fn count_and_explain_also_execute() {
        let mut cursor = Cursor::find(MemorySource::new(docs()));
        assert_eq!(cursor.count().unwrap(), 5);
        assert!(cursor.skip(1).is_err());

        let mut cursor = Cursor::find(MemorySource::new(docs()));
        cursor.explain(None).unwrap();
        assert!(cursor.is_executed());
    }

    #[test]
    fn iteration_after_count_still_binds() {
        let source = MemorySource::new(docs());
        let mut cursor = Cursor::find(source.clone());
        cursor.limit(3).unwrap();
        assert_eq!(cursor.count().unwrap(), 5);
        assert_eq!(source.executions(), 0);
        assert_eq!(ids(&cursor.to_array().unwrap()), vec![1, 2, 3]);
        assert_eq!(source.executions(), 1);

        let mut cursor = Cursor::find(MemorySource::new(docs()));
        cursor.explain(None).unwrap();
        assert!(cursor.next().unwrap().is_some());
    }

    #[test]
    fn map_composes_left_to_right() {
        let mut cursor = Cursor::find(MemorySource::new(docs()));
        cursor
            .map(Box::new(|v| {
                let doc = v.as_document().cloned().unwrap_or_default();
                Ok(doc.get("x").cloned().unwrap_or(NativeResult::Null))
            }))
            .unwrap()
            .map(Box::new(|v| match v {
                NativeResult::Int32(n) => Ok(NativeResult::Int32(n * 10)),
                other => Ok(other),
            }))
            .unwrap();
        let out = cursor.to_array().unwrap();
        assert_eq!(out.first(), Some(&NativeResult::Int32(50)));
    }

    #[test]
    fn close_is_idempotent_and_exhausts() {
        let mut cursor = Cursor::find(MemorySource::new(docs()));
        assert!(cursor.next().unwrap().is_some());
        cursor.close();
        cursor.close();
        assert!(cursor.is_closed());
        assert!(cursor.is_exhausted().unwrap());
        assert_eq!(cursor.next().err(), Some(ShellError::closed()));
        assert!(cursor.sort(doc! {}).is_err());
    }

    #[test]
    fn drained_cursor_reports_exhausted() {
        let mut cursor = Cursor::find(MemorySource::new(docs()));
        assert_eq!(cursor.itcount().unwrap(), 5);
        assert!(cursor.is_exhausted().unwrap());
        assert_eq!(cursor.next().unwrap(), None);
    }

    #[test]
    fn legacy_operations_are_not_supported() {
        let mut cursor = Cursor::find(MemorySource::new(docs()));
        assert!(matches!(cursor.add_option(2), Err(ShellError::NotSupported(_))));
        assert!(matches!(cursor.try_clone(), Err(ShellError::NotSupported(_))));
        assert!(matches!(cursor.size(), Err(ShellError::NotSupported(_))));
    }

    #[test]
    fn invalid_hint_is_rejected() {
        let mut cursor = Cursor::find(MemorySource::new(docs()));
        assert!(matches!(
            cursor.hint(Bson::Int32(1)),
            Err(ShellError::Argument(_))
        ));
        cursor.hint(Bson::String("x_1".into())).unwrap();
        assert_eq!(cursor.options().get("hint"), Some(&Bson::String("x_1".into())));
    }
}
