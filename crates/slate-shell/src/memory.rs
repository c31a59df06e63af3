use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use bson::{Bson, Document, doc};
use parking_lot::Mutex;

use crate::cursor::{CursorOptions, QuerySource, ResultStream};
use crate::error::ShellError;

/// A [`QuerySource`] over an in-memory list of documents.
///
/// Applies `sort`, `skip`, `limit` and `projection`; other modifiers are
/// recorded but have no effect. Clones share the same documents and
/// execution counter.
#[derive(Clone)]
pub struct MemorySource {
    docs: Arc<Vec<Document>>,
    executions: Arc<AtomicUsize>,
    last_options: Arc<Mutex<Option<CursorOptions>>>,
}

impl MemorySource {
    pub fn new(docs: Vec<Document>) -> Self {
        Self {
            docs: Arc::new(docs),
            executions: Arc::new(AtomicUsize::new(0)),
            last_options: Arc::new(Mutex::new(None)),
        }
    }

    /// Number of result streams bound so far.
    pub fn executions(&self) -> usize {
        self.executions.load(AtomicOrdering::SeqCst)
    }

    /// Modifiers seen by the most recent `execute`.
    pub fn last_options(&self) -> Option<CursorOptions> {
        self.last_options.lock().clone()
    }

    fn evaluate(&self, options: &CursorOptions) -> Result<Vec<Document>, ShellError> {
        let mut docs: Vec<Document> = self.docs.as_ref().clone();

        if let Some(sort) = options.sort() {
            let keys = sort_keys(sort)?;
            docs.sort_by(|a, b| {
                for (field, descending) in &keys {
                    let ord = compare_field_values(a.get(field), b.get(field));
                    let ord = if *descending { ord.reverse() } else { ord };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let skip = options.skip().unwrap_or(0).max(0) as usize;
        // A negative limit asks for a single batch of that size.
        let take = match options.limit() {
            Some(0) | None => usize::MAX,
            Some(n) => n.unsigned_abs() as usize,
        };
        let docs = docs.into_iter().skip(skip).take(take);

        match options.projection() {
            Some(projection) => docs.map(|d| project(&d, projection)).collect(),
            None => Ok(docs.collect()),
        }
    }
}

impl QuerySource for MemorySource {
    fn execute(&mut self, options: &CursorOptions) -> Result<Box<dyn ResultStream>, ShellError> {
        self.executions.fetch_add(1, AtomicOrdering::SeqCst);
        *self.last_options.lock() = Some(options.clone());
        let docs = self.evaluate(options)?;
        Ok(Box::new(MemoryStream {
            docs: docs.into(),
            closed: false,
        }))
    }

    fn count(&mut self, _options: &CursorOptions) -> Result<u64, ShellError> {
        Ok(self.docs.len() as u64)
    }

    fn explain(
        &mut self,
        options: &CursorOptions,
        verbosity: Option<&str>,
    ) -> Result<Document, ShellError> {
        Ok(doc! {
            "queryPlanner": {
                "namespace": "memory",
                "winningPlan": { "stage": "COLLSCAN" },
            },
            "modifiers": options.as_document().clone(),
            "verbosity": verbosity.unwrap_or("queryPlanner"),
        })
    }
}

struct MemoryStream {
    docs: VecDeque<Document>,
    closed: bool,
}

impl ResultStream for MemoryStream {
    fn has_next(&mut self) -> Result<bool, ShellError> {
        Ok(!self.closed && !self.docs.is_empty())
    }

    fn next(&mut self) -> Result<Option<Document>, ShellError> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.docs.pop_front())
    }

    fn close(&mut self) {
        self.closed = true;
        self.docs.clear();
    }
}

// ── Helpers ─────────────────────────────────────────────────

fn sort_keys(sort: &Document) -> Result<Vec<(String, bool)>, ShellError> {
    sort.iter()
        .map(|(field, direction)| {
            let descending = match direction {
                Bson::Int32(n) => *n < 0,
                Bson::Int64(n) => *n < 0,
                Bson::Double(n) => *n < 0.0,
                other => {
                    return Err(ShellError::Argument(format!(
                        "sort direction for {field} must be 1 or -1, got {other}"
                    )));
                }
            };
            Ok((field.clone(), descending))
        })
        .collect()
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0,
        _ => true,
    }
}

/// Inclusion projections keep `_id` unless it is excluded explicitly;
/// exclusion projections drop the listed fields.
fn project(doc: &Document, projection: &Document) -> Result<Document, ShellError> {
    let inclusive = projection
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .any(|(_, v)| truthy(v));
    let keep_id = projection.get("_id").is_none_or(truthy);

    let mut out = Document::new();
    for (key, value) in doc {
        let keep = if key == "_id" {
            keep_id
        } else if inclusive {
            projection.get(key).is_some_and(truthy)
        } else {
            !projection.get(key).is_some_and(|v| !truthy(v))
        };
        if keep {
            out.insert(key.clone(), value.clone());
        }
    }
    Ok(out)
}

/// Missing and null sort first, then numbers, strings, booleans, dates.
fn compare_field_values(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    fn rank(v: Option<&Bson>) -> u8 {
        match v {
            None | Some(Bson::Null) => 0,
            Some(Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => 1,
            Some(Bson::String(_)) => 2,
            Some(Bson::Boolean(_)) => 3,
            Some(Bson::DateTime(_)) => 4,
            Some(_) => 5,
        }
    }

    fn number(v: &Bson) -> f64 {
        match v {
            Bson::Int32(n) => f64::from(*n),
            Bson::Int64(n) => *n as f64,
            Bson::Double(n) => *n,
            _ => 0.0,
        }
    }

    match (a, b) {
        (Some(Bson::String(x)), Some(Bson::String(y))) => x.cmp(y),
        (Some(Bson::Boolean(x)), Some(Bson::Boolean(y))) => x.cmp(y),
        (Some(Bson::DateTime(x)), Some(Bson::DateTime(y))) => x.cmp(y),
        (Some(x), Some(y)) if rank(a) == 1 && rank(b) == 1 => number(x)
            .partial_cmp(&number(y))
            .unwrap_or(Ordering::Equal),
        _ => rank(a).cmp(&rank(b)),
    }
}
