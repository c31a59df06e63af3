use std::fmt;
use std::str::FromStr;

use bson::{Bson, Document, doc};

use crate::error::ShellError;

/// Modifiers accumulated by a cursor before execution.
///
/// Stored as an ordered document keyed by modifier name, so the query
/// source sees them in the order they were first set. Setting a modifier
/// again replaces its value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorOptions {
    modifiers: Document,
}

impl CursorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<Bson>) {
        self.modifiers.insert(name, value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Bson> {
        self.modifiers.get(name)
    }

    pub fn as_document(&self) -> &Document {
        &self.modifiers
    }

    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }

    pub fn sort(&self) -> Option<&Document> {
        self.modifiers.get_document("sort").ok()
    }

    pub fn projection(&self) -> Option<&Document> {
        self.modifiers.get_document("projection").ok()
    }

    pub fn limit(&self) -> Option<i64> {
        self.modifiers.get_i64("limit").ok()
    }

    pub fn skip(&self) -> Option<i64> {
        self.modifiers.get_i64("skip").ok()
    }

    pub fn batch_size(&self) -> Option<i64> {
        self.modifiers.get_i64("batchSize").ok()
    }

    pub fn max_time_ms(&self) -> Option<i64> {
        self.modifiers.get_i64("maxTimeMS").ok()
    }

    pub fn flag(&self, name: &str) -> bool {
        self.modifiers.get_bool(name).unwrap_or(false)
    }

    pub fn read_preference(&self) -> Result<Option<ReadPreference>, ShellError> {
        match self.modifiers.get_document("readPreference") {
            Ok(doc) => ReadPreference::from_document(doc).map(Some),
            Err(_) => Ok(None),
        }
    }
}

// ── Read preference ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPreferenceMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreferenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPreferenceMode::Primary => "primary",
            ReadPreferenceMode::PrimaryPreferred => "primaryPreferred",
            ReadPreferenceMode::Secondary => "secondary",
            ReadPreferenceMode::SecondaryPreferred => "secondaryPreferred",
            ReadPreferenceMode::Nearest => "nearest",
        }
    }
}

impl fmt::Display for ReadPreferenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadPreferenceMode {
    type Err = ShellError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(ReadPreferenceMode::Primary),
            "primaryPreferred" => Ok(ReadPreferenceMode::PrimaryPreferred),
            "secondary" => Ok(ReadPreferenceMode::Secondary),
            "secondaryPreferred" => Ok(ReadPreferenceMode::SecondaryPreferred),
            "nearest" => Ok(ReadPreferenceMode::Nearest),
            other => Err(ShellError::Argument(format!(
                "unknown read preference mode: {other}"
            ))),
        }
    }
}

/// A set of tag constraints a server must satisfy, as `(tag, value)` pairs.
pub type TagSet = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPreference {
    pub mode: ReadPreferenceMode,
    /// Empty means no tag constraints.
    pub tag_sets: Vec<TagSet>,
}

impl ReadPreference {
    /// Build a read preference from tag-set documents.
    ///
    /// Each document's key/value pairs become the constraints of one tag set.
    pub fn new(mode: ReadPreferenceMode, tag_sets: &[Document]) -> Result<Self, ShellError> {
        let tag_sets = tag_sets
            .iter()
            .map(tag_set)
            .collect::<Result<Vec<_>, _>>()?;
        if mode == ReadPreferenceMode::Primary && tag_sets.iter().any(|set| !set.is_empty()) {
            return Err(ShellError::Argument(
                "read preference mode primary cannot be combined with tags".into(),
            ));
        }
        Ok(Self { mode, tag_sets })
    }

    pub fn to_document(&self) -> Document {
        let tag_sets: Vec<Bson> = self
            .tag_sets
            .iter()
            .map(|set| {
                let mut doc = Document::new();
                for (tag, value) in set {
                    doc.insert(tag.clone(), value.clone());
                }
                Bson::Document(doc)
            })
            .collect();
        doc! { "mode": self.mode.as_str(), "tagSets": tag_sets }
    }

    pub fn from_document(doc: &Document) -> Result<Self, ShellError> {
        let mode = doc
            .get_str("mode")
            .map_err(|_| ShellError::Argument("read preference has no mode".into()))?
            .parse()?;
        let tag_sets = match doc.get_array("tagSets") {
            Ok(sets) => sets
                .iter()
                .map(|set| match set {
                    Bson::Document(d) => Ok(d.clone()),
                    other => Err(ShellError::Argument(format!(
                        "tag set must be a document, got {other}"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => Vec::new(),
        };
        ReadPreference::new(mode, &tag_sets)
    }
}

fn tag_set(doc: &Document) -> Result<TagSet, ShellError> {
    doc.iter()
        .map(|(tag, value)| match value {
            Bson::String(s) => Ok((tag.clone(), s.clone())),
            other => Err(ShellError::Argument(format!(
                "tag {tag} must have a string value, got {other}"
            ))),
        })
        .collect()
}
