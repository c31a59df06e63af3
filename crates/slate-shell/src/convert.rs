use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document, JavaScriptCodeWithScope, Regex};
use uuid::Uuid;

use crate::error::ShellError;
use crate::value::{NativeResult, ResultDocument};

impl NativeResult {
    /// Convert a decoded BSON value.
    ///
    /// Documents carrying `$ref`/`$id` become [`NativeResult::DbRef`];
    /// binary values with the UUID subtype become [`NativeResult::Uuid`].
    pub fn from_bson(value: Bson) -> Result<Self, ShellError> {
        Ok(match value {
            Bson::Double(f) => NativeResult::Float64(f),
            Bson::String(s) => NativeResult::String(s),
            Bson::Array(items) => NativeResult::Array(
                items
                    .into_iter()
                    .map(NativeResult::from_bson)
                    .collect::<Result<_, _>>()?,
            ),
            Bson::Document(doc) => NativeResult::from_document(doc)?,
            Bson::Boolean(b) => NativeResult::Boolean(b),
            Bson::Null => NativeResult::Null,
            Bson::RegularExpression(re) => NativeResult::Regex {
                pattern: re.pattern,
                flags: re.options,
            },
            Bson::JavaScriptCode(body) => NativeResult::Code { body },
            Bson::JavaScriptCodeWithScope(code) => NativeResult::CodeWithScope {
                body: code.code,
                scope: result_document(code.scope)?,
            },
            Bson::Int32(n) => NativeResult::Int32(n),
            Bson::Int64(n) => NativeResult::Int64(n),
            Bson::Timestamp(ts) => NativeResult::Timestamp {
                seconds: ts.time,
                increment: ts.increment,
            },
            Bson::Binary(bin) => binary(bin),
            Bson::ObjectId(oid) => NativeResult::ObjectId(oid),
            Bson::DateTime(dt) => NativeResult::Date(dt),
            Bson::Symbol(s) => NativeResult::Symbol(s),
            Bson::Decimal128(d) => NativeResult::Decimal128(d),
            Bson::Undefined => NativeResult::Void,
            Bson::MaxKey => NativeResult::MaxKey,
            Bson::MinKey => NativeResult::MinKey,
            Bson::DbPointer(_) => {
                return Err(ShellError::unrecognized(
                    "DBPointer",
                    "deprecated BSON type has no shell representation",
                ));
            }
        })
    }

    pub fn from_document(doc: Document) -> Result<Self, ShellError> {
        if let (Some(Bson::String(collection)), Some(id)) = (doc.get("$ref"), doc.get("$id")) {
            let database = match doc.get("$db") {
                Some(Bson::String(db)) => Some(db.clone()),
                _ => None,
            };
            return Ok(NativeResult::DbRef {
                database,
                collection: collection.clone(),
                id: Box::new(NativeResult::from_bson(id.clone())?),
            });
        }
        Ok(NativeResult::Document(result_document(doc)?))
    }

    /// Convert back into BSON.
    ///
    /// Fails for shapes that only exist inside the shell: functions and
    /// cursors.
    pub fn to_bson(&self) -> Result<Bson, ShellError> {
        Ok(match self {
            NativeResult::String(s) => Bson::String(s.clone()),
            NativeResult::Boolean(b) => Bson::Boolean(*b),
            NativeResult::Int32(n) => Bson::Int32(*n),
            NativeResult::Int64(n) | NativeResult::Long(n) => Bson::Int64(*n),
            NativeResult::Float32(f) => Bson::Double(f64::from(*f)),
            NativeResult::Float64(f) => Bson::Double(*f),
            NativeResult::Null => Bson::Null,
            NativeResult::Void => Bson::Undefined,
            NativeResult::Document(doc) => Bson::Document(bson_document(doc)?),
            NativeResult::Array(items) => Bson::Array(
                items
                    .iter()
                    .map(NativeResult::to_bson)
                    .collect::<Result<_, _>>()?,
            ),
            NativeResult::ObjectId(oid) => Bson::ObjectId(*oid),
            NativeResult::Decimal128(d) => Bson::Decimal128(*d),
            NativeResult::Timestamp { seconds, increment } => Bson::Timestamp(bson::Timestamp {
                time: *seconds,
                increment: *increment,
            }),
            NativeResult::Regex { pattern, flags } => Bson::RegularExpression(Regex {
                pattern: pattern.clone(),
                options: flags.clone(),
            }),
            NativeResult::Symbol(s) => Bson::Symbol(s.clone()),
            NativeResult::Binary { subtype, bytes } => Bson::Binary(Binary {
                subtype: BinarySubtype::from(*subtype),
                bytes: bytes.clone(),
            }),
            NativeResult::Code { body } => Bson::JavaScriptCode(body.clone()),
            NativeResult::CodeWithScope { body, scope } => {
                Bson::JavaScriptCodeWithScope(JavaScriptCodeWithScope {
                    code: body.clone(),
                    scope: bson_document(scope)?,
                })
            }
            NativeResult::DbRef {
                database,
                collection,
                id,
            } => {
                let mut doc = Document::new();
                doc.insert("$ref", collection.clone());
                doc.insert("$id", id.to_bson()?);
                if let Some(db) = database {
                    doc.insert("$db", db.clone());
                }
                Bson::Document(doc)
            }
            NativeResult::MinKey => Bson::MinKey,
            NativeResult::MaxKey => Bson::MaxKey,
            NativeResult::Uuid(u) => Bson::Binary(Binary {
                subtype: BinarySubtype::Uuid,
                bytes: u.as_bytes().to_vec(),
            }),
            NativeResult::Date(dt) => Bson::DateTime(*dt),
            NativeResult::InsertOne(r) => serialize(r)?,
            NativeResult::InsertMany(r) => serialize(r)?,
            NativeResult::Delete(r) => serialize(r)?,
            NativeResult::Update(r) => serialize(r)?,
            NativeResult::BulkWrite(r) => serialize(r)?,
            NativeResult::Function
            | NativeResult::Cursor(_)
            | NativeResult::AggregationCursor(_) => {
                return Err(ShellError::Argument(format!(
                    "{} has no BSON representation",
                    self.type_name()
                )));
            }
        })
    }
}

impl TryFrom<Document> for NativeResult {
    type Error = ShellError;

    fn try_from(doc: Document) -> Result<Self, Self::Error> {
        NativeResult::from_document(doc)
    }
}

/// Convert a shell document into a BSON document.
pub fn bson_document(doc: &ResultDocument) -> Result<Document, ShellError> {
    let mut out = Document::new();
    for (key, value) in doc.iter() {
        out.insert(key, value.to_bson()?);
    }
    Ok(out)
}

fn result_document(doc: Document) -> Result<ResultDocument, ShellError> {
    let mut out = ResultDocument::new();
    for (key, value) in doc {
        out.insert(key, NativeResult::from_bson(value)?);
    }
    Ok(out)
}

fn binary(bin: Binary) -> NativeResult {
    if bin.subtype == BinarySubtype::Uuid {
        if let Ok(uuid) = Uuid::from_slice(&bin.bytes) {
            return NativeResult::Uuid(uuid);
        }
    }
    NativeResult::Binary {
        subtype: u8::from(bin.subtype),
        bytes: bin.bytes,
    }
}

fn serialize<T: serde::Serialize>(value: &T) -> Result<Bson, ShellError> {
    bson::to_bson(value).map_err(|e| ShellError::Argument(e.to_string()))
}
