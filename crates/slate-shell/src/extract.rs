use std::cell::RefCell;
use std::ffi::c_void;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bson::Decimal128;
use bson::oid::ObjectId;
use mlua::{AnyUserData, FromLua, Function, Lua, Table, Value};

use crate::error::ShellError;
use crate::inject::{HostValue, inject};
use crate::registry::{ExtendedType, TypeRegistry};
use crate::resolve::{Settled, promise_like, resolve};
use crate::result::{
    BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult,
};
use crate::runtime::{LuaCursor, context};
use crate::value::{NativeResult, ResultDocument};

/// Tables nested deeper than this are rejected instead of recursed into.
const MAX_DEPTH: usize = 128;

/// Result categories that cannot be recognized from the value alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeHint {
    Cursor,
    AggregationCursor,
    InsertOne,
    InsertMany,
    Delete,
    Update,
    BulkWrite,
}

/// Convert one script value into a [`NativeResult`].
///
/// Promises are awaited first and their settled value is converted instead.
/// Either the whole value converts or the call fails with
/// [`ShellError::TypeRecognition`]; nothing is returned half-built.
pub fn extract(lua: &Lua, value: Value, hint: Option<TypeHint>) -> Result<NativeResult, ShellError> {
    let ctx = context(lua)?;
    let extractor = Extractor {
        lua,
        registry: &ctx.registry,
        timeout: ctx.config.async_timeout,
        ancestors: RefCell::new(Vec::new()),
    };
    extractor.extract(value, hint, 0)
}

impl FromLua for NativeResult {
    fn from_lua(value: Value, lua: &Lua) -> mlua::Result<Self> {
        extract(lua, value, None).map_err(mlua::Error::from)
    }
}

/// Short description of a script value for error messages.
pub(crate) fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => format!("string {:?}", s.to_string_lossy()),
        Value::Integer(n) => format!("integer {n}"),
        Value::Number(n) => format!("number {n}"),
        Value::Boolean(b) => format!("boolean {b}"),
        Value::Nil => "nil".into(),
        other => format!("{}: {:p}", other.type_name(), other.to_pointer()),
    }
}

struct Extractor<'a> {
    lua: &'a Lua,
    registry: &'a TypeRegistry,
    timeout: Duration,
    /// Tables currently being converted, outermost first.
    ancestors: RefCell<Vec<*const c_void>>,
}

impl Extractor<'_> {
    fn extract(
        &self,
        value: Value,
        hint: Option<TypeHint>,
        depth: usize,
    ) -> Result<NativeResult, ShellError> {
        if depth > MAX_DEPTH {
            return Err(ShellError::unrecognized(
                describe(&value),
                "value is nested too deeply",
            ));
        }

        if let Some(promise) = promise_like(self.lua, self.registry, &value)? {
            tracing::trace!(handle = %describe(&value), "awaiting promise before extraction");
            return match resolve(self.lua, promise, self.timeout)? {
                Settled::Value(settled) => self.extract(settled, hint, depth + 1),
                // Host outcomes are already native; a hint still has to decode them.
                Settled::Native(native) => match hint {
                    Some(_) => self.extract(inject(self.lua, native)?, hint, depth + 1),
                    None => Ok(native),
                },
            };
        }

        match hint {
            Some(hint) => self.hinted(value, hint, depth),
            None => self.classify(value, depth),
        }
    }

    fn classify(&self, value: Value, depth: usize) -> Result<NativeResult, ShellError> {
        match value {
            Value::String(s) => match s.to_str() {
                Ok(s) => Ok(NativeResult::String(s.to_string())),
                Err(_) => Err(ShellError::unrecognized(
                    describe(&Value::String(s.clone())),
                    "string is not valid UTF-8",
                )),
            },
            Value::Boolean(b) => Ok(NativeResult::Boolean(b)),
            Value::Integer(n) => Ok(classify_integer(n)),
            Value::Number(n) => Ok(classify_number(n)),
            Value::Nil => Ok(NativeResult::Null),
            Value::LightUserData(ptr) if ptr.0.is_null() => Ok(NativeResult::Null),
            Value::UserData(ud) => self.userdata(ud),
            Value::Table(table) => self.table(table, depth),
            Value::Function(_) => Ok(NativeResult::Function),
            other => Err(ShellError::unrecognized(
                describe(&other),
                "no result variant matches",
            )),
        }
    }

    fn userdata(&self, ud: AnyUserData) -> Result<NativeResult, ShellError> {
        if let Ok(host) = ud.borrow::<HostValue>() {
            return Ok(host.0.clone());
        }
        if let Ok(cursor) = ud.borrow::<LuaCursor>() {
            return Ok(cursor.to_native());
        }
        Err(ShellError::unrecognized(
            describe(&Value::UserData(ud)),
            "userdata is not a host value",
        ))
    }

    fn table(&self, table: Table, depth: usize) -> Result<NativeResult, ShellError> {
        let ptr = table.to_pointer();
        if self.ancestors.borrow().contains(&ptr) {
            return Err(ShellError::unrecognized(
                describe(&Value::Table(table)),
                "value contains a reference to itself",
            ));
        }
        self.ancestors.borrow_mut().push(ptr);
        let result = self.table_members(table, depth);
        self.ancestors.borrow_mut().pop();
        result
    }

    fn table_members(&self, table: Table, depth: usize) -> Result<NativeResult, ShellError> {
        if let Some(ty) = self.registry.match_extended(self.lua, &table)? {
            tracing::trace!(class = ty.class_name(), "extended type instance");
            return self.extended(ty, &table, depth);
        }
        if self.registry.is_document(self.lua, &table)? {
            return self.ordered_document(&table, depth);
        }
        if self.registry.is_array(self.lua, &table)? || is_sequence(&table)? {
            return self.sequence(&table, depth);
        }
        self.generic_object(&table, depth)
    }

    fn sequence(&self, table: &Table, depth: usize) -> Result<NativeResult, ShellError> {
        let items = (1..=table.raw_len())
            .map(|i| self.extract(table.raw_get::<Value>(i)?, None, depth + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NativeResult::Array(items))
    }

    fn ordered_document(&self, table: &Table, depth: usize) -> Result<NativeResult, ShellError> {
        let (keys, values) = self.registry.document_entries(self.lua, table)?;
        let mut doc = ResultDocument::new();
        for key in keys.sequence_values::<Value>() {
            let key = key?;
            let Value::String(name) = &key else {
                tracing::trace!(key = %describe(&key), "skipping non-string document key");
                continue;
            };
            let name = name.to_str()?.to_string();
            let value = values.raw_get::<Value>(key)?;
            doc.insert(name, self.extract(value, None, depth + 1)?);
        }
        Ok(NativeResult::Document(doc))
    }

    /// Own string-keyed members, sorted by key. Other keys are dropped.
    fn generic_object(&self, table: &Table, depth: usize) -> Result<NativeResult, ShellError> {
        let mut members = Vec::new();
        for pair in table.pairs::<Value, Value>() {
            let (key, value) = pair?;
            match &key {
                Value::String(name) => match name.to_str() {
                    Ok(name) => members.push((name.to_string(), value)),
                    Err(_) => tracing::trace!("skipping non UTF-8 member name"),
                },
                other => tracing::trace!(key = %describe(other), "skipping non-string member"),
            }
        }
        members.sort_by(|a, b| a.0.cmp(&b.0));

        let mut doc = ResultDocument::new();
        for (name, value) in members {
            doc.insert(name, self.extract(value, None, depth + 1)?);
        }
        Ok(NativeResult::Document(doc))
    }

    // ── Extended types ──────────────────────────────────────

    fn extended(
        &self,
        ty: ExtendedType,
        table: &Table,
        depth: usize,
    ) -> Result<NativeResult, ShellError> {
        let fail = |reason: String| {
            ShellError::unrecognized(describe(&Value::Table(table.clone())), reason)
        };

        match ty {
            ExtendedType::Regex => {
                let text = canonical(table)?;
                let (pattern, flags) = text
                    .strip_prefix('/')
                    .and_then(|rest| rest.rfind('/').map(|i| (&rest[..i], &rest[i + 1..])))
                    .ok_or_else(|| fail(format!("malformed regular expression {text}")))?;
                Ok(NativeResult::Regex {
                    pattern: pattern.to_string(),
                    flags: flags.to_string(),
                })
            }
            ExtendedType::ObjectId => {
                let hex = canonical(table)?;
                ObjectId::parse_str(&hex)
                    .map(NativeResult::ObjectId)
                    .map_err(|_| fail(format!("invalid object id {hex}")))
            }
            ExtendedType::Decimal128 => {
                let digits = canonical(table)?;
                digits
                    .parse::<Decimal128>()
                    .map(NativeResult::Decimal128)
                    .map_err(|_| fail(format!("invalid decimal {digits}")))
            }
            ExtendedType::Long => {
                let digits = canonical(table)?;
                digits
                    .trim_start_matches('+')
                    .parse::<i64>()
                    .map(NativeResult::Long)
                    .map_err(|_| fail(format!("{digits} does not fit in 64 bits")))
            }
            ExtendedType::Timestamp => {
                let text = canonical(table)?;
                let parsed = text
                    .split_once(':')
                    .and_then(|(t, i)| Some((t.parse::<u32>().ok()?, i.parse::<u32>().ok()?)));
                let (seconds, increment) =
                    parsed.ok_or_else(|| fail(format!("invalid timestamp {text}")))?;
                Ok(NativeResult::Timestamp { seconds, increment })
            }
            ExtendedType::Symbol => Ok(NativeResult::Symbol(canonical(table)?)),
            ExtendedType::Binary => {
                let text = canonical(table)?;
                let (subtype, payload) = text
                    .split_once(':')
                    .ok_or_else(|| fail(format!("invalid binary encoding {text}")))?;
                let subtype = subtype
                    .parse::<u8>()
                    .map_err(|_| fail(format!("invalid binary subtype {subtype}")))?;
                let bytes = STANDARD
                    .decode(payload)
                    .map_err(|e| fail(format!("invalid base64 payload: {e}")))?;
                Ok(NativeResult::Binary { subtype, bytes })
            }
            ExtendedType::Code => {
                let body = canonical(table)?;
                match table.get::<Value>("scope")? {
                    Value::Nil => Ok(NativeResult::Code { body }),
                    scope => match self.extract(scope, None, depth + 1)? {
                        NativeResult::Document(scope) => {
                            Ok(NativeResult::CodeWithScope { body, scope })
                        }
                        other => Err(fail(format!(
                            "code scope must be a document, got {}",
                            other.type_name()
                        ))),
                    },
                }
            }
            ExtendedType::DbRef => {
                let collection: String = table.get("collection")?;
                let database: Option<String> = table.get("db")?;
                let id = self.extract(table.get::<Value>("id")?, None, depth + 1)?;
                Ok(NativeResult::DbRef {
                    database,
                    collection,
                    id: Box::new(id),
                })
            }
            ExtendedType::MinKey => Ok(NativeResult::MinKey),
            ExtendedType::MaxKey => Ok(NativeResult::MaxKey),
            ExtendedType::Int32 => {
                let text = canonical(table)?;
                text.parse::<i32>()
                    .map(NativeResult::Int32)
                    .map_err(|_| fail(format!("{text} does not fit in 32 bits")))
            }
            ExtendedType::Double => {
                let text = canonical(table)?;
                text.parse::<f64>()
                    .map(NativeResult::Float64)
                    .map_err(|_| fail(format!("invalid double {text}")))
            }
        }
    }

    // ── Hinted results ──────────────────────────────────────

    fn hinted(&self, value: Value, hint: TypeHint, depth: usize) -> Result<NativeResult, ShellError> {
        tracing::trace!(?hint, handle = %describe(&value), "decoding hinted result");
        match hint {
            TypeHint::Cursor | TypeHint::AggregationCursor => {
                let handle = match &value {
                    Value::UserData(ud) => match (ud.borrow::<LuaCursor>(), ud.borrow::<HostValue>()) {
                        (Ok(cursor), _) => Some(cursor.handle().clone()),
                        (_, Ok(host)) => match &host.0 {
                            NativeResult::Cursor(h) | NativeResult::AggregationCursor(h) => {
                                Some(h.clone())
                            }
                            _ => None,
                        },
                        _ => None,
                    },
                    _ => None,
                };
                let handle = handle
                    .ok_or_else(|| ShellError::unrecognized(describe(&value), "expected a cursor"))?;
                Ok(match hint {
                    TypeHint::Cursor => NativeResult::Cursor(handle),
                    _ => NativeResult::AggregationCursor(handle),
                })
            }
            _ => {
                let Value::Table(table) = &value else {
                    return Err(ShellError::unrecognized(
                        describe(&value),
                        "write result must be a table",
                    ));
                };
                let fields = WriteFields::new(self, table, depth)?;
                fields.decode(hint)
            }
        }
    }
}

/// Field access for write results. When `acknowledged` is not `true` the
/// counts are provisional: missing fields default instead of failing.
struct WriteFields<'a, 'b> {
    extractor: &'a Extractor<'b>,
    table: &'a Table,
    acknowledged: bool,
    depth: usize,
}

impl<'a, 'b> WriteFields<'a, 'b> {
    fn new(extractor: &'a Extractor<'b>, table: &'a Table, depth: usize) -> Result<Self, ShellError> {
        let acknowledged = matches!(table.get::<Value>("acknowledged")?, Value::Boolean(true));
        Ok(Self {
            extractor,
            table,
            acknowledged,
            depth,
        })
    }

    fn decode(&self, hint: TypeHint) -> Result<NativeResult, ShellError> {
        let acknowledged = self.acknowledged;
        Ok(match hint {
            TypeHint::InsertOne => NativeResult::InsertOne(InsertOneResult {
                acknowledged,
                inserted_id: self.id("insertedId")?,
            }),
            TypeHint::InsertMany => NativeResult::InsertMany(InsertManyResult {
                acknowledged,
                inserted_ids: self.ids("insertedIds")?,
            }),
            TypeHint::Delete => NativeResult::Delete(DeleteResult {
                acknowledged,
                deleted_count: self.count("deletedCount")?,
            }),
            TypeHint::Update => NativeResult::Update(UpdateResult {
                acknowledged,
                matched_count: self.count("matchedCount")?,
                modified_count: self.count("modifiedCount")?,
            }),
            TypeHint::BulkWrite => NativeResult::BulkWrite(BulkWriteResult {
                acknowledged,
                inserted_count: self.count("insertedCount")?,
                matched_count: self.count("matchedCount")?,
                modified_count: self.count("modifiedCount")?,
                deleted_count: self.count("deletedCount")?,
                upserted_count: self.count("upsertedCount")?,
                upserted_ids: self.ids("upsertedIds")?,
            }),
            TypeHint::Cursor | TypeHint::AggregationCursor => {
                return Err(ShellError::unrecognized(self.handle(), "not a write result"));
            }
        })
    }

    fn handle(&self) -> String {
        describe(&Value::Table(self.table.clone()))
    }

    fn missing(&self, name: &str) -> ShellError {
        ShellError::unrecognized(self.handle(), format!("acknowledged result has no {name}"))
    }

    fn field(&self, name: &str) -> Result<Option<NativeResult>, ShellError> {
        match self.table.get::<Value>(name)? {
            Value::Nil => Ok(None),
            value => self.extractor.extract(value, None, self.depth + 1).map(Some),
        }
    }

    fn count(&self, name: &str) -> Result<i64, ShellError> {
        let Some(value) = self.field(name)? else {
            return if self.acknowledged { Err(self.missing(name)) } else { Ok(0) };
        };
        match value {
            NativeResult::Int32(n) => Ok(i64::from(n)),
            NativeResult::Int64(n) | NativeResult::Long(n) => Ok(n),
            other => Err(ShellError::unrecognized(
                self.handle(),
                format!("{name} must be an integer, got {}", other.type_name()),
            )),
        }
    }

    fn id(&self, name: &str) -> Result<String, ShellError> {
        match self.field(name)? {
            Some(value) => self.id_string(name, &value),
            None if self.acknowledged => Err(self.missing(name)),
            None => Ok(String::new()),
        }
    }

    /// Accepts a sequence or an index-keyed document of ids.
    fn ids(&self, name: &str) -> Result<Vec<String>, ShellError> {
        match self.field(name)? {
            Some(NativeResult::Array(items)) => {
                items.iter().map(|v| self.id_string(name, v)).collect()
            }
            Some(NativeResult::Document(doc)) => {
                doc.iter().map(|(_, v)| self.id_string(name, v)).collect()
            }
            Some(other) => Err(ShellError::unrecognized(
                self.handle(),
                format!("{name} must be an array, got {}", other.type_name()),
            )),
            None if self.acknowledged => Err(self.missing(name)),
            None => Ok(Vec::new()),
        }
    }

    fn id_string(&self, name: &str, value: &NativeResult) -> Result<String, ShellError> {
        value
            .to_id_string()
            .map_err(|e| ShellError::unrecognized(self.handle(), format!("{name}: {e}")))
    }
}

// ── Helpers ─────────────────────────────────────────────────

fn canonical(table: &Table) -> Result<String, ShellError> {
    let method: Function = table.get("canonical")?;
    Ok(method.call::<String>(table.clone())?)
}

/// A table whose keys are exactly `1..=n` for some `n >= 1`.
fn is_sequence(table: &Table) -> Result<bool, ShellError> {
    let len = table.raw_len();
    if len == 0 {
        return Ok(false);
    }
    let mut seen = 0;
    for pair in table.pairs::<Value, Value>() {
        let (key, _) = pair?;
        match key {
            Value::Integer(i) if i >= 1 && (i as usize) <= len => seen += 1,
            _ => return Ok(false),
        }
    }
    Ok(seen == len)
}

pub(crate) fn classify_integer(n: i64) -> NativeResult {
    match i32::try_from(n) {
        Ok(n) => NativeResult::Int32(n),
        Err(_) => NativeResult::Int64(n),
    }
}

/// Integral values are classified as integers first. Everything else is `Float32`
/// when it survives a round-trip through `f32`, else `Float64`.
pub(crate) fn classify_number(n: f64) -> NativeResult {
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

    let negative_zero = n == 0.0 && n.is_sign_negative();
    if n.is_finite() && n.fract() == 0.0 && !negative_zero && (-TWO_POW_63..TWO_POW_63).contains(&n) {
        return classify_integer(n as i64);
    }
    if f64::from(n as f32) == n {
        NativeResult::Float32(n as f32)
    } else {
        NativeResult::Float64(n)
    }
}
