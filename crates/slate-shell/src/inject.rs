use mlua::{AnyUserData, IntoLua, Lua, MetaMethod, UserData, UserDataMethods, Value};

use crate::cursor::CursorKind;
use crate::date;
use crate::error::ShellError;
use crate::runtime::{LuaCursor, context};
use crate::value::NativeResult;

/// A native value handed to scripts as-is.
///
/// Extended types, dates, UUIDs and write results reach scripts in this
/// wrapper rather than being rebuilt with their script constructors; the
/// extractor unwraps them unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct HostValue(pub NativeResult);

impl UserData for HostValue {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.0.to_string()));
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: AnyUserData| {
            Ok(other
                .borrow::<HostValue>()
                .map(|other| *other == *this)
                .unwrap_or(false))
        });

        methods.add_method("type", |_, this, ()| Ok(this.0.type_name()));
        methods.add_method("getTime", |_, this, ()| match &this.0 {
            NativeResult::Date(d) => Ok(d.timestamp_millis()),
            other => Err(not_a_date(other).into()),
        });
        methods.add_method("toISOString", |_, this, ()| match &this.0 {
            NativeResult::Date(d) => Ok(date::format_date(*d)?),
            other => Err(not_a_date(other).into()),
        });
    }
}

fn not_a_date(value: &NativeResult) -> ShellError {
    ShellError::Argument(format!("{} is not a date", value.type_name()))
}

/// Convert a native value into a script value.
///
/// Documents become ordered proxies and arrays fresh script arrays, both
/// converted element by element. Cursors become scriptable cursor objects.
/// Everything else passes through wrapped in [`HostValue`].
pub fn inject(lua: &Lua, value: NativeResult) -> Result<Value, ShellError> {
    Ok(match value {
        NativeResult::String(s) => Value::String(lua.create_string(&s)?),
        NativeResult::Boolean(b) => Value::Boolean(b),
        NativeResult::Int32(n) => Value::Integer(i64::from(n)),
        NativeResult::Int64(n) => Value::Integer(n),
        NativeResult::Float32(n) => Value::Number(f64::from(n)),
        NativeResult::Float64(n) => Value::Number(n),
        NativeResult::Null => Value::NULL,
        NativeResult::Document(doc) => {
            inject_map(lua, doc.into_iter().map(|(k, v)| (NativeResult::String(k), v)))?
        }
        NativeResult::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.into_iter().enumerate() {
                table.raw_set(i + 1, inject(lua, item)?)?;
            }
            let ctx = context(lua)?;
            Value::Table(ctx.registry.new_array(lua, table)?)
        }
        NativeResult::Cursor(handle) => {
            Value::UserData(lua.create_userdata(LuaCursor::new(handle, CursorKind::Find))?)
        }
        NativeResult::AggregationCursor(handle) => {
            Value::UserData(lua.create_userdata(LuaCursor::new(handle, CursorKind::Aggregate))?)
        }
        other => Value::UserData(lua.create_userdata(HostValue(other))?),
    })
}

/// Build an ordered document proxy from key/value pairs.
///
/// Only string keys are representable; other keys are dropped with a
/// warning. A repeated key keeps its first position and its last value.
pub fn inject_map(
    lua: &Lua,
    entries: impl IntoIterator<Item = (NativeResult, NativeResult)>,
) -> Result<Value, ShellError> {
    let keys = lua.create_table()?;
    let values = lua.create_table()?;
    for (key, value) in entries {
        let NativeResult::String(key) = key else {
            tracing::warn!(key_type = key.type_name(), "dropping non-string map key");
            continue;
        };
        if values.raw_get::<Value>(key.as_str())?.is_nil() {
            keys.raw_push(key.as_str())?;
        }
        values.raw_set(key, inject(lua, value)?)?;
    }
    let ctx = context(lua)?;
    Ok(Value::Table(ctx.registry.new_document(lua, keys, values)?))
}

impl IntoLua for NativeResult {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        inject(lua, self).map_err(mlua::Error::from)
    }
}
