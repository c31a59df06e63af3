use bson::{Bson, Document};
use bson::oid::ObjectId;
use mlua::{
    AnyUserData, AppDataRef, FromLuaMulti, Function, Lua, MaybeSend, MetaMethod, MultiValue,
    Table, UserData, UserDataMethods, Value, Variadic,
};
use uuid::Uuid;

use crate::config::ShellConfig;
use crate::convert::bson_document;
use crate::cursor::{Cursor, CursorKind, ReadPreferenceMode};
use crate::date::{self, DateArg, DateMode, DateOutput};
use crate::error::ShellError;
use crate::extract::{TypeHint, extract};
use crate::inject::{HostValue, inject};
use crate::registry::TypeRegistry;
use crate::resolve::{HostPromise, PromiseSettler, Settled, promise_like, resolve};
use crate::value::{CursorHandle, NativeResult};

/// Per-runtime state shared by the bridge, stored as Lua app data.
pub(crate) struct ShellContext {
    pub(crate) registry: TypeRegistry,
    pub(crate) config: ShellConfig,
}

pub(crate) fn context(lua: &Lua) -> Result<AppDataRef<'_, ShellContext>, ShellError> {
    lua.app_data_ref::<ShellContext>()
        .ok_or_else(|| ShellError::IllegalState("shell runtime is not initialized".into()))
}

// ── ShellRuntime ────────────────────────────────────────────

/// An embedded Lua state with the shell globals installed.
///
/// ```ignore
/// let shell = ShellRuntime::new(ShellConfig::default())?;
/// let value = shell.eval("return NumberLong('9007199254740993')")?;
/// assert_eq!(value, NativeResult::Long(9007199254740993));
/// ```
pub struct ShellRuntime {
    lua: Lua,
}

impl ShellRuntime {
    pub fn new(config: ShellConfig) -> Result<Self, ShellError> {
        let lua = Lua::new();
        if let Some(limit) = config.memory_limit {
            lua.set_memory_limit(limit)?;
        }
        let host = host_functions(&lua)?;
        let registry = TypeRegistry::load(&lua, host)?;
        tracing::debug!(
            async_timeout = ?config.async_timeout,
            memory_limit = ?config.memory_limit,
            "shell runtime ready"
        );
        lua.set_app_data(ShellContext { registry, config });
        Ok(Self { lua })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Run a script and extract the first value it returns. A script that
    /// returns nothing yields [`NativeResult::Void`].
    pub fn eval(&self, script: &str) -> Result<NativeResult, ShellError> {
        match self.run(script)? {
            Some(value) => extract(&self.lua, value, None),
            None => Ok(NativeResult::Void),
        }
    }

    /// Like [`eval`](Self::eval), decoding the result as the hinted kind.
    pub fn eval_as(&self, script: &str, hint: TypeHint) -> Result<NativeResult, ShellError> {
        let value = self.run(script)?.unwrap_or(Value::Nil);
        extract(&self.lua, value, Some(hint))
    }

    fn run(&self, script: &str) -> Result<Option<Value>, ShellError> {
        let name = format!("={}", context(&self.lua)?.config.chunk_name);
        let values: MultiValue = self.lua.load(script).set_name(name).eval()?;
        Ok(values.into_iter().next())
    }

    pub fn extract(&self, value: Value, hint: Option<TypeHint>) -> Result<NativeResult, ShellError> {
        extract(&self.lua, value, hint)
    }

    pub fn inject(&self, value: NativeResult) -> Result<Value, ShellError> {
        inject(&self.lua, value)
    }

    pub fn set_global(&self, name: &str, value: NativeResult) -> Result<(), ShellError> {
        let value = inject(&self.lua, value)?;
        self.lua.globals().set(name, value)?;
        Ok(())
    }

    pub fn get_global(&self, name: &str) -> Result<NativeResult, ShellError> {
        let value: Value = self.lua.globals().get(name)?;
        extract(&self.lua, value, None)
    }

    /// Hand a cursor to scripts. The returned handle reaches the same engine.
    pub fn wrap_cursor(&self, cursor: Cursor) -> Result<(CursorHandle, Value), ShellError> {
        let kind = cursor.kind();
        let handle = CursorHandle::new(cursor);
        let ud = self.lua.create_userdata(LuaCursor::new(handle.clone(), kind))?;
        Ok((handle, Value::UserData(ud)))
    }

    /// A pending promise for scripts plus the settler that completes it.
    pub fn promise(&self) -> Result<(Value, PromiseSettler), ShellError> {
        let (promise, settler) = HostPromise::pending();
        let ud = self.lua.create_userdata(promise)?;
        Ok((Value::UserData(ud), settler))
    }

    /// Expose a host operation to scripts as a global function. Arguments
    /// are extracted before the call and the result injected after it.
    pub fn register_function<F>(&self, name: &str, f: F) -> Result<(), ShellError>
    where
        F: Fn(&Lua, Vec<NativeResult>) -> Result<NativeResult, ShellError> + MaybeSend + 'static,
    {
        let function = self
            .lua
            .create_function(move |lua, args: Variadic<NativeResult>| {
                Ok(f(lua, args.into_iter().collect())?)
            })?;
        self.lua.globals().set(name, function)?;
        Ok(())
    }
}

// ── Host functions ──────────────────────────────────────────

/// Functions the prelude builds its globals from.
fn host_functions(lua: &Lua) -> Result<Table, ShellError> {
    let host = lua.create_table()?;

    host.set(
        "new_object_id",
        lua.create_function(|_, ()| Ok(ObjectId::new().to_hex()))?,
    )?;
    host.set("null", Value::NULL)?;
    host.set("undefined", HostValue(NativeResult::Void))?;

    host.set(
        "uuid",
        lua.create_function(|_, hex: Option<String>| {
            let uuid = match hex {
                Some(hex) => Uuid::parse_str(&hex)
                    .map_err(|e| ShellError::Argument(format!("invalid UUID {hex:?}: {e}")))?,
                None => Uuid::new_v4(),
            };
            Ok(HostValue(NativeResult::Uuid(uuid)))
        })?,
    )?;

    host.set(
        "date_new",
        lua.create_function(|_, args: Variadic<Value>| {
            match date::coerce(DateMode::Construct, &date_args(args))? {
                DateOutput::Date(d) => Ok(HostValue(NativeResult::Date(d))),
                DateOutput::Text(_) => Err(ShellError::IllegalState(
                    "date constructor produced text".into(),
                )
                .into()),
            }
        })?,
    )?;
    host.set(
        "date_text",
        lua.create_function(|_, args: Variadic<Value>| {
            match date::coerce(DateMode::Call, &date_args(args))? {
                DateOutput::Text(text) => Ok(text),
                DateOutput::Date(d) => Ok(date::format_date(d)?),
            }
        })?,
    )?;
    host.set(
        "date_now",
        lua.create_function(|_, ()| Ok(bson::DateTime::now().timestamp_millis()))?,
    )?;

    host.set(
        "await",
        lua.create_function(|lua, value: Value| {
            let (promise, timeout) = {
                let ctx = context(lua)?;
                (
                    promise_like(lua, &ctx.registry, &value)?,
                    ctx.config.async_timeout,
                )
            };
            match promise {
                None => Ok(value),
                Some(promise) => match resolve(lua, promise, timeout)? {
                    Settled::Value(settled) => Ok(settled),
                    Settled::Native(native) => Ok(inject(lua, native)?),
                },
            }
        })?,
    )?;

    Ok(host)
}

fn date_args(args: Variadic<Value>) -> Vec<DateArg> {
    args.into_iter()
        .map(|arg| match arg {
            Value::String(s) => DateArg::Text(s.to_string_lossy()),
            Value::Integer(n) => DateArg::Integer(n),
            Value::Number(n) => DateArg::Number(n),
            Value::UserData(ud) => match ud.borrow::<HostValue>() {
                Ok(host) => match &host.0 {
                    NativeResult::Date(d) => DateArg::Instant(*d),
                    other => DateArg::Other(other.type_name().into()),
                },
                Err(_) => DateArg::Other("userdata".into()),
            },
            other => DateArg::Other(other.type_name().into()),
        })
        .collect()
}

// ── Script-side cursor ──────────────────────────────────────

/// The cursor object scripts see. Method names follow the shell.
pub struct LuaCursor {
    handle: CursorHandle,
    kind: CursorKind,
}

impl LuaCursor {
    pub fn new(handle: CursorHandle, kind: CursorKind) -> Self {
        Self { handle, kind }
    }

    pub fn handle(&self) -> &CursorHandle {
        &self.handle
    }

    pub fn to_native(&self) -> NativeResult {
        match self.kind {
            CursorKind::Find => NativeResult::Cursor(self.handle.clone()),
            CursorKind::Aggregate => NativeResult::AggregationCursor(self.handle.clone()),
        }
    }
}

/// Register a chainable modifier: it updates the cursor and returns the
/// cursor object itself.
fn add_modifier<M, A, F>(methods: &mut M, name: &'static str, f: F)
where
    M: UserDataMethods<LuaCursor>,
    A: FromLuaMulti,
    F: Fn(&Lua, &mut Cursor, A) -> Result<(), ShellError> + MaybeSend + 'static,
{
    methods.add_function(name, move |lua, (ud, args): (AnyUserData, A)| {
        let handle = ud.borrow::<LuaCursor>()?.handle.clone();
        handle.with(|cursor| f(lua, cursor, args))?;
        Ok(ud)
    });
}

fn document_arg(lua: &Lua, value: Value, what: &str) -> Result<Document, ShellError> {
    match extract(lua, value, None)? {
        NativeResult::Document(doc) => bson_document(&doc),
        other => Err(ShellError::Argument(format!(
            "{what} must be a document, got {}",
            other.type_name()
        ))),
    }
}

impl UserData for LuaCursor {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        add_modifier(methods, "sort", |lua, c, spec: Value| {
            c.sort(document_arg(lua, spec, "sort")?)?;
            Ok(())
        });
        add_modifier(methods, "limit", |_, c, n: i64| {
            c.limit(n)?;
            Ok(())
        });
        add_modifier(methods, "skip", |_, c, n: i64| {
            c.skip(n)?;
            Ok(())
        });
        add_modifier(methods, "batchSize", |_, c, n: i64| {
            c.batch_size(n)?;
            Ok(())
        });
        add_modifier(methods, "hint", |lua, c, index: Value| {
            let index = match extract(lua, index, None)? {
                NativeResult::String(name) => Bson::String(name),
                NativeResult::Document(doc) => Bson::Document(bson_document(&doc)?),
                other => other.to_bson()?,
            };
            c.hint(index)?;
            Ok(())
        });
        add_modifier(methods, "collation", |lua, c, spec: Value| {
            c.collation(document_arg(lua, spec, "collation")?)?;
            Ok(())
        });
        add_modifier(methods, "comment", |_, c, comment: String| {
            c.comment(comment)?;
            Ok(())
        });
        add_modifier(methods, "max", |lua, c, bound: Value| {
            c.max(document_arg(lua, bound, "max")?)?;
            Ok(())
        });
        add_modifier(methods, "min", |lua, c, bound: Value| {
            c.min(document_arg(lua, bound, "min")?)?;
            Ok(())
        });
        add_modifier(methods, "maxTimeMS", |_, c, ms: i64| {
            c.max_time_ms(ms)?;
            Ok(())
        });
        add_modifier(methods, "noCursorTimeout", |_, c, ()| {
            c.no_cursor_timeout()?;
            Ok(())
        });
        add_modifier(methods, "tailable", |_, c, opts: Option<Table>| {
            let await_data = match opts {
                Some(opts) => opts.get::<Option<bool>>("awaitData")?.unwrap_or(false),
                None => false,
            };
            c.tailable(await_data)?;
            Ok(())
        });
        add_modifier(methods, "oplogReplay", |_, c, ()| {
            c.oplog_replay()?;
            Ok(())
        });
        add_modifier(methods, "returnKey", |_, c, enabled: Option<bool>| {
            c.return_key(enabled.unwrap_or(true))?;
            Ok(())
        });
        add_modifier(methods, "readConcern", |_, c, level: String| {
            c.read_concern(level)?;
            Ok(())
        });
        add_modifier(
            methods,
            "readPreference",
            |lua, c, (mode, tag_sets): (String, Option<Value>)| {
                let mode: ReadPreferenceMode = mode.parse()?;
                let tag_sets = match tag_sets.map(|v| extract(lua, v, None)).transpose()? {
                    None | Some(NativeResult::Null) => Vec::new(),
                    Some(NativeResult::Array(sets)) => sets
                        .into_iter()
                        .map(|set| match set {
                            NativeResult::Document(doc) => bson_document(&doc),
                            other => Err(ShellError::Argument(format!(
                                "tag set must be a document, got {}",
                                other.type_name()
                            ))),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    // An empty table extracts as an empty document.
                    Some(NativeResult::Document(doc)) if doc.is_empty() => Vec::new(),
                    Some(other) => {
                        return Err(ShellError::Argument(format!(
                            "tag sets must be an array, got {}",
                            other.type_name()
                        )));
                    }
                };
                c.read_preference(mode, &tag_sets)?;
                Ok(())
            },
        );
        add_modifier(methods, "projection", |lua, c, spec: Value| {
            c.projection(document_arg(lua, spec, "projection")?)?;
            Ok(())
        });
        add_modifier(methods, "allowPartialResults", |_, c, ()| {
            c.allow_partial_results()?;
            Ok(())
        });
        add_modifier(methods, "map", |_, c, f: Function| {
            c.map(Box::new(move |value: NativeResult| {
                f.call::<NativeResult>(value).map_err(ShellError::from)
            }))?;
            Ok(())
        });
        add_modifier(methods, "addOption", |_, c, flag: i64| {
            c.add_option(flag)?;
            Ok(())
        });

        // ── Terminal calls ──────────────────────────────────

        methods.add_method("hasNext", |_, this, ()| Ok(this.handle.with(|c| c.has_next())?));
        methods.add_method("next", |_, this, ()| Ok(this.handle.with(|c| c.next())?));
        methods.add_method("forEach", |_, this, f: Function| {
            this.handle.with(|c| {
                c.for_each(|value| f.call::<()>(value).map_err(ShellError::from))
            })?;
            Ok(())
        });
        methods.add_method("toArray", |_, this, ()| {
            Ok(NativeResult::Array(this.handle.with(|c| c.to_array())?))
        });
        methods.add_method("count", |_, this, ()| Ok(this.handle.with(|c| c.count())?));
        methods.add_method("itcount", |_, this, ()| Ok(this.handle.with(|c| c.itcount())?));
        methods.add_method("explain", |_, this, verbosity: Option<String>| {
            let plan = this.handle.with(|c| c.explain(verbosity.as_deref()))?;
            Ok(NativeResult::from_document(plan)?)
        });

        // ── Lifecycle ───────────────────────────────────────

        methods.add_method("close", |_, this, ()| {
            this.handle.close();
            Ok(())
        });
        methods.add_method("isClosed", |_, this, ()| Ok(this.handle.is_closed()));
        methods.add_method("isExhausted", |_, this, ()| {
            Ok(this.handle.with(|c| c.is_exhausted())?)
        });
        methods.add_method("clone", |_, this, ()| {
            this.handle.with(|c| c.try_clone().map(|_| ()))?;
            Ok(())
        });
        methods.add_method("size", |_, this, ()| Ok(this.handle.with(|c| c.size())?));

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(match this.kind {
                CursorKind::Find => "Cursor",
                CursorKind::Aggregate => "AggregationCursor",
            })
        });
    }
}
