use mlua::{Function, Lua, RegistryKey, Table, Value};

use crate::error::ShellError;

const PRELUDE: &str = include_str!("prelude.lua");

/// How far `__parent` links are followed when testing class membership.
const MAX_CLASS_DEPTH: usize = 16;

/// Extended document types with a script-side constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtendedType {
    Regex,
    ObjectId,
    Decimal128,
    Long,
    Timestamp,
    Symbol,
    Binary,
    Code,
    DbRef,
    MinKey,
    MaxKey,
    Int32,
    Double,
}

impl ExtendedType {
    /// Membership is tested in this order; the first match wins.
    pub const ALL: [ExtendedType; 13] = [
        ExtendedType::Regex,
        ExtendedType::ObjectId,
        ExtendedType::Decimal128,
        ExtendedType::Long,
        ExtendedType::Timestamp,
        ExtendedType::Symbol,
        ExtendedType::Binary,
        ExtendedType::Code,
        ExtendedType::DbRef,
        ExtendedType::MinKey,
        ExtendedType::MaxKey,
        ExtendedType::Int32,
        ExtendedType::Double,
    ];

    /// Name of the prelude class implementing this type.
    pub fn class_name(&self) -> &'static str {
        match self {
            ExtendedType::Regex => "RegExp",
            ExtendedType::ObjectId => "ObjectId",
            ExtendedType::Decimal128 => "Decimal128",
            ExtendedType::Long => "Long",
            ExtendedType::Timestamp => "Timestamp",
            ExtendedType::Symbol => "Symbol",
            ExtendedType::Binary => "Binary",
            ExtendedType::Code => "Code",
            ExtendedType::DbRef => "DBRef",
            ExtendedType::MinKey => "MinKey",
            ExtendedType::MaxKey => "MaxKey",
            ExtendedType::Int32 => "Int32",
            ExtendedType::Double => "Double",
        }
    }
}

/// Script classes the bridge recognizes, captured once when the prelude
/// loads. Read-only afterwards.
pub struct TypeRegistry {
    extended: Vec<(ExtendedType, RegistryKey)>,
    document: RegistryKey,
    array: RegistryKey,
    promise: RegistryKey,
}

impl TypeRegistry {
    /// Run the prelude with the host function table and keep references to
    /// the classes it returns.
    pub fn load(lua: &Lua, host: Table) -> Result<Self, ShellError> {
        let classes: Table = lua.load(PRELUDE).set_name("=prelude").call(host)?;

        let class = |name: &str| -> Result<RegistryKey, ShellError> {
            let table: Option<Table> = classes.get(name)?;
            let table = table.ok_or_else(|| {
                ShellError::Script(format!("prelude does not define class {name}"))
            })?;
            Ok(lua.create_registry_value(table)?)
        };

        let extended = ExtendedType::ALL
            .iter()
            .map(|ty| Ok((*ty, class(ty.class_name())?)))
            .collect::<Result<Vec<_>, ShellError>>()?;

        Ok(Self {
            extended,
            document: class("Document")?,
            array: class("Array")?,
            promise: class("Promise")?,
        })
    }

    fn class(&self, lua: &Lua, key: &RegistryKey) -> mlua::Result<Table> {
        lua.registry_value(key)
    }

    /// True when `table`'s metatable is `class`, directly or through a chain
    /// of `__parent` links.
    fn is_instance(&self, lua: &Lua, table: &Table, key: &RegistryKey) -> mlua::Result<bool> {
        let Some(mut meta) = table.metatable() else {
            return Ok(false);
        };
        let class = self.class(lua, key)?;
        for _ in 0..MAX_CLASS_DEPTH {
            if meta == class {
                return Ok(true);
            }
            match meta.raw_get::<Value>("__parent")? {
                Value::Table(parent) => meta = parent,
                _ => return Ok(false),
            }
        }
        Ok(false)
    }

    pub fn match_extended(&self, lua: &Lua, table: &Table) -> mlua::Result<Option<ExtendedType>> {
        if table.metatable().is_none() {
            return Ok(None);
        }
        for (ty, key) in &self.extended {
            if self.is_instance(lua, table, key)? {
                return Ok(Some(*ty));
            }
        }
        Ok(None)
    }

    pub fn is_document(&self, lua: &Lua, table: &Table) -> mlua::Result<bool> {
        self.is_instance(lua, table, &self.document)
    }

    pub fn is_array(&self, lua: &Lua, table: &Table) -> mlua::Result<bool> {
        self.is_instance(lua, table, &self.array)
    }

    pub fn is_promise(&self, lua: &Lua, table: &Table) -> mlua::Result<bool> {
        self.is_instance(lua, table, &self.promise)
    }

    // ── Constructors ────────────────────────────────────────

    /// Build an ordered document proxy from parallel key and value lists.
    pub fn new_document(&self, lua: &Lua, keys: Table, values: Table) -> mlua::Result<Table> {
        let new: Function = self.class(lua, &self.document)?.get("new")?;
        new.call((keys, values))
    }

    pub fn new_array(&self, lua: &Lua, items: Table) -> mlua::Result<Table> {
        let new: Function = self.class(lua, &self.array)?.get("new")?;
        new.call(items)
    }

    /// Keys in insertion order and the key to value table of a document proxy.
    pub fn document_entries(&self, lua: &Lua, doc: &Table) -> mlua::Result<(Table, Table)> {
        let entries: Function = self.class(lua, &self.document)?.get("entries")?;
        entries.call(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded() -> (Lua, TypeRegistry) {
        let lua = Lua::new();
        let host = lua.create_table().unwrap();
        let registry = TypeRegistry::load(&lua, host).unwrap();
        (lua, registry)
    }

    #[test]
    fn first_matching_class_wins() {
        let (lua, registry) = loaded();
        let value: Table = lua.load(r#"return NumberLong("42")"#).eval().unwrap();
        assert_eq!(
            registry.match_extended(&lua, &value).unwrap(),
            Some(ExtendedType::Long)
        );
    }

    #[test]
    fn plain_tables_are_not_extended() {
        let (lua, registry) = loaded();
        let value: Table = lua.load("return { source = 'x', flags = '' }").eval().unwrap();
        assert_eq!(registry.match_extended(&lua, &value).unwrap(), None);
        assert!(!registry.is_document(&lua, &value).unwrap());
    }

    #[test]
    fn parent_links_count_as_membership() {
        let (lua, registry) = loaded();
        let value: Table = lua
            .load(
                r#"
                local Tagged = { __parent = RegExp }
                Tagged.__index = RegExp
                return setmetatable({ source = "a", flags = "" }, Tagged)
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(
            registry.match_extended(&lua, &value).unwrap(),
            Some(ExtendedType::Regex)
        );
    }

    #[test]
    fn document_proxy_keeps_insertion_order() {
        let (lua, registry) = loaded();
        let doc: Table = lua
            .load(r#"local d = Document.new(); d.b = 1; d.a = 2; d.b = 3; return d"#)
            .eval()
            .unwrap();
        assert!(registry.is_document(&lua, &doc).unwrap());
        let (keys, values) = registry.document_entries(&lua, &doc).unwrap();
        let keys: Vec<String> = keys.sequence_values().collect::<mlua::Result<_>>().unwrap();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(values.get::<i64>("b").unwrap(), 3);
    }
}
