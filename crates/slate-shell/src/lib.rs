//! Value bridge between an embedded Lua shell and typed database results.
//!
//! Scripts run in a [`ShellRuntime`]. Values they produce are converted into
//! [`NativeResult`]s by the extractor, and native values go back in through
//! the injector. Query results are consumed through lazily configured
//! [`Cursor`]s that bind their result stream exactly once.

pub mod config;
pub mod convert;
pub mod cursor;
pub mod date;
pub mod error;
pub mod extract;
pub mod inject;
pub mod memory;
pub mod registry;
pub mod resolve;
pub mod result;
pub mod runtime;
pub mod value;

pub use config::ShellConfig;
pub use cursor::{
    Cursor, CursorKind, CursorOptions, QuerySource, ReadPreference, ReadPreferenceMode,
    ResultStream, Transform,
};
pub use error::ShellError;
pub use extract::{TypeHint, extract};
pub use inject::{HostValue, inject, inject_map};
pub use memory::MemorySource;
pub use registry::{ExtendedType, TypeRegistry};
pub use resolve::{HostPromise, PromiseSettler};
pub use result::{BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult};
pub use runtime::{LuaCursor, ShellRuntime};
pub use value::{CursorHandle, NativeResult, ResultDocument};
