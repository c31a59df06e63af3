use bson::Document;

use crate::cursor::CursorOptions;
use crate::error::ShellError;

/// An unexecuted query or aggregation handed out by the driver facade.
///
/// The cursor engine calls exactly one of these per terminal call that needs
/// the server; `execute` is called at most once per cursor.
pub trait QuerySource: Send {
    /// Bind a result stream using the accumulated modifiers.
    fn execute(&mut self, options: &CursorOptions) -> Result<Box<dyn ResultStream>, ShellError>;

    fn count(&mut self, options: &CursorOptions) -> Result<u64, ShellError>;

    fn explain(
        &mut self,
        options: &CursorOptions,
        verbosity: Option<&str>,
    ) -> Result<Document, ShellError>;
}

/// A live result stream. Exclusively owned by one cursor.
pub trait ResultStream: Send {
    fn has_next(&mut self) -> Result<bool, ShellError>;

    fn next(&mut self) -> Result<Option<Document>, ShellError>;

    /// Release server-side resources. Must not fail.
    fn close(&mut self);
}
