use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the shell bridge.
///
/// Every variant is returned synchronously to the call that triggered it.
/// Nothing here is retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShellError {
    /// No result variant matched a script value.
    #[error("cannot convert {handle}: {reason}")]
    TypeRecognition { handle: String, reason: String },

    /// Cursor state-machine violation.
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    /// Wrong arity or argument type for a constructor-style helper.
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("promise did not settle within {0:?}")]
    AsyncTimeout(Duration),

    #[error("promise rejected: {message}")]
    AsyncRejection {
        message: String,
        stack: Option<String>,
    },

    /// Runtime failure raised by script code.
    #[error("script error: {0}")]
    Script(String),

    /// Failure reported by the query-source collaborator.
    #[error("driver error: {0}")]
    Driver(String),
}

impl ShellError {
    pub(crate) fn unrecognized(handle: impl Into<String>, reason: impl Into<String>) -> Self {
        ShellError::TypeRecognition {
            handle: handle.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn already_executed() -> Self {
        ShellError::IllegalState("query already executed".into())
    }

    pub(crate) fn closed() -> Self {
        ShellError::IllegalState("cursor is closed".into())
    }
}

impl From<mlua::Error> for ShellError {
    fn from(e: mlua::Error) -> Self {
        match e {
            mlua::Error::CallbackError { cause, .. } => ShellError::from((*cause).clone()),
            mlua::Error::WithContext { cause, .. } => ShellError::from((*cause).clone()),
            mlua::Error::ExternalError(inner) => match inner.downcast_ref::<ShellError>() {
                Some(shell) => shell.clone(),
                None => ShellError::Script(inner.to_string()),
            },
            mlua::Error::RuntimeError(msg) => ShellError::Script(msg),
            other => ShellError::Script(other.to_string()),
        }
    }
}

impl From<ShellError> for mlua::Error {
    fn from(e: ShellError) -> Self {
        mlua::Error::external(e)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn wrapped_shell_error_survives_callback_chain() {
        let original = ShellError::NotSupported("clone".into());
        let lua_err = mlua::Error::CallbackError {
            traceback: "stack traceback:".into(),
            cause: Arc::new(mlua::Error::from(original.clone())),
        };
        assert_eq!(ShellError::from(lua_err), original);
    }

    #[test]
    fn runtime_error_becomes_script_error() {
        let err = ShellError::from(mlua::Error::RuntimeError("boom".into()));
        assert_eq!(err, ShellError::Script("boom".into()));
    }
}
