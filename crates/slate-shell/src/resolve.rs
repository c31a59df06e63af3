use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use mlua::{AnyUserData, Function, Lua, MetaMethod, Table, UserData, UserDataMethods, Value};
use parking_lot::Mutex;

use crate::error::ShellError;
use crate::registry::TypeRegistry;
use crate::value::NativeResult;

/// A value the resolver knows how to wait for.
pub enum PromiseLike {
    /// Instance of the script `Promise` class.
    Script(Table),
    /// A [`HostPromise`] settled from the host side.
    Host(AnyUserData),
}

/// Outcome of a fulfilled promise.
pub enum Settled {
    /// Script promises settle with a script value still to be extracted.
    Value(Value),
    Native(NativeResult),
}

pub fn promise_like(
    lua: &Lua,
    registry: &TypeRegistry,
    value: &Value,
) -> Result<Option<PromiseLike>, ShellError> {
    Ok(match value {
        Value::Table(t) if registry.is_promise(lua, t)? => Some(PromiseLike::Script(t.clone())),
        Value::UserData(ud) if ud.is::<HostPromise>() => Some(PromiseLike::Host(ud.clone())),
        _ => None,
    })
}

/// Block until `promise` settles or `timeout` elapses.
///
/// Subscribes exactly one fulfillment and one rejection callback. A script
/// promise can only settle while the script is running, so one still
/// pending here runs into the timeout.
pub fn resolve(lua: &Lua, promise: PromiseLike, timeout: Duration) -> Result<Settled, ShellError> {
    match promise {
        PromiseLike::Script(table) => resolve_script(lua, table, timeout),
        PromiseLike::Host(ud) => {
            let promise = ud.borrow::<HostPromise>()?;
            promise.wait(timeout).map(Settled::Native)
        }
    }
}

fn resolve_script(lua: &Lua, promise: Table, timeout: Duration) -> Result<Settled, ShellError> {
    let (tx, rx) = channel::bounded::<Result<Value, Value>>(1);

    let on_fulfilled = settle_callback(lua, tx.clone(), Ok)?;
    let on_rejected = settle_callback(lua, tx.clone(), Err)?;
    let subscribe: Function = promise.get("subscribe")?;
    subscribe.call::<()>((promise.clone(), on_fulfilled, on_rejected))?;

    // `tx` stays alive until here so a never-settling promise times out
    // instead of disconnecting.
    let outcome = rx.recv_timeout(timeout);
    drop(tx);

    match outcome {
        Ok(Ok(value)) => {
            tracing::debug!("script promise fulfilled");
            Ok(Settled::Value(value))
        }
        Ok(Err(reason)) => {
            tracing::debug!("script promise rejected");
            Err(rejection(lua, reason)?)
        }
        Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
            tracing::debug!(?timeout, "script promise did not settle");
            Err(ShellError::AsyncTimeout(timeout))
        }
    }
}

fn settle_callback(
    lua: &Lua,
    tx: Sender<Result<Value, Value>>,
    wrap: fn(Value) -> Result<Value, Value>,
) -> mlua::Result<Function> {
    lua.create_function(move |_, value: Value| {
        // Only the first settlement counts.
        let _ = tx.try_send(wrap(value));
        Ok(())
    })
}

/// Map a script rejection reason to an error.
///
/// Host errors raised through the script come back unchanged; anything else
/// becomes [`ShellError::AsyncRejection`] with the reason's text and, when
/// the reason carries one, its stack.
fn rejection(lua: &Lua, reason: Value) -> Result<ShellError, ShellError> {
    match reason {
        Value::Error(err) => Ok(match ShellError::from((*err).clone()) {
            ShellError::Script(message) => ShellError::AsyncRejection {
                message,
                stack: traceback(&err),
            },
            host => host,
        }),
        Value::String(s) => Ok(ShellError::AsyncRejection {
            message: s.to_string_lossy(),
            stack: None,
        }),
        Value::Table(t) => {
            let message = match t.get::<Value>("message")? {
                Value::String(s) => s.to_string_lossy(),
                _ => tostring(lua, Value::Table(t.clone()))?,
            };
            let stack = match t.get::<Value>("stack")? {
                Value::String(s) => Some(s.to_string_lossy()),
                _ => None,
            };
            Ok(ShellError::AsyncRejection { message, stack })
        }
        other => Ok(ShellError::AsyncRejection {
            message: tostring(lua, other)?,
            stack: None,
        }),
    }
}

/// Traceback recorded when the error crossed a host callback, if any.
fn traceback(err: &mlua::Error) -> Option<String> {
    match err {
        mlua::Error::CallbackError { traceback, .. } => Some(traceback.clone()),
        mlua::Error::WithContext { cause, .. } => traceback(cause),
        _ => None,
    }
}

fn tostring(lua: &Lua, value: Value) -> Result<String, ShellError> {
    let tostring: Function = lua.globals().get("tostring")?;
    Ok(tostring.call::<String>(value)?)
}

// ── Host promises ───────────────────────────────────────────

type Outcome = Result<NativeResult, ShellError>;

/// A promise settled by host code, possibly from another thread.
///
/// Created with [`HostPromise::pending`]; the paired [`PromiseSettler`]
/// resolves or rejects it once. Awaiting it again returns the same outcome.
pub struct HostPromise {
    receiver: Receiver<Outcome>,
    settled: Mutex<Option<Outcome>>,
}

#[derive(Clone)]
pub struct PromiseSettler {
    sender: Sender<Outcome>,
    settled: Arc<AtomicBool>,
}

impl HostPromise {
    pub fn pending() -> (HostPromise, PromiseSettler) {
        let (sender, receiver) = channel::bounded(1);
        let promise = HostPromise {
            receiver,
            settled: Mutex::new(None),
        };
        let settler = PromiseSettler {
            sender,
            settled: Arc::new(AtomicBool::new(false)),
        };
        (promise, settler)
    }

    pub fn wait(&self, timeout: Duration) -> Outcome {
        let mut settled = self.settled.lock();
        if let Some(outcome) = settled.as_ref() {
            return outcome.clone();
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => {
                tracing::debug!(ok = outcome.is_ok(), "host promise settled");
                *settled = Some(outcome.clone());
                outcome
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::debug!(?timeout, "host promise did not settle");
                Err(ShellError::AsyncTimeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let outcome = Err(ShellError::AsyncRejection {
                    message: "promise was dropped without settling".into(),
                    stack: None,
                });
                *settled = Some(outcome.clone());
                outcome
            }
        }
    }
}

impl UserData for HostPromise {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(match this.settled.lock().as_ref() {
                Some(Ok(_)) => "Promise { <fulfilled> }",
                Some(Err(_)) => "Promise { <rejected> }",
                None => "Promise { <pending> }",
            })
        });
    }
}

impl PromiseSettler {
    /// Returns false when the promise was already settled.
    pub fn resolve(&self, value: NativeResult) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: ShellError) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Outcome) -> bool {
        if self.settled.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.sender.try_send(outcome) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
        }
    }
}
