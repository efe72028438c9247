use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::closure::StoredClosure;
use crate::codec;
use crate::error::{CallError, CodecError, RpcError};
use crate::link::LinkShared;
use crate::resolver::CallReply;
use crate::service::CallContext;
use crate::wire::{Request, METHOD_CALL_CLOSURE};
use crate::BoxFuture;

/// Declared shape of one remote method, as the peer exposes it: `params` wire
/// parameters (the implicit call context excluded) and `returns` return
/// values, the last of which is always the error slot.
///
/// `returns` is `0` for methods with no results, `1` for error-only methods,
/// and `2` for methods returning a value and an error. `context` records that
/// the method's first parameter is the call context; [`Signature::new`] sets
/// it, and declaring it `false` fails validation at bind time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature {
    pub params: usize,
    pub returns: usize,
    pub context: bool,
}

impl Signature {
    pub const fn new(params: usize, returns: usize) -> Self {
        Self {
            params,
            returns,
            context: true,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), RpcError> {
        if self.returns > 2 {
            return Err(RpcError::InvalidReturn);
        }
        if !self.context {
            return Err(RpcError::InvalidArgs);
        }
        Ok(())
    }
}

/// The record of stubs a link populates for its peer. Implementations declare
/// each remote method by name and [`Signature`]:
///
/// ```rust
/// use symrpc::{Binder, RemoteShape, RpcError, Signature, Stub};
///
/// struct Remote {
///     increment: Stub<i64>,
///     println: Stub<()>,
/// }
///
/// impl RemoteShape for Remote {
///     fn bind(binder: &mut Binder) -> Result<Self, RpcError> {
///         Ok(Self {
///             increment: binder.stub("Increment", Signature::new(1, 2))?,
///             println: binder.stub("Println", Signature::new(1, 1))?,
///         })
///     }
/// }
/// ```
pub trait RemoteShape: Send + Sync + 'static {
    fn bind(binder: &mut Binder) -> Result<Self, RpcError>
    where
        Self: Sized;
}

/// Hands out live stubs while a link populates its [`RemoteShape`].
/// Signatures are validated here, before the link performs any I/O.
pub struct Binder {
    caller: Caller,
}

impl Binder {
    pub(crate) fn new(caller: Caller) -> Self {
        Self { caller }
    }

    pub fn stub<T>(&mut self, function: &str, signature: Signature) -> Result<Stub<T>, RpcError> {
        signature.validate()?;
        Ok(Stub {
            function: function.to_string(),
            signature,
            caller: self.caller.clone(),
            _result: PhantomData,
        })
    }
}

/// One argument of an outbound call: either a marshalable value or a function
/// value, which stays on this side of the wire and travels as a closure ID.
pub struct CallArg(pub(crate) CallArgKind);

pub(crate) enum CallArgKind {
    Value(Value),
    Func(StoredClosure),
}

impl CallArg {
    pub fn value<T: Serialize + ?Sized>(value: &T) -> Result<Self, RpcError> {
        let value = serde_json::to_value(value).map_err(CodecError::from)?;
        Ok(Self(CallArgKind::Value(value)))
    }

    /// Wraps a local async closure so the peer can invoke it for the duration
    /// of the call it is passed to. `A` is the closure's argument tuple and
    /// is type-adapted from the invocation's wire values element by element.
    pub fn func<A, R, E, F, Fut>(closure: F) -> Self
    where
        A: FromValues + 'static,
        R: Serialize + 'static,
        E: fmt::Display + 'static,
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R, E>> + Send + 'static,
    {
        let stored: StoredClosure = Arc::new(
            move |ctx: CallContext, values: Vec<Value>| -> BoxFuture<Result<Value, CallError>> {
                match A::from_values(values) {
                    Ok(args) => {
                        let call = closure(ctx, args);
                        Box::pin(async move {
                            let value = call.await.map_err(|err| CallError::new(err.to_string()))?;
                            serde_json::to_value(&value)
                                .map_err(|err| CallError::new(err.to_string()))
                        })
                    }
                    Err(err) => Box::pin(async move { Err(err) }),
                }
            },
        );
        Self(CallArgKind::Func(stored))
    }
}

/// Argument tuple decoded from the wire values of a closure invocation.
pub trait FromValues: Sized {
    fn from_values(values: Vec<Value>) -> Result<Self, CallError>;
}

impl FromValues for () {
    fn from_values(values: Vec<Value>) -> Result<Self, CallError> {
        if values.is_empty() {
            Ok(())
        } else {
            Err(arity_mismatch(0, values.len()))
        }
    }
}

fn arity_mismatch(expected: usize, got: usize) -> CallError {
    CallError::new(format!("closure expected {expected} arguments, got {got}"))
}

macro_rules! tuple_from_values {
    ($len:expr; $($ty:ident),+) => {
        impl<$($ty: DeserializeOwned),+> FromValues for ($($ty,)+) {
            fn from_values(values: Vec<Value>) -> Result<Self, CallError> {
                if values.len() != $len {
                    return Err(arity_mismatch($len, values.len()));
                }
                let mut values = values.into_iter();
                Ok(($(
                    serde_json::from_value::<$ty>(
                        values
                            .next()
                            .ok_or_else(|| arity_mismatch($len, 0))?,
                    )
                    .map_err(|err| CallError::new(format!("closure argument decode failed: {err}")))?,
                )+))
            }
        }
    };
}

tuple_from_values!(1; A);
tuple_from_values!(2; A, B);
tuple_from_values!(3; A, B, C);
tuple_from_values!(4; A, B, C, D);

/// A synthesized callable for one field of the remote interface: marshals its
/// arguments, writes a request, awaits the correlated response, and decodes
/// the declared result type `T`. Error-only and no-result methods declare
/// `Stub<()>`.
pub struct Stub<T = ()> {
    function: String,
    signature: Signature,
    caller: Caller,
    _result: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for Stub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub")
            .field("function", &self.function)
            .field("signature", &self.signature)
            .finish()
    }
}

impl<T: DeserializeOwned> Stub<T> {
    pub async fn call(&self, args: Vec<CallArg>) -> Result<T, RpcError> {
        if args.len() != self.signature.params {
            return Err(RpcError::InvalidArgs);
        }

        let raw = self.caller.invoke(&self.function, args).await?;

        let value = if self.signature.returns < 2 {
            Value::Null
        } else {
            codec::unmarshal_value(self.caller.shared.codec.as_ref(), &raw)
                .map_err(|err| self.caller.fatal(err))?
        };
        serde_json::from_value(value)
            .map_err(|err| self.caller.fatal(CodecError::from(err)))
    }
}

/// Caller-side proxy for a function value received as an argument: invoking
/// it performs an outbound `CallClosure` RPC back to the function's owner.
///
/// `A` is the argument tuple (a lone non-tuple value is sent as a
/// single-element list; wrap sequences in a one-element tuple to keep them a
/// single argument) and `R` the declared result type.
pub struct Callback<A, R> {
    closure_id: String,
    caller: Caller,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for Callback<A, R> {
    fn clone(&self) -> Self {
        Self {
            closure_id: self.closure_id.clone(),
            caller: self.caller.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for Callback<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("closure_id", &self.closure_id)
            .finish()
    }
}

impl<A: Serialize, R: DeserializeOwned> Callback<A, R> {
    pub(crate) fn new(closure_id: String, caller: Caller) -> Self {
        Self {
            closure_id,
            caller,
            _marker: PhantomData,
        }
    }

    pub async fn call(&self, args: A) -> Result<R, RpcError> {
        let list = match serde_json::to_value(&args).map_err(CodecError::from)? {
            Value::Null => Value::Array(Vec::new()),
            Value::Array(items) => Value::Array(items),
            single => Value::Array(vec![single]),
        };

        let raw = self
            .caller
            .invoke(
                METHOD_CALL_CLOSURE,
                vec![
                    CallArg(CallArgKind::Value(Value::String(self.closure_id.clone()))),
                    CallArg(CallArgKind::Value(list)),
                ],
            )
            .await?;

        let value = codec::unmarshal_value(self.caller.shared.codec.as_ref(), &raw)
            .map_err(|err| self.caller.fatal(err))?;
        serde_json::from_value(value).map_err(|err| self.caller.fatal(CodecError::from(err)))
    }
}

/// Shared outbound engine behind every stub and callback of one link.
#[derive(Clone)]
pub(crate) struct Caller {
    pub(crate) shared: Arc<LinkShared>,
}

impl Caller {
    /// Executes one outbound call and returns the raw response value blob.
    /// Function-valued arguments are registered with the closure manager for
    /// exactly the duration of the call.
    pub(crate) async fn invoke(
        &self,
        function: &str,
        args: Vec<CallArg>,
    ) -> Result<Vec<u8>, RpcError> {
        let shared = &self.shared;
        let call_id = Uuid::new_v4().to_string();

        let mut wire_args = Vec::with_capacity(args.len());
        // Free handles drop when this call returns, whatever the outcome.
        let mut parked = Vec::new();
        for arg in args {
            match arg.0 {
                CallArgKind::Value(value) => {
                    let blob = shared.codec.marshal(&value).map_err(|err| self.fatal(err))?;
                    wire_args.push(blob);
                }
                CallArgKind::Func(closure) => {
                    let (closure_id, free) = shared.closures.register(closure);
                    let blob = shared
                        .codec
                        .marshal(&Value::String(closure_id))
                        .map_err(|err| self.fatal(err))?;
                    wire_args.push(blob);
                    parked.push(free);
                }
            }
        }

        let request = Request {
            call: call_id.clone(),
            function: function.to_string(),
            args: wire_args,
        };
        let frame =
            codec::marshal(shared.codec.as_ref(), &request).map_err(|err| self.fatal(err))?;

        let mut listener = shared.resolver.subscribe();
        let deadline = tokio::time::sleep(shared.timeout);
        tokio::pin!(deadline);

        if shared.request_tx.send(frame).is_err() {
            return Err(RpcError::ChannelClosed);
        }

        let reply = loop {
            tokio::select! {
                _ = &mut deadline => {
                    break CallReply {
                        id: call_id.clone(),
                        value: Vec::new(),
                        err: None,
                        timed_out: true,
                    };
                }
                _ = shared.cancel.cancelled() => {
                    // The link token also trips when the link itself dies;
                    // only a cancelled registry context reports as such.
                    return Err(if shared.root_cancel.is_cancelled() {
                        RpcError::Cancelled
                    } else {
                        RpcError::ChannelClosed
                    });
                }
                received = listener.recv() => match received {
                    Ok(reply) if reply.id == call_id => break reply,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(call = %call_id, skipped, "response listener lagged, oldest events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(RpcError::ChannelClosed),
                },
            }
        };

        if reply.timed_out {
            return Err(RpcError::CallTimedOut);
        }
        if let Some(message) = reply.err {
            let partial = (!reply.value.is_empty()).then_some(reply.value);
            return Err(RpcError::Remote { message, partial });
        }
        Ok(reply.value)
    }

    /// Reports a codec failure on the link's error channel (terminating the
    /// link) and hands a copy back for the per-call result.
    pub(crate) fn fatal(&self, err: CodecError) -> RpcError {
        self.shared.errors.report(RpcError::Codec(err.clone()));
        RpcError::Codec(err)
    }
}
