use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::caller::{Callback, Caller};
use crate::codec::Codec;
use crate::error::CallError;
use crate::BoxFuture;

/// The implicit first parameter of every handler: the calling peer's remote
/// ID plus the link's cancellation scope. It is synthesized per dispatch and
/// never crosses the wire.
#[derive(Clone)]
pub struct CallContext {
    remote_id: String,
    cancel: CancellationToken,
}

impl CallContext {
    pub(crate) fn new(remote_id: String, cancel: CancellationToken) -> Self {
        Self { remote_id, cancel }
    }

    /// The remote ID of the peer this call arrived from, as minted when its
    /// link connected.
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Cancellation scope of the link the call arrived on.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("remote_id", &self.remote_id)
            .finish()
    }
}

/// The wire arguments of one inbound call, decoded lazily. Slot `i` holds the
/// method's parameter `i + 1` (the context is parameter 0 and has no slot);
/// value and function-kinded parameters occupy slots the same way.
pub struct Args {
    blobs: Vec<Vec<u8>>,
    codec: Arc<dyn Codec>,
    caller: Caller,
}

impl Args {
    pub(crate) fn new(blobs: Vec<Vec<u8>>, codec: Arc<dyn Codec>, caller: Caller) -> Self {
        Self {
            blobs,
            codec,
            caller,
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Decodes slot `index` into a value of the parameter's declared type.
    pub fn value<T: DeserializeOwned>(&self, index: usize) -> Result<T, CallError> {
        let blob = self
            .blobs
            .get(index)
            .ok_or_else(|| CallError::new(format!("missing argument {index}")))?;
        let value = self.codec.unmarshal(blob)?;
        serde_json::from_value(value)
            .map_err(|err| CallError::new(format!("argument {index} decode failed: {err}")))
    }

    /// Decodes slot `index` as a closure ID and synthesizes the proxy that
    /// calls it back on its owner's side.
    pub fn callback<A: Serialize, R: DeserializeOwned>(
        &self,
        index: usize,
    ) -> Result<Callback<A, R>, CallError> {
        let closure_id: String = self.value(index)?;
        Ok(Callback::new(closure_id, self.caller.clone()))
    }
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Args").field("len", &self.blobs.len()).finish()
    }
}

/// What a handler produced, shaped for the response: an optional result value
/// and an optional error message.
#[derive(Clone, Debug, Default)]
pub struct Outcome {
    pub(crate) value: Option<Value>,
    pub(crate) err: Option<String>,
}

impl Outcome {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn value(value: Value) -> Self {
        Self {
            value: Some(value),
            err: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            value: None,
            err: Some(message.into()),
        }
    }

    /// A failed call that still carries a partial result value. Handlers
    /// return this directly when the `Result` shape is not expressive enough.
    pub fn value_with_error(value: Value, message: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            err: Some(message.into()),
        }
    }
}

/// Conversion from a handler's native return shape to an [`Outcome`].
///
/// Implemented for `()` (methods with no results) and for
/// `Result<T: Serialize, E: Display>`; error-only methods use `T = ()`.
pub trait IntoOutcome {
    fn into_outcome(self) -> Outcome;
}

impl IntoOutcome for () {
    fn into_outcome(self) -> Outcome {
        Outcome::empty()
    }
}

impl IntoOutcome for Outcome {
    fn into_outcome(self) -> Outcome {
        self
    }
}

impl<T: Serialize, E: fmt::Display> IntoOutcome for Result<T, E> {
    fn into_outcome(self) -> Outcome {
        match self {
            Ok(value) => match serde_json::to_value(&value) {
                Ok(value) => Outcome::value(value),
                Err(err) => Outcome::error(format!("result encode failed: {err}")),
            },
            Err(err) => Outcome::error(err.to_string()),
        }
    }
}

type HandlerFn = Arc<dyn Fn(CallContext, Args) -> BoxFuture<Outcome> + Send + Sync>;

pub(crate) struct Method {
    pub(crate) params: usize,
    pub(crate) handler: HandlerFn,
}

/// Name-keyed dispatch table for the methods this side exposes to its peers.
///
/// Handlers run concurrently (one task per inbound request) and must be
/// re-entrant. The declared `params` count is the number of wire arguments;
/// the call context is implicit and not counted.
#[derive(Default)]
pub struct LocalService {
    methods: HashMap<String, Method>,
}

impl LocalService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut, O>(&mut self, function: &str, params: usize, handler: F) -> &mut Self
    where
        F: Fn(CallContext, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: IntoOutcome + 'static,
    {
        let handler: HandlerFn = Arc::new(move |ctx, args| -> BoxFuture<Outcome> {
            let call = handler(ctx, args);
            Box::pin(async move { call.await.into_outcome() })
        });
        self.methods
            .insert(function.to_string(), Method { params, handler });
        self
    }

    pub(crate) fn lookup(&self, function: &str) -> Option<&Method> {
        self.methods.get(function)
    }
}

impl fmt::Debug for LocalService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalService")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}
