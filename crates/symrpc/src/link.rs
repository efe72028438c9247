use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::caller::{Binder, Caller, RemoteShape};
use crate::closure::ClosureManager;
use crate::codec::{self, Codec, JsonCodec};
use crate::error::RpcError;
use crate::resolver::{CallReply, Resolver};
use crate::service::{Args, CallContext, LocalService, Outcome};
use crate::transport::{
    stream_transport, EnvelopeSink, EnvelopeSource, JsonLineSink, JsonLineSource, MessageTransport,
};
use crate::wire::{Request, Response, METHOD_CALL_CLOSURE};

/// Default capacity of each per-call response listener.
pub const DEFAULT_RESPONSE_BUFFER_LEN: usize = 1024;

/// Callback invoked with a peer's remote ID. Runs while the peer-table lock
/// is held, so it must not call back into [`Registry::peers`].
pub type ConnectHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Tuning and lifecycle options for [`Registry`].
#[derive(Clone)]
pub struct Options {
    /// Capacity of each outbound call's response listener. Must exceed the
    /// expected number of concurrently in-flight calls, or late listeners
    /// drop their oldest events and the affected calls time out.
    pub response_buffer_len: usize,
    pub on_connect: Option<ConnectHook>,
    pub on_disconnect: Option<ConnectHook>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_buffer_len: DEFAULT_RESPONSE_BUFFER_LEN,
            on_connect: None,
            on_disconnect: None,
        }
    }
}

/// Per-link state shared by the reader loops, the dispatchers, and every
/// stub bound to the link.
pub(crate) struct LinkShared {
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) closures: Arc<ClosureManager>,
    pub(crate) resolver: Resolver,
    pub(crate) request_tx: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) response_tx: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) timeout: Duration,
    /// Per-link child of `root_cancel`; also cancelled when the link ends,
    /// so pending calls fail fast instead of riding out their timers.
    pub(crate) cancel: CancellationToken,
    /// The registry's own token. Distinguishes caller-requested cancellation
    /// from link teardown.
    pub(crate) root_cancel: CancellationToken,
    pub(crate) errors: ErrorReporter,
}

/// 1-slot error funnel: the first loop to fail decides the link's fate, and a
/// second failure during shutdown never blocks.
#[derive(Clone)]
pub(crate) struct ErrorReporter {
    tx: mpsc::Sender<RpcError>,
}

impl ErrorReporter {
    pub(crate) fn report(&self, err: RpcError) {
        let _ = self.tx.try_send(err);
    }
}

struct LinkChannels {
    request_out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    response_out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    errors_rx: mpsc::Receiver<RpcError>,
}

/// The engine: answers its peers' requests out of a [`LocalService`], hands
/// out synthesized stubs for the declared [`RemoteShape`] `R`, and correlates
/// concurrent in-flight calls per link.
///
/// A registry is cheap to clone and serves any number of links concurrently;
/// each `link*` call binds one peer connection and resolves with the first
/// error that tears the link down.
pub struct Registry<R> {
    service: Arc<LocalService>,
    closures: Arc<ClosureManager>,
    remotes: Arc<Mutex<HashMap<String, Arc<R>>>>,
    timeout: Duration,
    cancel: CancellationToken,
    options: Options,
    codec: Arc<dyn Codec>,
}

impl<R> Clone for Registry<R> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            closures: self.closures.clone(),
            remotes: self.remotes.clone(),
            timeout: self.timeout,
            cancel: self.cancel.clone(),
            options: self.options.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<R: RemoteShape> Registry<R> {
    /// `timeout` bounds every outbound call; cancelling `cancel` fails
    /// pending and future calls on every link.
    pub fn new(
        service: LocalService,
        timeout: Duration,
        cancel: CancellationToken,
        options: Options,
    ) -> Self {
        Self {
            service: Arc::new(service),
            closures: Arc::new(ClosureManager::default()),
            remotes: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            cancel,
            options,
            codec: Arc::new(JsonCodec),
        }
    }

    /// Replaces the default JSON codec.
    pub fn with_codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Snapshot of the currently connected peers and their stubs. A peer is
    /// present exactly between its `on_connect` and `on_disconnect` hooks.
    pub fn peers(&self) -> HashMap<String, Arc<R>> {
        self.remotes.lock().clone()
    }

    /// Binds an ordered duplex byte stream using newline-delimited JSON
    /// envelope framing.
    pub async fn link<S>(&self, stream: S) -> Result<(), RpcError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.link_stream(JsonLineSink::new(writer), JsonLineSource::new(reader))
            .await
    }

    /// Binds an envelope codec pair: inbound envelopes are demultiplexed into
    /// request and response queues, outbound frames are wrapped and funneled
    /// through the sink.
    pub async fn link_stream<E, D>(&self, sink: E, source: D) -> Result<(), RpcError>
    where
        E: EnvelopeSink + 'static,
        D: EnvelopeSource + 'static,
    {
        let (shared, channels) = self.make_shared();
        let remote = self.bind_remote(&shared)?;
        let transport = stream_transport(sink, source, shared.cancel.clone());
        self.run_link(shared, channels, transport, remote).await
    }

    /// Binds the four message primitives directly. This is the form message
    /// brokers and dual-stream transports use.
    pub async fn link_message(&self, transport: MessageTransport) -> Result<(), RpcError> {
        let (shared, channels) = self.make_shared();
        let remote = self.bind_remote(&shared)?;
        self.run_link(shared, channels, transport, remote).await
    }

    fn make_shared(&self) -> (Arc<LinkShared>, LinkChannels) {
        let (request_tx, request_out_rx) = mpsc::unbounded_channel();
        let (response_tx, response_out_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::channel(1);

        let shared = Arc::new(LinkShared {
            codec: self.codec.clone(),
            closures: self.closures.clone(),
            resolver: Resolver::new(self.options.response_buffer_len),
            request_tx,
            response_tx,
            timeout: self.timeout,
            cancel: self.cancel.child_token(),
            root_cancel: self.cancel.clone(),
            errors: ErrorReporter { tx: errors_tx },
        });
        let channels = LinkChannels {
            request_out_rx,
            response_out_rx,
            errors_rx,
        };
        (shared, channels)
    }

    /// Validates the declared remote shape and populates it with live stubs.
    /// Runs before the transport is touched.
    fn bind_remote(&self, shared: &Arc<LinkShared>) -> Result<R, RpcError> {
        let mut binder = Binder::new(Caller {
            shared: shared.clone(),
        });
        R::bind(&mut binder)
    }

    async fn run_link(
        &self,
        shared: Arc<LinkShared>,
        mut channels: LinkChannels,
        transport: MessageTransport,
        remote: R,
    ) -> Result<(), RpcError> {
        let MessageTransport {
            mut request_sink,
            mut response_sink,
            mut request_source,
            mut response_source,
        } = transport;

        let remote_id = Uuid::new_v4().to_string();
        {
            let mut remotes = self.remotes.lock();
            remotes.insert(remote_id.clone(), Arc::new(remote));
            if let Some(hook) = &self.options.on_connect {
                hook(&remote_id);
            }
        }
        debug!(%remote_id, "peer connected");

        // Declared first so it runs last: the peer entry outlives the loops.
        let _peer = PeerGuard {
            remotes: self.remotes.clone(),
            hook: self.options.on_disconnect.clone(),
            remote_id: remote_id.clone(),
        };
        let _cancel = shared.cancel.clone().drop_guard();

        let mut tasks = Vec::with_capacity(4);

        {
            let errors = shared.errors.clone();
            let mut rx = channels.request_out_rx;
            tasks.push(tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if let Err(err) = request_sink.send(frame).await {
                        errors.report(RpcError::Transport(err));
                        break;
                    }
                }
            }));
        }

        {
            let errors = shared.errors.clone();
            let mut rx = channels.response_out_rx;
            tasks.push(tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if let Err(err) = response_sink.send(frame).await {
                        errors.report(RpcError::Transport(err));
                        break;
                    }
                }
            }));
        }

        {
            let shared = shared.clone();
            let service = self.service.clone();
            let remote_id = remote_id.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let frame = match request_source.recv().await {
                        Ok(frame) => frame,
                        Err(err) => {
                            shared.errors.report(RpcError::Transport(err));
                            return;
                        }
                    };
                    let request: Request = match codec::unmarshal(shared.codec.as_ref(), &frame) {
                        Ok(request) => request,
                        Err(err) => {
                            shared.errors.report(RpcError::Codec(err));
                            return;
                        }
                    };
                    // One task per request so a slow handler never
                    // head-of-line-blocks the reader.
                    let shared = shared.clone();
                    let service = service.clone();
                    let remote_id = remote_id.clone();
                    tokio::spawn(async move {
                        dispatch(shared, service, remote_id, request).await;
                    });
                }
            }));
        }

        {
            let shared = shared.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let frame = match response_source.recv().await {
                        Ok(frame) => frame,
                        Err(err) => {
                            shared.errors.report(RpcError::Transport(err));
                            return;
                        }
                    };
                    let response: Response = match codec::unmarshal(shared.codec.as_ref(), &frame)
                    {
                        Ok(response) => response,
                        Err(err) => {
                            shared.errors.report(RpcError::Codec(err));
                            return;
                        }
                    };
                    let err = {
                        let trimmed = response.err.trim();
                        (!trimmed.is_empty()).then(|| response.err.clone())
                    };
                    shared.resolver.deliver(CallReply {
                        id: response.call,
                        value: response.value,
                        err,
                        timed_out: false,
                    });
                }
            }));
        }

        let _abort = AbortGuard(tasks);

        let error = channels
            .errors_rx
            .recv()
            .await
            .unwrap_or(RpcError::ChannelClosed);
        debug!(%remote_id, %error, "link ended");
        Err(error)
    }
}

#[cfg(test)]
impl<R: RemoteShape> Registry<R> {
    pub(crate) fn registered_closures(&self) -> usize {
        self.closures.len()
    }
}

struct PeerGuard<R> {
    remotes: Arc<Mutex<HashMap<String, Arc<R>>>>,
    hook: Option<ConnectHook>,
    remote_id: String,
}

impl<R> Drop for PeerGuard<R> {
    fn drop(&mut self) {
        let mut remotes = self.remotes.lock();
        remotes.remove(&self.remote_id);
        if let Some(hook) = &self.hook {
            hook(&self.remote_id);
        }
    }
}

struct AbortGuard(Vec<JoinHandle<()>>);

impl Drop for AbortGuard {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Answers one inbound request: resolves the function on the local service
/// with the closure manager as fallback, decodes nothing eagerly (handlers
/// pull typed arguments out of [`Args`]), and writes exactly one response.
async fn dispatch(
    shared: Arc<LinkShared>,
    service: Arc<LocalService>,
    remote_id: String,
    request: Request,
) {
    let Request {
        call,
        function,
        args,
    } = request;
    debug!(%call, %function, "inbound request");

    let ctx = CallContext::new(remote_id, shared.cancel.clone());

    let outcome = match service.lookup(&function).map(|m| (m.params, m.handler.clone())) {
        Some((params, handler)) => {
            if args.len() != params {
                shared.errors.report(RpcError::InvalidArgs);
                return;
            }
            let args = Args::new(
                args,
                shared.codec.clone(),
                Caller {
                    shared: shared.clone(),
                },
            );
            handler(ctx, args).await
        }
        None if function == METHOD_CALL_CLOSURE => {
            // CallClosure(ctx, id, args): two wire args.
            if args.len() != 2 {
                shared.errors.report(RpcError::InvalidArgs);
                return;
            }
            call_closure(&shared, ctx, &args).await
        }
        None => {
            warn!(%function, "request for unknown function");
            shared.errors.report(RpcError::CannotCallNonFunction);
            return;
        }
    };

    let value = match &outcome.value {
        Some(value) => match shared.codec.marshal(value) {
            Ok(blob) => blob,
            Err(err) => {
                shared.errors.report(RpcError::Codec(err));
                return;
            }
        },
        None => Vec::new(),
    };
    let response = Response {
        call,
        value,
        err: outcome.err.unwrap_or_default(),
    };
    let frame = match codec::marshal(shared.codec.as_ref(), &response) {
        Ok(frame) => frame,
        Err(err) => {
            shared.errors.report(RpcError::Codec(err));
            return;
        }
    };
    if shared.response_tx.send(frame).is_err() {
        debug!(call = %response.call, "link closed before the response could be written");
    }
}

async fn call_closure(shared: &Arc<LinkShared>, ctx: CallContext, args: &[Vec<u8>]) -> Outcome {
    let closure_id: String = match codec::unmarshal(shared.codec.as_ref(), &args[0]) {
        Ok(id) => id,
        Err(err) => return Outcome::error(format!("closure id decode failed: {err}")),
    };
    let list = match codec::unmarshal_value(shared.codec.as_ref(), &args[1]) {
        Ok(list) => list,
        Err(err) => return Outcome::error(format!("closure arguments decode failed: {err}")),
    };
    let values = match list {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };

    match shared.closures.call(ctx, &closure_id, values).await {
        Ok(value) => Outcome::value(value),
        Err(err) => Outcome::error(err.message()),
    }
}
