#![forbid(unsafe_code)]
//! Symmetric bidirectional RPC over duplex byte streams.
//!
//! Two peers connected by any ordered transport (a TCP socket, a WebSocket,
//! a pair of message-broker streams) each expose methods the other can
//! invoke. Both ends are client and server at once; there is no fixed role.
//! Function values can cross the wire as arguments: the receiver gets a proxy
//! that calls the function back on its owner's side for the duration of the
//! call, enabling continuation-style callbacks inside an RPC.
//!
//! The pieces:
//! - [`LocalService`]: the name-keyed dispatch table of methods this side
//!   answers, with lazily typed [`Args`] and an implicit [`CallContext`]
//!   carrying the calling peer's remote ID.
//! - [`RemoteShape`]: the declared record of [`Stub`]s for what the peer
//!   exposes, validated and populated when a link binds.
//! - [`Registry`]: ties both to a transport. [`Registry::link`] takes byte
//!   streams, [`Registry::link_stream`] envelope codec pairs, and
//!   [`Registry::link_message`] raw message channels. Many links can be
//!   bound concurrently; [`Registry::peers`] enumerates them for fan-out.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use symrpc::{
//!     Binder, CallArg, CallError, CancellationToken, LocalService, Options, Registry,
//!     RemoteShape, RpcError, Signature, Stub,
//! };
//!
//! struct Remote {
//!     echo: Stub<String>,
//! }
//!
//! impl RemoteShape for Remote {
//!     fn bind(binder: &mut Binder) -> Result<Self, RpcError> {
//!         Ok(Self {
//!             echo: binder.stub("Echo", Signature::new(1, 2))?,
//!         })
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut service = LocalService::new();
//! service.register("Echo", 1, |_ctx, args| async move {
//!     let message: String = args.value(0)?;
//!     Ok::<_, CallError>(message)
//! });
//!
//! let registry: Registry<Remote> = Registry::new(
//!     service,
//!     Duration::from_secs(10),
//!     CancellationToken::new(),
//!     Options::default(),
//! );
//!
//! let caller = registry.clone();
//! tokio::spawn(async move {
//!     loop {
//!         if let Some(peer) = caller.peers().into_values().next() {
//!             let echoed = peer.echo.call(vec![CallArg::value("hi")?]).await?;
//!             println!("peer echoed {echoed}");
//!             break;
//!         }
//!         tokio::time::sleep(Duration::from_millis(50)).await;
//!     }
//!     Ok::<_, RpcError>(())
//! });
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:1337").await?;
//! registry.link(stream).await?;
//! # Ok(())
//! # }
//! ```

mod caller;
mod closure;
mod codec;
mod error;
mod link;
mod resolver;
mod service;
mod transport;
mod wire;

pub use caller::{Binder, CallArg, Callback, FromValues, RemoteShape, Signature, Stub};
pub use codec::{Codec, JsonCodec};
pub use error::{CallError, CodecError, RpcError};
pub use link::{ConnectHook, Options, Registry, DEFAULT_RESPONSE_BUFFER_LEN};
pub use service::{Args, CallContext, IntoOutcome, LocalService, Outcome};
pub use transport::{
    EnvelopeSink, EnvelopeSource, JsonLineSink, JsonLineSource, MessageTransport, WireSink,
    WireSource,
};
pub use wire::{Envelope, Request, Response, METHOD_CALL_CLOSURE};

pub use tokio_util::sync::CancellationToken;

pub(crate) type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

#[cfg(test)]
mod tests;
