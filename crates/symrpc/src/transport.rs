use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::wire::Envelope;

/// Outbound half of one message channel. Implementations exist for tokio
/// mpsc senders, so broker-style transports can be assembled from plain
/// channels fed by whatever consumes the broker client.
#[async_trait]
pub trait WireSink: Send {
    async fn send(&mut self, frame: Vec<u8>) -> io::Result<()>;
}

/// Inbound half of one message channel.
#[async_trait]
pub trait WireSource: Send {
    async fn recv(&mut self) -> io::Result<Vec<u8>>;
}

/// Writes [`Envelope`] frames to an ordered stream codec.
#[async_trait]
pub trait EnvelopeSink: Send {
    async fn send(&mut self, envelope: Envelope) -> io::Result<()>;
}

/// Reads [`Envelope`] frames from an ordered stream codec.
#[async_trait]
pub trait EnvelopeSource: Send {
    async fn recv(&mut self) -> io::Result<Envelope>;
}

/// The four read/write primitives a link runs on: independent request and
/// response channels in each direction. Message brokers and dual-stream
/// transports construct this directly; byte streams go through
/// [`Registry::link`](crate::Registry::link) or
/// [`Registry::link_stream`](crate::Registry::link_stream) instead.
pub struct MessageTransport {
    pub request_sink: Box<dyn WireSink>,
    pub response_sink: Box<dyn WireSink>,
    pub request_source: Box<dyn WireSource>,
    pub response_source: Box<dyn WireSource>,
}

impl MessageTransport {
    pub fn new(
        request_sink: impl WireSink + 'static,
        response_sink: impl WireSink + 'static,
        request_source: impl WireSource + 'static,
        response_source: impl WireSource + 'static,
    ) -> Self {
        Self {
            request_sink: Box::new(request_sink),
            response_sink: Box::new(response_sink),
            request_source: Box::new(request_source),
            response_source: Box::new(response_source),
        }
    }
}

fn channel_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "transport channel closed")
}

#[async_trait]
impl WireSink for mpsc::UnboundedSender<Vec<u8>> {
    async fn send(&mut self, frame: Vec<u8>) -> io::Result<()> {
        mpsc::UnboundedSender::send(self, frame).map_err(|_| channel_closed())
    }
}

#[async_trait]
impl WireSink for mpsc::Sender<Vec<u8>> {
    async fn send(&mut self, frame: Vec<u8>) -> io::Result<()> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| channel_closed())
    }
}

#[async_trait]
impl WireSource for mpsc::UnboundedReceiver<Vec<u8>> {
    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        mpsc::UnboundedReceiver::recv(self)
            .await
            .ok_or_else(channel_closed)
    }
}

#[async_trait]
impl WireSource for mpsc::Receiver<Vec<u8>> {
    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        mpsc::Receiver::recv(self).await.ok_or_else(channel_closed)
    }
}

/// Newline-delimited JSON framing over any byte writer; the default codec for
/// [`Registry::link`](crate::Registry::link).
pub struct JsonLineSink<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> JsonLineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EnvelopeSink for JsonLineSink<W> {
    async fn send(&mut self, envelope: Envelope) -> io::Result<()> {
        let mut line = serde_json::to_vec(&envelope)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await
    }
}

/// Newline-delimited JSON framing over any byte reader. Blank lines are
/// skipped; end of stream surfaces as [`io::ErrorKind::UnexpectedEof`].
pub struct JsonLineSource<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin + Send> JsonLineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> EnvelopeSource for JsonLineSource<R> {
    async fn recv(&mut self) -> io::Result<Envelope> {
        loop {
            let line = self.lines.next_line().await?.ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed")
            })?;
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err));
        }
    }
}

type SharedError = Arc<Mutex<Option<io::Error>>>;

/// Adapts an envelope codec pair into the four message primitives: a demux
/// task splits inbound envelopes into request and response queues, and a
/// single mux task serializes both outbound directions through the sink.
pub(crate) fn stream_transport(
    sink: impl EnvelopeSink + 'static,
    source: impl EnvelopeSource + 'static,
    cancel: CancellationToken,
) -> MessageTransport {
    let (request_in_tx, request_in_rx) = mpsc::unbounded_channel();
    let (response_in_tx, response_in_rx) = mpsc::unbounded_channel();
    let decode_error: SharedError = Arc::default();

    {
        let decode_error = decode_error.clone();
        tokio::spawn(async move {
            let mut source = source;
            loop {
                let envelope = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = source.recv() => match received {
                        Ok(envelope) => envelope,
                        Err(err) => {
                            *decode_error.lock() = Some(err);
                            break;
                        }
                    },
                };
                if let Some(frame) = envelope.request {
                    if request_in_tx.send(frame).is_err() {
                        break;
                    }
                }
                if let Some(frame) = envelope.response {
                    if response_in_tx.send(frame).is_err() {
                        break;
                    }
                }
            }
        });
    }

    let (envelope_tx, mut envelope_rx) = mpsc::unbounded_channel::<Envelope>();
    let encode_error: SharedError = Arc::default();

    {
        let encode_error = encode_error.clone();
        tokio::spawn(async move {
            let mut sink = sink;
            while let Some(envelope) = envelope_rx.recv().await {
                if let Err(err) = sink.send(envelope).await {
                    *encode_error.lock() = Some(err);
                    break;
                }
            }
        });
    }

    MessageTransport {
        request_sink: Box::new(MuxSink {
            envelope_tx: envelope_tx.clone(),
            error: encode_error.clone(),
            wrap: Envelope::request,
        }),
        response_sink: Box::new(MuxSink {
            envelope_tx,
            error: encode_error,
            wrap: Envelope::response,
        }),
        request_source: Box::new(DemuxSource {
            rx: request_in_rx,
            error: decode_error.clone(),
        }),
        response_source: Box::new(DemuxSource {
            rx: response_in_rx,
            error: decode_error,
        }),
    }
}

struct MuxSink {
    envelope_tx: mpsc::UnboundedSender<Envelope>,
    error: SharedError,
    wrap: fn(Vec<u8>) -> Envelope,
}

#[async_trait]
impl WireSink for MuxSink {
    async fn send(&mut self, frame: Vec<u8>) -> io::Result<()> {
        if self.envelope_tx.send((self.wrap)(frame)).is_err() {
            return Err(self.error.lock().take().unwrap_or_else(channel_closed));
        }
        Ok(())
    }
}

struct DemuxSource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    error: SharedError,
}

#[async_trait]
impl WireSource for DemuxSource {
    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        match self.rx.recv().await {
            Some(frame) => Ok(frame),
            None => Err(self.error.lock().take().unwrap_or_else(channel_closed)),
        }
    }
}
