use tokio::sync::broadcast;

/// One decoded response event, fanned out to every stub awaiting a reply.
/// `timed_out` is only ever set on the synthetic event a stub's own timer
/// produces; events decoded off the wire always carry `false`.
#[derive(Clone, Debug)]
pub(crate) struct CallReply {
    pub(crate) id: String,
    pub(crate) value: Vec<u8>,
    pub(crate) err: Option<String>,
    pub(crate) timed_out: bool,
}

/// Broadcast relay between the response-reader loop and the stubs of one
/// link. Publishing never blocks; a listener that falls behind its buffer
/// loses the oldest events, which is why the buffer must exceed the expected
/// number of in-flight calls.
pub(crate) struct Resolver {
    hub: broadcast::Sender<CallReply>,
}

impl Resolver {
    pub(crate) fn new(buffer: usize) -> Self {
        let (hub, _) = broadcast::channel(buffer.max(1));
        Self { hub }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CallReply> {
        self.hub.subscribe()
    }

    pub(crate) fn deliver(&self, reply: CallReply) {
        // No listeners just means nobody is waiting on this call anymore.
        let _ = self.hub.send(reply);
    }
}
