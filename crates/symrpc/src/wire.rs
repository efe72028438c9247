use serde::{Deserialize, Serialize};

/// Reserved function name used to invoke a closure held by the peer.
///
/// Its two wire args are the closure ID (a marshaled string) and the
/// marshaled list of invocation arguments.
pub const METHOD_CALL_CLOSURE: &str = "CallClosure";

/// One outbound call. `args` are opaque codec-marshaled blobs; wire arg `i`
/// corresponds to method parameter `i + 1` (parameter 0 is the implicit call
/// context and never crosses the wire).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub call: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<Vec<u8>>,
}

/// The answer to one [`Request`], matched by `call`. An empty `value` means
/// the method had no result slot; a blank `err` (whitespace counts as blank)
/// means success.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub call: String,
    #[serde(default)]
    pub value: Vec<u8>,
    #[serde(default)]
    pub err: String,
}

/// Frame used by stream codecs that multiplex both directions over a single
/// ordered byte stream. Exactly one field is set; message-oriented transports
/// with independent request/response channels never see this type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Vec<u8>>,
}

impl Envelope {
    pub fn request(frame: Vec<u8>) -> Self {
        Self {
            request: Some(frame),
            ..Self::default()
        }
    }

    pub fn response(frame: Vec<u8>) -> Self {
        Self {
            response: Some(frame),
            ..Self::default()
        }
    }
}
