//! The stream codec seam.
//!
//! The XMPP stream layer (XML framing, stream headers, TLS) lives outside
//! this crate. What the engine needs from it is a byte-level state machine:
//! feed it bytes off the wire, poll it for events, drain its pending output
//! to the socket. Everything here is that interface plus the router-link
//! seam the bounce path delivers into.

use minidom::Element;

/// Parameters for opening an outbound stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOpen {
    pub to: Option<String>,
    pub from: Option<String>,
    /// Announced stream version; `Some("1.0")` when the local side can
    /// negotiate features.
    pub version: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The peer's stream header arrived; the stream is usable.
    Opened {
        id: String,
        version: Option<String>,
    },
    /// A complete top-level element.
    Packet(Element),
    /// The peer closed the stream gracefully.
    Closed,
}

/// A fatal or non-fatal stream-level error.
#[derive(Debug, Clone)]
pub struct StreamError {
    /// Defined condition, e.g. `host-unknown`, when the peer sent one.
    pub condition: Option<String>,
    pub text: String,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.condition {
            Some(condition) => write!(f, "{} ({condition})", self.text),
            None => self.text.fmt(f),
        }
    }
}

/// Stream errors that mark the remote host bad: the peer told us it will
/// not service this stream, so reconnecting to the same address is useless.
const FATAL_CONDITIONS: [&str; 11] = [
    "host-gone",
    "host-unknown",
    "not-authorized",
    "see-other-host",
    "system-shutdown",
    "policy-violation",
    "remote-connection-failed",
    "unsupported-encoding",
    "undefined-condition",
    "internal-server-error",
    "unsupported-version",
];

pub(crate) fn is_fatal_stream_error(error: &StreamError) -> bool {
    error
        .condition
        .as_deref()
        .is_some_and(|condition| FATAL_CONDITIONS.contains(&condition))
}

pub trait StreamCodec {
    /// The stream id assigned by the peer (outbound) or by us (incoming).
    fn stream_id(&self) -> Option<String>;

    /// Stream version the peer announced, if any.
    fn remote_version(&self) -> Option<String>;

    fn is_secure(&self) -> bool;

    /// Begin STARTTLS. Returns `false` if the codec cannot (no TLS stack).
    fn starttls(&mut self) -> bool;

    /// Bytes off the wire. A stream-level parse or protocol failure comes
    /// back as an error; buffered events survive and must still be drained.
    fn feed(&mut self, bytes: &[u8]) -> Result<(), StreamError>;

    fn poll_event(&mut self) -> Option<StreamEvent>;

    /// Queue an element for writing.
    fn write(&mut self, element: Element);

    /// Queue raw bytes (whitespace keepalives).
    fn write_raw(&mut self, bytes: &[u8]);

    /// The next chunk of buffered output, if any.
    fn pending_write(&mut self) -> Option<&[u8]>;

    fn consume_write(&mut self, n: usize);

    /// Queue a stream error towards the peer.
    fn stream_error(&mut self, condition: &str, text: &str);

    /// Begin a graceful close: once the pending output drains, the
    /// connection should be torn down.
    fn close(&mut self);

    /// Whether `close` was requested.
    fn is_closing(&self) -> bool;
}

/// Creates codecs for connections the engine opens or accepts.
pub trait CodecFactory {
    fn outbound(&mut self, open: StreamOpen) -> Box<dyn StreamCodec>;
    fn inbound(&mut self) -> Box<dyn StreamCodec>;
}

/// Where bounced stanzas go: the link back into the local router.
pub trait RouterSink {
    fn deliver(&mut self, stanza: Element);
}
