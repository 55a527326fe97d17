//! The XML document seam: packets, dialback elements, the client→server
//! namespace re-scope and error-stanza wrapping for bounces.

use minidom::{Element, Node};
use sha1::{Digest, Sha1};

pub const NS_CLIENT: &str = "jabber:client";
pub const NS_SERVER: &str = "jabber:server";
pub const NS_DIALBACK: &str = "jabber:server:dialback";
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// A stanza on its way out, with the already-parsed routing domains.
///
/// JID parsing happens upstream (the router hands us prepared domains);
/// only the domain parts matter for federation.
#[derive(Debug, Clone)]
pub struct Packet {
    pub stanza: Element,
    /// Domain of the sending entity.
    pub from: String,
    /// Domain of the receiving entity.
    pub to: String,
    /// Dialback protocol element rather than a routed stanza.
    pub db: bool,
}

impl Packet {
    pub fn new(stanza: Element, from: impl Into<String>, to: impl Into<String>) -> Self {
        let db = stanza.ns() == NS_DIALBACK;
        Self {
            stanza,
            from: from.into(),
            to: to.into(),
            db,
        }
    }
}

/// Stanza-level errors a bounced packet can carry back to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaError {
    ServiceUnavailable,
    RemoteServerNotFound,
}

impl StanzaError {
    pub fn condition(&self) -> &'static str {
        match self {
            StanzaError::ServiceUnavailable => "service-unavailable",
            StanzaError::RemoteServerNotFound => "remote-server-not-found",
        }
    }
}

/// Dialback key: hex(SHA1(secret || remote domain || stream id)).
pub fn db_key(secret: &str, remote_domain: &str, stream_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(secret.as_bytes());
    hasher.update(remote_domain.as_bytes());
    hasher.update(stream_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// `<db:result from to>key</db:result>`: the auth request.
pub fn db_result(from: &str, to: &str, key: &str) -> Element {
    Element::builder("result", NS_DIALBACK)
        .attr("from", from)
        .attr("to", to)
        .append(Node::Text(key.to_owned()))
        .build()
}

/// `<db:result from to type='valid|invalid'/>`: the verify answer sent
/// back over an incoming stream.
pub fn db_result_type(from: &str, to: &str, valid: bool) -> Element {
    Element::builder("result", NS_DIALBACK)
        .attr("from", from)
        .attr("to", to)
        .attr("type", if valid { "valid" } else { "invalid" })
        .build()
}

/// Re-scope a `jabber:client` stanza so the stream's `jabber:server`
/// namespace applies (XMPP §11.2.2). Only the outer element is touched;
/// children keep the namespaces they were parsed with.
pub fn rescope_to_server(stanza: &Element) -> Element {
    if stanza.ns() != NS_CLIENT {
        return stanza.clone();
    }

    let mut builder = Element::builder(stanza.name(), NS_SERVER);
    for (name, value) in stanza.attrs() {
        builder = builder.attr(name, value);
    }
    let mut rescoped = builder.build();
    for node in stanza.nodes() {
        match node {
            Node::Element(child) => {
                rescoped.append_child(child.clone());
            }
            Node::Text(text) => {
                rescoped.append_text_node(text.clone());
            }
        }
    }
    rescoped
}

/// Whether a bounced packet produces an error stanza back into the router:
/// only content in the client namespace that is not already an error.
pub fn is_bounceable(stanza: &Element) -> bool {
    stanza.ns() == NS_CLIENT && stanza.attr("type") != Some("error")
}

/// Turn a stanza into its bounce: to/from swapped, `type='error'`, the
/// condition appended in the stanzas namespace.
pub fn bounce_error(stanza: &Element, err: StanzaError) -> Element {
    let mut builder = Element::builder(stanza.name(), stanza.ns()).attr("type", "error");
    if let Some(to) = stanza.attr("to") {
        builder = builder.attr("from", to);
    }
    if let Some(from) = stanza.attr("from") {
        builder = builder.attr("to", from);
    }
    for (name, value) in stanza.attrs() {
        if matches!(name, "to" | "from" | "type") {
            continue;
        }
        builder = builder.attr(name, value);
    }

    let condition = Element::builder(err.condition(), NS_STANZAS).build();
    let error = Element::builder("error", stanza.ns())
        .attr("type", "cancel")
        .append(Node::Element(condition))
        .build();

    let mut bounced = builder.build();
    for node in stanza.nodes() {
        match node {
            Node::Element(child) => {
                bounced.append_child(child.clone());
            }
            Node::Text(text) => {
                bounced.append_text_node(text.clone());
            }
        }
    }
    bounced.append_child(error);
    bounced
}
