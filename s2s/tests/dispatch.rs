//! End-to-end dispatch scenarios over loopback: a fake DNS upstream
//! answers the resolver, real TCP sockets carry the streams, and scripted
//! codecs drive the stream events.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read as _, Write as _};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::rc::Rc;
use std::time::{Duration, Instant};

use dns_wire::{DomainName, OwnedRecord, Query, RecordType, ResponseBuilder, ResponseCode, records};
use minidom::{Element, Node};
use roost_reactor::Reactor;
use roost_s2s::stream::{StreamError, StreamEvent};
use roost_s2s::testing::{ScriptFactory, ScriptHandle, VecRouter};
use roost_s2s::{Config, InEvent, Packet, S2s, stanza};

struct FakeDns {
    socket: UdpSocket,
    zone: HashMap<(String, RecordType), Vec<OwnedRecord>>,
    queries: Vec<(String, RecordType)>,
}

impl FakeDns {
    fn new() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        Self {
            socket,
            zone: HashMap::new(),
            queries: Vec::new(),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    fn add_srv(&mut self, service: &str, priority: u16, weight: u16, port: u16, target: &str) {
        self.zone
            .entry((service.to_owned(), RecordType::SRV))
            .or_default()
            .push(records::srv(
                name(service),
                300,
                priority,
                weight,
                port,
                name(target),
            ));
    }

    fn add_a(&mut self, host: &str, ip: &str) {
        self.zone
            .entry((host.to_owned(), RecordType::A))
            .or_default()
            .push(records::a(name(host), 60, ip.parse().unwrap()));
    }

    /// Answer every query currently queued on the socket; unknown names
    /// get NXDOMAIN.
    fn pump(&mut self) {
        let mut buf = [0u8; 2048];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => panic!("fake dns recv failed: {e}"),
            };
            let Ok(query) = Query::parse(&buf[..n]) else {
                continue;
            };
            let qname = query.domain().to_string().trim_end_matches('.').to_owned();
            let key = (qname, query.qtype());
            self.queries.push(key.clone());

            let response = match self.zone.get(&key) {
                Some(rrs) => ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
                    .with_records(rrs.iter().cloned())
                    .build(),
                None => ResponseBuilder::for_query(&query, ResponseCode::NXDOMAIN).build(),
            };
            self.socket.send_to(response.as_bytes(), from).unwrap();
        }
    }
}

fn name(s: &str) -> DomainName {
    DomainName::vec_from_str(s).unwrap()
}

fn chat(from: &str, to: &str, body: &str) -> Element {
    Element::builder("message", stanza::NS_CLIENT)
        .attr("from", from)
        .attr("to", to)
        .attr("type", "chat")
        .append(Node::Element(
            Element::builder("body", stanza::NS_CLIENT)
                .append(Node::Text(body.to_owned()))
                .build(),
        ))
        .build()
}

fn packet(body: &str) -> Packet {
    Packet::new(
        chat("romeo@a.example", "juliet@b.example", body),
        "a.example",
        "b.example",
    )
}

struct Harness {
    m: Reactor,
    s2s: S2s,
    dns: FakeDns,
    created: Rc<RefCell<Vec<ScriptHandle>>>,
    delivered: Rc<RefCell<Vec<Element>>>,
}

fn harness(tweak: impl FnOnce(&mut Config)) -> Harness {
    let dns = FakeDns::new();

    let mut cfg = Config {
        local_secret: "s3cr3t".to_owned(),
        lookup_srv: vec!["_xmpp-server._tcp".to_owned()],
        upstream_resolvers: vec![dns.addr()],
        check_interval: 0,
        ..Config::default()
    };
    tweak(&mut cfg);

    let factory = ScriptFactory::default();
    let (_, created) = factory.handles();
    let router = VecRouter::default();
    let delivered = router.delivered.clone();

    let mut m = Reactor::new(1024).unwrap();
    let mut s2s = S2s::new(cfg, Box::new(factory), Box::new(router), [7; 32]);
    s2s.attach(&mut m).unwrap();

    Harness {
        m,
        s2s,
        dns,
        created,
        delivered,
    }
}

impl Harness {
    fn spin(&mut self, what: &str, mut done: impl FnMut(&mut S2s) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(&mut self.s2s) {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            self.m
                .run(&mut self.s2s, Some(Duration::from_millis(20)))
                .unwrap();
            self.dns.pump();
        }
    }

    /// Wait until the peer listener accepts a connection from the engine.
    fn expect_connect(&mut self, listener: &TcpListener) -> TcpStream {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "engine never connected");
            self.m
                .run(&mut self.s2s, Some(Duration::from_millis(20)))
                .unwrap();
            self.dns.pump();
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true).unwrap();
                    return stream;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("accept failed: {e}"),
            }
        }
    }
}

fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// A dead endpoint: bound once, then dropped.
fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Byte from the peer so the engine re-enters the codec and drains
/// whatever events the test scripted.
fn nudge(peer: &mut TcpStream) {
    peer.write_all(b" ").unwrap();
}

fn written_len(script: &ScriptHandle) -> usize {
    script.borrow().written.len()
}

fn push_event(script: &ScriptHandle, event: StreamEvent) {
    script.borrow_mut().events.push_back(event);
}

fn opened(id: &str) -> StreamEvent {
    StreamEvent::Opened {
        id: id.to_owned(),
        version: None,
    }
}

fn db_result_packet(from: &str, to: &str, kind: &str) -> StreamEvent {
    StreamEvent::Packet(
        Element::builder("result", stanza::NS_DIALBACK)
            .attr("from", from)
            .attr("to", to)
            .attr("type", kind)
            .build(),
    )
}

#[test]
fn cold_send_runs_dialback_before_data() {
    let (peers, port) = listener();
    let mut h = harness(|_| {});
    h.dns
        .add_srv("_xmpp-server._tcp.b.example", 10, 20, port, "x.b.example");
    h.dns.add_a("x.b.example", "127.0.0.1");

    // Two packets before anything resolved: one SRV query, FIFO later.
    h.s2s.out_packet(&mut h.m, packet("one")).unwrap();
    h.s2s.out_packet(&mut h.m, packet("two")).unwrap();

    let mut peer = h.expect_connect(&peers);
    assert_eq!(
        h.dns
            .queries
            .iter()
            .filter(|(_, rtype)| *rtype == RecordType::SRV)
            .count(),
        1,
        "pending resolution must not spawn extra queries"
    );

    let script = h.created.borrow()[0].clone();
    push_event(&script, opened("stream1"));
    nudge(&mut peer);
    h.spin("dialback request", |_| written_len(&script) >= 1);

    {
        let s = script.borrow();
        let db = &s.written[0];
        assert_eq!(db.name(), "result");
        assert_eq!(db.ns(), stanza::NS_DIALBACK);
        assert_eq!(db.attr("from"), Some("a.example"));
        assert_eq!(db.attr("to"), Some("b.example"));
        assert_eq!(db.text(), stanza::db_key("s3cr3t", "b.example", "stream1"));
    }

    push_event(&script, db_result_packet("b.example", "a.example", "valid"));
    nudge(&mut peer);
    h.spin("queued packets", |_| written_len(&script) >= 3);

    {
        let s = script.borrow();
        assert_eq!(s.written[1].name(), "message");
        // Client-scoped stanzas are re-scoped to the stream namespace.
        assert_eq!(s.written[1].ns(), stanza::NS_SERVER);
        assert_eq!(
            s.written[1]
                .get_child("body", stanza::NS_CLIENT)
                .map(|b| b.text()),
            Some("one".to_owned())
        );
        assert_eq!(
            s.written[2]
                .get_child("body", stanza::NS_CLIENT)
                .map(|b| b.text()),
            Some("two".to_owned())
        );
    }
    assert!(h.delivered.borrow().is_empty(), "nothing bounced");

    // The bytes really went out, dialback first.
    let mut wire = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while !String::from_utf8_lossy(&wire).contains("message") {
        assert!(Instant::now() < deadline, "stanza never hit the wire");
        let mut buf = [0u8; 4096];
        match peer.read(&mut buf) {
            Ok(n) => wire.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                h.m.run(&mut h.s2s, Some(Duration::from_millis(10)))
                    .unwrap();
            }
            Err(e) => panic!("peer read failed: {e}"),
        }
    }
    let wire = String::from_utf8_lossy(&wire);
    assert!(wire.find("result").unwrap() < wire.find("message").unwrap());
}

#[test]
fn failed_resolution_bounces_with_remote_server_not_found() {
    let mut h = harness(|_| {});
    // No zone entries at all: SRV and A both come back NXDOMAIN.

    let delivered = h.delivered.clone();
    h.s2s.out_packet(&mut h.m, packet("hi")).unwrap();
    h.spin("bounce", |_| !delivered.borrow().is_empty());

    {
        let delivered = h.delivered.borrow();
        let bounced = &delivered[0];
        assert_eq!(bounced.attr("type"), Some("error"));
        assert_eq!(bounced.attr("to"), Some("romeo@a.example"));
        assert_eq!(bounced.attr("from"), Some("juliet@b.example"));
        let error = bounced.get_child("error", stanza::NS_CLIENT).unwrap();
        assert!(
            error
                .get_child("remote-server-not-found", stanza::NS_STANZAS)
                .is_some()
        );
    }

    // The failure is negatively cached: the next packet bounces without a
    // single new DNS query.
    let queries_before = h.dns.queries.len();
    assert!(h.s2s.out_packet(&mut h.m, packet("again")).is_err());
    assert_eq!(h.delivered.borrow().len(), 2);
    h.dns.pump();
    assert_eq!(h.dns.queries.len(), queries_before);
}

#[test]
fn one_connection_carries_two_domains_when_reuse_is_on() {
    let (peers, port) = listener();
    let mut h = harness(|cfg| cfg.out_reuse = true);
    h.dns
        .add_srv("_xmpp-server._tcp.b.example", 10, 20, port, "shared.example");
    h.dns
        .add_srv("_xmpp-server._tcp.c.example", 10, 20, port, "shared.example");
    h.dns.add_a("shared.example", "127.0.0.1");

    h.s2s.out_packet(&mut h.m, packet("to b")).unwrap();

    let mut peer = h.expect_connect(&peers);
    let script = h.created.borrow()[0].clone();
    push_event(&script, opened("stream1"));
    nudge(&mut peer);
    h.spin("first dialback", |_| written_len(&script) >= 1);

    push_event(&script, db_result_packet("b.example", "a.example", "valid"));
    nudge(&mut peer);
    h.spin("first message", |_| written_len(&script) >= 2);

    // Second domain resolves to the same endpoint: the connection is
    // adopted and a second dialback exchange runs on it.
    h.s2s
        .out_packet(
            &mut h.m,
            Packet::new(
                chat("romeo@a.example", "nurse@c.example", "to c"),
                "a.example",
                "c.example",
            ),
        )
        .unwrap();
    h.spin("second dialback", |_| written_len(&script) >= 3);

    push_event(&script, db_result_packet("c.example", "a.example", "valid"));
    nudge(&mut peer);
    h.spin("second message", |_| written_len(&script) >= 4);

    assert_eq!(h.created.borrow().len(), 1, "exactly one connection");
    let s = script.borrow();
    assert_eq!(s.written[0].attr("to"), Some("b.example"));
    assert_eq!(s.written[1].attr("to"), Some("juliet@b.example"));
    assert_eq!(s.written[2].name(), "result");
    assert_eq!(s.written[2].attr("to"), Some("c.example"));
    assert_eq!(s.written[3].attr("to"), Some("nurse@c.example"));

    // And nothing else tried to connect.
    assert!(matches!(
        peers.accept(),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
    ));
}

#[test]
fn failed_host_is_suppressed_and_the_next_one_tried() {
    let (peers, live_port) = listener();
    let dead_port = free_port();
    let mut h = harness(|_| {});
    // h1 has the better priority and is tried first; it is dead.
    h.dns.add_srv(
        "_xmpp-server._tcp.b.example",
        10,
        20,
        dead_port,
        "h1.b.example",
    );
    h.dns.add_srv(
        "_xmpp-server._tcp.b.example",
        20,
        20,
        live_port,
        "h2.b.example",
    );
    h.dns.add_a("h1.b.example", "127.0.0.1");
    h.dns.add_a("h2.b.example", "127.0.0.1");

    h.s2s.out_packet(&mut h.m, packet("hi")).unwrap();

    // The engine fails over to h2 on its own.
    let mut peer = h.expect_connect(&peers);

    let script = {
        let created = h.created.borrow();
        created[created.len() - 1].clone()
    };
    push_event(&script, opened("stream9"));
    nudge(&mut peer);
    h.spin("dialback on the failover host", |_| {
        written_len(&script) >= 1
    });

    push_event(&script, db_result_packet("b.example", "a.example", "valid"));
    nudge(&mut peer);
    h.spin("message on the failover host", |_| {
        written_len(&script) >= 2
    });
    assert!(h.delivered.borrow().is_empty(), "nothing bounced");
}

#[test]
fn dropped_connection_with_an_aged_queue_bounces_instead_of_reconnecting() {
    let (peers, port) = listener();
    let mut h = harness(|cfg| cfg.retry_limit = 1);
    h.dns
        .add_srv("_xmpp-server._tcp.b.example", 10, 20, port, "x.b.example");
    h.dns.add_a("x.b.example", "127.0.0.1");

    h.s2s.out_packet(&mut h.m, packet("hi")).unwrap();

    // Connected, but never brought online: the packet stays queued.
    let peer = h.expect_connect(&peers);

    std::thread::sleep(Duration::from_millis(1100));
    drop(peer);

    let delivered = h.delivered.clone();
    h.spin("bounce", |_| !delivered.borrow().is_empty());
    {
        let delivered = h.delivered.borrow();
        let error = delivered[0].get_child("error", stanza::NS_CLIENT).unwrap();
        assert!(
            error
                .get_child("service-unavailable", stanza::NS_STANZAS)
                .is_some()
        );
    }

    // No reconnect attempt was made for the bounced route.
    for _ in 0..5 {
        h.m.run(&mut h.s2s, Some(Duration::from_millis(20)))
            .unwrap();
        h.dns.pump();
    }
    assert!(matches!(
        peers.accept(),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
    ));
}

#[test]
fn invalid_dialback_answer_closes_and_bounces() {
    let (peers, port) = listener();
    let mut h = harness(|_| {});
    h.dns
        .add_srv("_xmpp-server._tcp.b.example", 10, 20, port, "x.b.example");
    h.dns.add_a("x.b.example", "127.0.0.1");

    h.s2s.out_packet(&mut h.m, packet("hi")).unwrap();

    let mut peer = h.expect_connect(&peers);
    let script = h.created.borrow()[0].clone();
    push_event(&script, opened("stream1"));
    nudge(&mut peer);
    h.spin("dialback request", |_| written_len(&script) >= 1);

    push_event(&script, db_result_packet("b.example", "a.example", "invalid"));
    nudge(&mut peer);
    let delivered = h.delivered.clone();
    h.spin("bounce", |_| !delivered.borrow().is_empty());

    {
        let s = script.borrow();
        assert_eq!(
            s.errors,
            vec![(
                "invalid-id".to_owned(),
                "dialback negotiation failed".to_owned()
            )]
        );
        assert!(s.closed);
    }
    let delivered = h.delivered.borrow();
    let error = delivered[0].get_child("error", stanza::NS_CLIENT).unwrap();
    assert!(
        error
            .get_child("service-unavailable", stanza::NS_STANZAS)
            .is_some()
    );
}

#[test]
fn verify_answers_flow_back_over_the_incoming_stream() {
    let (peers, out_port) = listener();
    let in_port = free_port();
    let mut h = harness(|cfg| cfg.listen_port = in_port);
    h.dns
        .add_srv("_xmpp-server._tcp.b.example", 10, 20, out_port, "x.b.example");
    h.dns.add_a("x.b.example", "127.0.0.1");

    h.s2s
        .listen(&mut h.m, "127.0.0.1".parse().unwrap())
        .unwrap();

    // An incoming connection shows up and opens its stream.
    let mut inbound = TcpStream::connect(("127.0.0.1", in_port)).unwrap();
    inbound.set_nonblocking(true).unwrap();
    let created = h.created.clone();
    h.spin("incoming codec", |_| !created.borrow().is_empty());
    let in_script = h.created.borrow()[0].clone();
    assert!(
        in_script.borrow().open.is_none(),
        "incoming codecs have no open params"
    );
    push_event(
        &in_script,
        StreamEvent::Opened {
            id: "in42".to_owned(),
            version: Some("1.0".to_owned()),
        },
    );
    nudge(&mut inbound);
    let mut stream_registered = false;
    h.spin("stream registration", |s2s| {
        while let Some(event) = s2s.poll_inbound_event() {
            if matches!(event, InEvent::Opened { .. }) {
                stream_registered = true;
            }
        }
        stream_registered
    });

    // Outbound side comes up, carrying the verify answer.
    h.s2s.out_packet(&mut h.m, packet("hi")).unwrap();
    let mut peer = h.expect_connect(&peers);
    let out_script = {
        let created = h.created.borrow();
        created[created.len() - 1].clone()
    };
    push_event(&out_script, opened("stream1"));
    nudge(&mut peer);
    h.spin("outbound online", |_| written_len(&out_script) >= 1);

    // The remote confirms the incoming stream's key.
    push_event(
        &out_script,
        StreamEvent::Packet(
            Element::builder("verify", stanza::NS_DIALBACK)
                .attr("from", "b.example")
                .attr("to", "a.example")
                .attr("id", "in42")
                .attr("type", "valid")
                .build(),
        ),
    );
    nudge(&mut peer);
    h.spin("verify answer", |_| written_len(&in_script) >= 1);

    let s = in_script.borrow();
    let result = &s.written[0];
    assert_eq!(result.name(), "result");
    assert_eq!(result.ns(), stanza::NS_DIALBACK);
    assert_eq!(result.attr("from"), Some("a.example"));
    assert_eq!(result.attr("to"), Some("b.example"));
    assert_eq!(result.attr("type"), Some("valid"));
}

#[test]
fn starttls_is_taken_when_offered() {
    let (peers, port) = listener();
    let mut h = harness(|cfg| cfg.tls_available = true);
    h.dns
        .add_srv("_xmpp-server._tcp.b.example", 10, 20, port, "x.b.example");
    h.dns.add_a("x.b.example", "127.0.0.1");

    h.s2s.out_packet(&mut h.m, packet("hi")).unwrap();

    let mut peer = h.expect_connect(&peers);
    let script = h.created.borrow()[0].clone();
    script.borrow_mut().starttls_accepts = true;

    // 1.0 peer: the engine waits for features instead of dialing back.
    push_event(
        &script,
        StreamEvent::Opened {
            id: "stream1".to_owned(),
            version: Some("1.0".to_owned()),
        },
    );
    nudge(&mut peer);
    for _ in 0..3 {
        h.m.run(&mut h.s2s, Some(Duration::from_millis(20)))
            .unwrap();
    }
    assert_eq!(written_len(&script), 0, "no dialback before features");

    // Features offering STARTTLS: consumed, still not online.
    push_event(
        &script,
        StreamEvent::Packet(
            Element::builder("features", stanza::NS_STREAMS)
                .append(Node::Element(
                    Element::builder("starttls", stanza::NS_TLS).build(),
                ))
                .build(),
        ),
    );
    nudge(&mut peer);
    h.spin("starttls", |_| script.borrow().starttls_calls == 1);
    assert_eq!(written_len(&script), 0);

    // Post-TLS stream restart; features now come without starttls.
    push_event(
        &script,
        StreamEvent::Opened {
            id: "stream2".to_owned(),
            version: Some("1.0".to_owned()),
        },
    );
    push_event(
        &script,
        StreamEvent::Packet(Element::builder("features", stanza::NS_STREAMS).build()),
    );
    nudge(&mut peer);
    h.spin("dialback after TLS", |_| written_len(&script) >= 1);

    let s = script.borrow();
    assert_eq!(s.written[0].name(), "result");
    // The key uses the post-reset stream id.
    assert_eq!(
        s.written[0].text(),
        stanza::db_key("s3cr3t", "b.example", "stream2")
    );
}

#[test]
fn fatal_stream_errors_suppress_the_host() {
    let (peers, port) = listener();
    let mut h = harness(|_| {});
    h.dns
        .add_srv("_xmpp-server._tcp.b.example", 10, 20, port, "x.b.example");
    h.dns.add_a("x.b.example", "127.0.0.1");

    h.s2s.out_packet(&mut h.m, packet("hi")).unwrap();

    let mut peer = h.expect_connect(&peers);
    let script = h.created.borrow()[0].clone();
    push_event(&script, opened("stream1"));
    nudge(&mut peer);
    h.spin("online", |_| written_len(&script) >= 1);

    // The peer kills the stream with a fatal condition. The route retries,
    // but the only host is now suppressed, so the queue bounces.
    script.borrow_mut().fail_feed = Some(StreamError {
        condition: Some("host-unknown".to_owned()),
        text: "stream error".to_owned(),
    });
    nudge(&mut peer);
    let delivered = h.delivered.clone();
    h.spin("bounce after fatal error", |_| !delivered.borrow().is_empty());
}
