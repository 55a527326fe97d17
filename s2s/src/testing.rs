//! Test doubles for the codec and router seams, shared by the unit and
//! integration suites.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use minidom::Element;

use crate::stream::{CodecFactory, RouterSink, StreamCodec, StreamError, StreamEvent, StreamOpen};

/// Shared state behind a [`ScriptedCodec`]: the test pushes events in and
/// inspects what the engine wrote.
#[derive(Default)]
pub struct Script {
    /// Events handed to the engine on the next drain.
    pub events: VecDeque<StreamEvent>,
    /// Elements the engine wrote, in order.
    pub written: Vec<Element>,
    pub raw_written: Vec<Vec<u8>>,
    /// Stream errors the engine raised.
    pub errors: Vec<(String, String)>,
    /// Raw bytes fed from the wire.
    pub fed: Vec<u8>,
    pub stream_id: Option<String>,
    pub remote_version: Option<String>,
    pub secure: bool,
    pub starttls_accepts: bool,
    pub starttls_calls: usize,
    pub closed: bool,
    /// The open parameters the engine used, for outbound codecs.
    pub open: Option<StreamOpen>,
    /// Makes the next `feed` fail with this stream error.
    pub fail_feed: Option<StreamError>,
}

pub type ScriptHandle = Rc<RefCell<Script>>;

pub fn script() -> ScriptHandle {
    Rc::new(RefCell::new(Script::default()))
}

/// A codec whose behaviour is driven entirely by its [`Script`]. Fed bytes
/// are recorded, not parsed; the test decides which events surface.
pub struct ScriptedCodec {
    script: ScriptHandle,
    outbuf: Vec<u8>,
}

impl ScriptedCodec {
    pub fn new(script: ScriptHandle) -> Self {
        Self {
            script,
            outbuf: Vec::new(),
        }
    }
}

impl StreamCodec for ScriptedCodec {
    fn stream_id(&self) -> Option<String> {
        self.script.borrow().stream_id.clone()
    }

    fn remote_version(&self) -> Option<String> {
        self.script.borrow().remote_version.clone()
    }

    fn is_secure(&self) -> bool {
        self.script.borrow().secure
    }

    fn starttls(&mut self) -> bool {
        let mut script = self.script.borrow_mut();
        script.starttls_calls += 1;
        if script.starttls_accepts {
            script.secure = true;
            self.outbuf.extend_from_slice(b"<starttls/>");
            true
        } else {
            false
        }
    }

    fn feed(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        let mut script = self.script.borrow_mut();
        script.fed.extend_from_slice(bytes);
        match script.fail_feed.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn poll_event(&mut self) -> Option<StreamEvent> {
        let mut script = self.script.borrow_mut();
        let event = script.events.pop_front();
        if let Some(StreamEvent::Opened { id, version }) = &event {
            script.stream_id = Some(id.clone());
            script.remote_version = version.clone();
        }
        event
    }

    fn write(&mut self, element: Element) {
        let _ = element.write_to(&mut self.outbuf);
        self.script.borrow_mut().written.push(element);
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        self.outbuf.extend_from_slice(bytes);
        self.script.borrow_mut().raw_written.push(bytes.to_vec());
    }

    fn pending_write(&mut self) -> Option<&[u8]> {
        if self.outbuf.is_empty() {
            None
        } else {
            Some(&self.outbuf)
        }
    }

    fn consume_write(&mut self, n: usize) {
        self.outbuf.drain(..n);
    }

    fn stream_error(&mut self, condition: &str, text: &str) {
        self.outbuf.extend_from_slice(b"<stream:error/>");
        self.script
            .borrow_mut()
            .errors
            .push((condition.to_owned(), text.to_owned()));
    }

    fn close(&mut self) {
        self.script.borrow_mut().closed = true;
    }

    fn is_closing(&self) -> bool {
        self.script.borrow().closed
    }
}

/// Hands queued scripts to new codecs, or fresh ones when the queue runs
/// dry; every handle is retained in `created` for inspection.
#[derive(Default)]
pub struct ScriptFactory {
    pub queued: Rc<RefCell<VecDeque<ScriptHandle>>>,
    pub created: Rc<RefCell<Vec<ScriptHandle>>>,
}

impl ScriptFactory {
    /// The factory itself moves into the engine; these handles stay with
    /// the test.
    pub fn handles(
        &self,
    ) -> (
        Rc<RefCell<VecDeque<ScriptHandle>>>,
        Rc<RefCell<Vec<ScriptHandle>>>,
    ) {
        (self.queued.clone(), self.created.clone())
    }

    fn next(&mut self, open: Option<StreamOpen>) -> Box<dyn StreamCodec> {
        let handle = self
            .queued
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(script);
        handle.borrow_mut().open = open;
        self.created.borrow_mut().push(handle.clone());
        Box::new(ScriptedCodec::new(handle))
    }
}

impl CodecFactory for ScriptFactory {
    fn outbound(&mut self, open: StreamOpen) -> Box<dyn StreamCodec> {
        self.next(Some(open))
    }

    fn inbound(&mut self) -> Box<dyn StreamCodec> {
        self.next(None)
    }
}

/// Captures everything the engine bounces back towards the router.
#[derive(Default, Clone)]
pub struct VecRouter {
    pub delivered: Rc<RefCell<Vec<Element>>>,
}

impl RouterSink for VecRouter {
    fn deliver(&mut self, stanza: Element) {
        self.delivered.borrow_mut().push(stanza);
    }
}
