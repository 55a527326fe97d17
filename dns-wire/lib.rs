//! DNS wire format for the resolver driver: query construction, response
//! parsing with typed access to SRV and address records, and record
//! builders for test fixtures.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::net::IpAddr;
use std::time::Duration;

use domain::base::iana::Class;
use domain::base::message_builder::AnswerBuilder;
use domain::base::name::FlattenInto;
use domain::base::{Message, MessageBuilder, ParsedName, Question};
use domain::dep::octseq::OctetsInto;
use domain::rdata::AllRecordData;

pub type RecordType = domain::base::iana::Rtype;
pub type ResponseCode = domain::base::iana::Rcode;

pub type DomainName = domain::base::Name<Vec<u8>>;
pub type Record<'a> =
    domain::base::Record<ParsedName<&'a [u8]>, AllRecordData<&'a [u8], ParsedName<&'a [u8]>>>;

pub type OwnedRecord = domain::base::Record<DomainName, AllRecordData<Vec<u8>, DomainName>>;
pub type OwnedRecordData = AllRecordData<Vec<u8>, DomainName>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("byte slice is too short to contain a message")]
    TooShort,
    #[error("DNS message is not a query")]
    NotAQuery,
    #[error("DNS message is not a response")]
    NotAResponse,
    #[error(transparent)]
    Parse(#[from] domain::base::wire::ParseError),
}

/// A single-question DNS query.
#[derive(Clone)]
pub struct Query {
    inner: Message<Vec<u8>>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("qid", &self.inner.header().id())
            .field("type", &self.qtype())
            .field("domain", &self.domain())
            .finish()
    }
}

impl Query {
    pub fn new(domain: DomainName, rtype: RecordType) -> Self {
        let mut inner = MessageBuilder::new_vec().question();
        inner.header_mut().set_qr(false);
        inner.header_mut().set_rd(true);
        inner.header_mut().set_random_id();

        inner
            .push((domain, rtype))
            .expect("Vec-backed message builder never fails");

        Self {
            inner: inner.into_message(),
        }
    }

    /// Parses a query off the wire. Only used by test servers; the resolver
    /// proper only ever sends queries.
    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;
        if message.header().qr() {
            return Err(Error::NotAQuery);
        }
        let _ = message.sole_question()?;

        Ok(Self {
            inner: message.octets_into(),
        })
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.inner.header_mut().set_id(id);
        self
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    pub fn domain(&self) -> DomainName {
        self.question().into_qname().flatten_into()
    }

    pub fn qtype(&self) -> RecordType {
        self.question().qtype()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_slice()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_octets()
    }

    fn question(&self) -> Question<ParsedName<&[u8]>> {
        self.inner.sole_question().expect("verified in ctor")
    }
}

/// An SRV record pulled out of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    /// Target host name, without the trailing dot.
    pub target: String,
    pub ttl: Duration,
}

/// A single-question DNS response.
pub struct Response {
    inner: Message<Vec<u8>>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("qid", &self.inner.header().id())
            .field("domain", &self.domain())
            .field("type", &self.qtype())
            .field("response_code", &self.response_code())
            .finish_non_exhaustive()
    }
}

impl Response {
    /// Parses a response header and question. Unlike the sending side, the
    /// record walk is lenient: broken records are skipped during iteration
    /// rather than failing the whole message, since we have no control over
    /// what upstream servers emit.
    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;
        if !message.header().qr() {
            return Err(Error::NotAResponse);
        }
        let _ = message.sole_question()?;

        Ok(Self {
            inner: message.octets_into(),
        })
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    pub fn truncated(&self) -> bool {
        self.inner.header().tc()
    }

    pub fn domain(&self) -> DomainName {
        self.question().into_qname().flatten_into()
    }

    pub fn qtype(&self) -> RecordType {
        self.question().qtype()
    }

    pub fn response_code(&self) -> ResponseCode {
        self.inner.header().rcode()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_slice()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_octets()
    }

    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        self.inner
            .answer()
            .into_iter()
            .flatten()
            .filter_map(|record| {
                record
                    .and_then(|r| r.into_any_record::<AllRecordData<_, _>>())
                    .map_err(|e| tracing::warn!("skipping malformed record: {e}"))
                    .ok()
            })
    }

    /// All IN-class SRV records in the answer section.
    pub fn srv_records(&self) -> impl Iterator<Item = SrvRecord> + '_ {
        self.records().filter_map(|r| {
            if r.class() != Class::IN {
                return None;
            }
            let ttl = r.ttl().into_duration();
            match r.data() {
                AllRecordData::Srv(srv) => Some(SrvRecord {
                    priority: srv.priority(),
                    weight: srv.weight(),
                    port: srv.port(),
                    target: srv.target().to_string().trim_end_matches('.').to_owned(),
                    ttl,
                }),
                _ => None,
            }
        })
    }

    /// All IN-class A/AAAA addresses in the answer section, with their TTLs.
    pub fn addresses(&self) -> impl Iterator<Item = (IpAddr, Duration)> + '_ {
        self.records().filter_map(|r| {
            if r.class() != Class::IN {
                return None;
            }
            let ttl = r.ttl().into_duration();
            match r.data() {
                AllRecordData::A(a) => Some((IpAddr::V4(a.addr()), ttl)),
                AllRecordData::Aaaa(aaaa) => Some((IpAddr::V6(aaaa.addr()), ttl)),
                _ => None,
            }
        })
    }

    fn question(&self) -> Question<ParsedName<&[u8]>> {
        self.inner.sole_question().expect("verified in ctor")
    }
}

/// Builds responses for a given query. Test servers use this; so do the
/// integration suites of the crates above.
pub struct ResponseBuilder {
    inner: AnswerBuilder<Vec<u8>>,
}

impl ResponseBuilder {
    pub fn for_query(query: &Query, code: ResponseCode) -> Self {
        let inner = MessageBuilder::new_vec()
            .start_answer(&query.inner, code)
            .expect("Vec-backed message builder never fails");

        Self { inner }
    }

    pub fn with_records(mut self, records: impl IntoIterator<Item: Into<OwnedRecord>>) -> Self {
        for record in records {
            self.inner
                .push(record.into())
                .expect("Vec-backed message builder never fails");
        }
        self
    }

    pub fn build(self) -> Response {
        Response {
            inner: self.inner.into_message(),
        }
    }
}

pub mod records {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use domain::base::iana::Class;
    use domain::base::{Record, Ttl};
    use domain::rdata::{A, Aaaa, Srv};

    use super::{DomainName, OwnedRecord, OwnedRecordData};

    pub fn srv(
        owner: DomainName,
        ttl: u32,
        priority: u16,
        weight: u16,
        port: u16,
        target: DomainName,
    ) -> OwnedRecord {
        Record::new(
            owner,
            Class::IN,
            Ttl::from_secs(ttl),
            OwnedRecordData::Srv(Srv::new(priority, weight, port, target)),
        )
    }

    pub fn a(owner: DomainName, ttl: u32, ip: Ipv4Addr) -> OwnedRecord {
        Record::new(
            owner,
            Class::IN,
            Ttl::from_secs(ttl),
            OwnedRecordData::A(A::new(ip)),
        )
    }

    pub fn aaaa(owner: DomainName, ttl: u32, ip: Ipv6Addr) -> OwnedRecord {
        Record::new(
            owner,
            Class::IN,
            Ttl::from_secs(ttl),
            OwnedRecordData::Aaaa(Aaaa::new(ip)),
        )
    }
}
