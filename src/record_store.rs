//! The record lookup boundary, an in-memory store, and the handler that answers from it.

#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    dns_message::{QueryClass, QueryType, ResourceRecord},
    error::{e_fmt, Result},
    request::{Request, RequestHandler, Response},
};
use std::{
    collections::HashMap,
    io::BufRead,
    net::{Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

/// Source of the records this server is authoritative for.
pub trait RecordStore {
    /// Returns the records of `name` matching `qclass` and `qtype`.
    ///
    /// [QueryType::Wildcard] matches every type and [QueryClass::Wildcard]
    /// every class. Lookup failures are reported as no records.
    fn lookup(&self, name: &str, qclass: QueryClass, qtype: QueryType) -> Vec<ResourceRecord>;
}

impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    fn lookup(&self, name: &str, qclass: QueryClass, qtype: QueryType) -> Vec<ResourceRecord> {
        (**self).lookup(name, qclass, qtype)
    }
}

/// Records kept in memory, indexed by lower-cased name.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: HashMap<String, Vec<ResourceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: ResourceRecord) {
        self.records
            .entry(record.name().to_ascii_lowercase())
            .or_default()
            .push(record);
    }

    pub fn len(&self) -> usize {
        self.records.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Reads records, one per line: `name qtype qclass ttl data`.
    ///
    /// `qtype` and `qclass` are numeric. Data of type 1 and 28 is an address,
    /// everything else is taken as raw text up to the end of the line.
    /// Empty lines and lines starting with `#` are skipped.
    pub fn load<R: BufRead>(reader: R) -> Result<Self> {
        let mut store = Self::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| e_fmt!("read records line {}: {}", lineno + 1, e))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record = parse_record_line(line)
                .map_err(|e| e_fmt!("records line {}: {}", lineno + 1, e))?;
            trace!("loaded record {:?}", &record);
            store.insert(record);
        }
        Ok(store)
    }
}

fn parse_record_line(line: &str) -> Result<ResourceRecord> {
    let mut rest = line;
    let name = next_field(&mut rest, "name")?;
    let qtype = QueryType::from(parse_num::<u16>(next_field(&mut rest, "qtype")?)?);
    let qclass = QueryClass::from(parse_num::<u16>(next_field(&mut rest, "qclass")?)?);
    let ttl = parse_num::<u32>(next_field(&mut rest, "ttl")?)?;
    let data = rest.trim();
    if data.is_empty() {
        return Err(e_fmt!("missing data"));
    }

    match qtype {
        QueryType::Host => {
            let addr: Ipv4Addr = data.parse().map_err(|e| e_fmt!("{}: {}", data, e))?;
            ResourceRecord::new(name, qtype, qclass, ttl, &addr.octets())
        }
        QueryType::QuadA => {
            let addr: Ipv6Addr = data.parse().map_err(|e| e_fmt!("{}: {}", data, e))?;
            ResourceRecord::new(name, qtype, qclass, ttl, &addr.octets())
        }
        _ => ResourceRecord::new(name, qtype, qclass, ttl, data.as_bytes()),
    }
}

/// Splits off the next whitespace separated field of `rest`.
fn next_field<'a>(rest: &mut &'a str, what: &str) -> Result<&'a str> {
    let s: &'a str = (*rest).trim_start();
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    if end == 0 {
        return Err(e_fmt!("missing {}", what));
    }
    let (field, tail) = s.split_at(end);
    *rest = tail;
    Ok(field)
}

fn parse_num<T: std::str::FromStr>(field: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    field
        .parse()
        .map_err(|e| e_fmt!("bad number {}: {}", field, e))
}

impl RecordStore for MemoryStore {
    fn lookup(&self, name: &str, qclass: QueryClass, qtype: QueryType) -> Vec<ResourceRecord> {
        let key = name.trim_end_matches('.').to_ascii_lowercase();
        let records = match self.records.get(&key) {
            Some(records) => records,
            None => return Vec::new(),
        };

        records
            .iter()
            .filter(|r| qtype == QueryType::Wildcard || r.qtype() == qtype)
            .filter(|r| qclass == QueryClass::Wildcard || r.qclass() == qclass)
            .cloned()
            .collect()
    }
}

/// Answers every question from a [RecordStore].
#[derive(Debug, Clone)]
pub struct Authority<S> {
    store: S,
}

impl<S: RecordStore> Authority<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: RecordStore> RequestHandler for Authority<S> {
    fn on_request(&mut self, request: &Request) -> Option<Response> {
        let query = request.message();
        if query.is_response {
            debug!("ignore a response from {}", request.origin().peer());
            return None;
        }

        let mut response = Response::from_request(request);
        let message = response.message_mut();
        message.is_authoritative = true;

        for question in query.questions.iter() {
            let answers = self
                .store
                .lookup(question.name(), question.qclass(), question.qtype());
            debug!(
                "question {} {} {}: {} answers",
                question.name(),
                question.qclass(),
                question.qtype(),
                answers.len()
            );
            message.answers.extend(answers);
        }

        Some(response)
    }
}
