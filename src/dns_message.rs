//! In-memory representation of a DNS message.

use crate::{
    buffer::Buffer,
    error::Result,
    label::validate_name,
};
use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

/// DNS query and record types understood by this server.
///
/// Records whose type is <= 16 are described in
/// [RFC 1035 section 3.2.2](https://datatracker.ietf.org/doc/html/rfc1035#section-3.2.2).
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum QueryType {
    /// IPv4 host address (A)
    Host,

    /// Authoritative name server (NS)
    NameServer,

    /// Canonical name (CNAME)
    CName,

    /// Start of authority (SOA)
    Soa,

    /// Domain name pointer (PTR)
    Pointer,

    /// Mail exchange (MX)
    Mail,

    /// Text strings (TXT)
    Txt,

    /// IPv6 host address (AAAA), RFC 3596
    QuadA,

    /// Any type, only valid in questions.
    Wildcard,

    /// A value this server has no name for.
    Unknown(u16),
}

impl From<u16> for QueryType {
    fn from(value: u16) -> Self {
        match value {
            1 => Self::Host,
            2 => Self::NameServer,
            5 => Self::CName,
            6 => Self::Soa,
            12 => Self::Pointer,
            15 => Self::Mail,
            16 => Self::Txt,
            28 => Self::QuadA,
            255 => Self::Wildcard,
            other => Self::Unknown(other),
        }
    }
}

impl From<QueryType> for u16 {
    fn from(qtype: QueryType) -> Self {
        match qtype {
            QueryType::Host => 1,
            QueryType::NameServer => 2,
            QueryType::CName => 5,
            QueryType::Soa => 6,
            QueryType::Pointer => 12,
            QueryType::Mail => 15,
            QueryType::Txt => 16,
            QueryType::QuadA => 28,
            QueryType::Wildcard => 255,
            QueryType::Unknown(other) => other,
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "A"),
            Self::NameServer => write!(f, "NS"),
            Self::CName => write!(f, "CNAME"),
            Self::Soa => write!(f, "SOA"),
            Self::Pointer => write!(f, "PTR"),
            Self::Mail => write!(f, "MX"),
            Self::Txt => write!(f, "TXT"),
            Self::QuadA => write!(f, "AAAA"),
            Self::Wildcard => write!(f, "ANY"),
            Self::Unknown(v) => write!(f, "TYPE{}", v),
        }
    }
}

/// DNS classes. Other classes aren't important, see RFC 1035 section 3.2.4.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum QueryClass {
    Internet,
    Wildcard,
    Unknown(u16),
}

impl From<u16> for QueryClass {
    fn from(value: u16) -> Self {
        match value {
            1 => Self::Internet,
            255 => Self::Wildcard,
            other => Self::Unknown(other),
        }
    }
}

impl From<QueryClass> for u16 {
    fn from(qclass: QueryClass) -> Self {
        match qclass {
            QueryClass::Internet => 1,
            QueryClass::Wildcard => 255,
            QueryClass::Unknown(other) => other,
        }
    }
}

impl fmt::Display for QueryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internet => write!(f, "IN"),
            Self::Wildcard => write!(f, "ANY"),
            Self::Unknown(v) => write!(f, "CLASS{}", v),
        }
    }
}

/// A DNS question entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub(crate) name: String,
    pub(crate) qtype: QueryType,
    pub(crate) qclass: QueryClass,
}

impl Question {
    pub fn new(name: &str, qtype: QueryType, qclass: QueryClass) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.trim_end_matches('.').to_string(),
            qtype,
            qclass,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn qtype(&self) -> QueryType {
        self.qtype
    }

    pub const fn qclass(&self) -> QueryClass {
        self.qclass
    }
}

/// A DNS Resource Record.
///
/// The meaning of `data` depends on the type: raw address bytes for host
/// records, a name for CNAME, raw text for TXT. TXT text is split into
/// character-strings only when encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub(crate) name: String,
    pub(crate) qtype: QueryType,
    pub(crate) qclass: QueryClass,
    pub(crate) ttl: u32,
    pub(crate) data: Buffer,
}

impl ResourceRecord {
    pub fn new(
        name: &str,
        qtype: QueryType,
        qclass: QueryClass,
        ttl: u32,
        data: &[u8],
    ) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.trim_end_matches('.').to_string(),
            qtype,
            qclass,
            ttl,
            data: Buffer::from_slice(data)?,
        })
    }

    pub fn host(name: &str, address: Ipv4Addr, ttl: u32) -> Result<Self> {
        Self::new(
            name,
            QueryType::Host,
            QueryClass::Internet,
            ttl,
            &address.octets(),
        )
    }

    pub fn quad_a(name: &str, address: Ipv6Addr, ttl: u32) -> Result<Self> {
        Self::new(
            name,
            QueryType::QuadA,
            QueryClass::Internet,
            ttl,
            &address.octets(),
        )
    }

    pub fn cname(name: &str, target: &str, ttl: u32) -> Result<Self> {
        validate_name(target)?;
        Self::new(
            name,
            QueryType::CName,
            QueryClass::Internet,
            ttl,
            target.trim_end_matches('.').as_bytes(),
        )
    }

    pub fn txt(name: &str, text: &[u8], ttl: u32) -> Result<Self> {
        Self::new(name, QueryType::Txt, QueryClass::Internet, ttl, text)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn qtype(&self) -> QueryType {
        self.qtype
    }

    pub const fn qclass(&self) -> QueryClass {
        self.qclass
    }

    pub const fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn data(&self) -> &Buffer {
        &self.data
    }
}

// Definitions for DNS message header "flags" field
//
// The "flags" field is 16-bit long, in this format:
// (RFC 1035 section 4.1.1)
//
//   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
// |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
//
pub const FLAGS_QR_RESPONSE: u16 = 0x8000;
pub const FLAGS_AA: u16 = 0x0400;
pub const FLAGS_TC: u16 = 0x0200;
pub const FLAGS_RD: u16 = 0x0100;
pub const FLAGS_RA: u16 = 0x0080;
const OPCODE_SHIFT: u16 = 11;
const OPCODE_MASK: u16 = 0x0F;
const RCODE_MASK: u16 = 0x0F;

/// One DNS message: header fields plus four ordered sections.
///
/// Section counts are not stored; they are always the lengths of the lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,

    /// 4-bit operation code.
    pub opcode: u8,
    pub is_response: bool,
    pub is_authoritative: bool,
    pub is_truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,

    /// 4-bit response code.
    pub rcode: u8,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub nameservers: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Message {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Packs the header flags into their 16-bit wire form.
    pub fn flags(&self) -> u16 {
        let mut flags = (u16::from(self.opcode) & OPCODE_MASK) << OPCODE_SHIFT;
        flags |= u16::from(self.rcode) & RCODE_MASK;
        for (set, bit) in [
            (self.is_response, FLAGS_QR_RESPONSE),
            (self.is_authoritative, FLAGS_AA),
            (self.is_truncated, FLAGS_TC),
            (self.recursion_desired, FLAGS_RD),
            (self.recursion_available, FLAGS_RA),
        ] {
            if set {
                flags |= bit;
            }
        }
        flags
    }

    /// Unpacks the 16-bit wire form of the header flags into `self`.
    pub fn set_flags(&mut self, flags: u16) {
        self.opcode = ((flags >> OPCODE_SHIFT) & OPCODE_MASK) as u8;
        self.rcode = (flags & RCODE_MASK) as u8;
        self.is_response = flags & FLAGS_QR_RESPONSE != 0;
        self.is_authoritative = flags & FLAGS_AA != 0;
        self.is_truncated = flags & FLAGS_TC != 0;
        self.recursion_desired = flags & FLAGS_RD != 0;
        self.recursion_available = flags & FLAGS_RA != 0;
    }

    pub fn add_question(&mut self, name: &str, qtype: QueryType, qclass: QueryClass) -> Result<()> {
        self.questions.push(Question::new(name, qtype, qclass)?);
        Ok(())
    }

    pub fn add_answer(&mut self, record: ResourceRecord) {
        self.answers.push(record);
    }

    pub fn add_nameserver(&mut self, record: ResourceRecord) {
        self.nameservers.push(record);
    }

    pub fn add_additional(&mut self, record: ResourceRecord) {
        self.additional.push(record);
    }
}
