//! DNS message decoding and encoding.
//!
//! [Message::parse] turns untrusted bytes into a [Message], reading through a
//! bounds-checked [WireCursor]. [Message::encode] writes a [Message] into a
//! [Rope] and flattens it once at the end.

#[cfg(feature = "logging")]
use crate::log::trace;
use crate::{
    buffer::Buffer,
    dns_message::{Message, QueryClass, QueryType, Question, ResourceRecord},
    error::{Error, Result},
    label::{encode_label, read_label},
    rope::Rope,
};
use std::convert::TryFrom;

pub(crate) const MSG_HEADER_LEN: usize = 12;

/// Max length of one TXT character-string.
const MAX_TXT_CHUNK: usize = 255;

/// A read position in an immutable byte slice.
///
/// Every read is bounds-checked and fails with [Error::BodyTooShort] instead
/// of reading past the end.
#[derive(Debug, Clone)]
pub(crate) struct WireCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> WireCursor<'a> {
    pub(crate) const fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub(crate) const fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) const fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub(crate) fn pop_byte(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.offset).ok_or(Error::BodyTooShort)?;
        self.offset += 1;
        Ok(byte)
    }

    pub(crate) fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        if length > self.remaining() {
            return Err(Error::BodyTooShort);
        }
        let bytes = &self.data[self.offset..self.offset + length];
        self.offset += length;
        Ok(bytes)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl Message {
    /// Decodes `data` as one complete DNS message.
    ///
    /// Stops at the first problem: a short header or section is
    /// [Error::BodyTooShort], an overlong name is [Error::LabelTooLong], and
    /// bytes left over after the declared sections are [Error::ExtraBody].
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = WireCursor::new(data);

        /*
        RFC 1035 section 4.1: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1

            +---------------------+
            |        Header       |
            +---------------------+
            |       Question      | the question for the name server
            +---------------------+
            |        Answer       | RRs answering the question
            +---------------------+
            |      Authority      | RRs pointing toward an authority
            +---------------------+
            |      Additional     | RRs holding additional information
            +---------------------+
        */
        if data.len() < MSG_HEADER_LEN {
            return Err(Error::BodyTooShort);
        }
        let mut msg = Self::new(cursor.read_u16()?);
        msg.set_flags(cursor.read_u16()?);
        let num_questions = cursor.read_u16()?;
        let num_answers = cursor.read_u16()?;
        let num_nameservers = cursor.read_u16()?;
        let num_additional = cursor.read_u16()?;

        trace!(
            "parse header: id {}, {} questions {} answers {} nameservers {} additional",
            msg.id,
            num_questions,
            num_answers,
            num_nameservers,
            num_additional
        );

        for _ in 0..num_questions {
            msg.questions.push(read_question(&mut cursor)?);
        }
        msg.answers = read_records(&mut cursor, num_answers)?;
        msg.nameservers = read_records(&mut cursor, num_nameservers)?;
        msg.additional = read_records(&mut cursor, num_additional)?;

        if cursor.remaining() > 0 {
            trace!("parse: {} extra bytes after the last section", cursor.remaining());
            return Err(Error::ExtraBody);
        }

        Ok(msg)
    }

    /// Encodes `self` into its wire form.
    ///
    /// Section counts are taken from the current list lengths. Names are
    /// written as literal labels, and TTL is always written as 0.
    pub fn encode(&self) -> Result<Buffer> {
        let mut rope = Rope::new();

        // RFC 1035 section 4.1.1
        //
        //                                  1  1  1  1  1  1
        //    0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
        //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        //    |                      ID                       |
        //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        //    |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
        //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        //    |                    QDCOUNT                    |
        //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        //    |                    ANCOUNT                    |
        //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        //    |                    NSCOUNT                    |
        //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        //    |                    ARCOUNT                    |
        //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        rope.append_u16(self.id)?;
        rope.append_u16(self.flags())?;
        rope.append_u16(section_count(self.questions.len())?)?;
        rope.append_u16(section_count(self.answers.len())?)?;
        rope.append_u16(section_count(self.nameservers.len())?)?;
        rope.append_u16(section_count(self.additional.len())?)?;

        for question in self.questions.iter() {
            write_question(&mut rope, question)?;
        }

        for record in self
            .answers
            .iter()
            .chain(self.nameservers.iter())
            .chain(self.additional.iter())
        {
            write_record(&mut rope, record)?;
        }

        trace!("encoded message id {} into {} bytes", self.id, rope.len());
        rope.flatten()
    }
}

fn section_count(len: usize) -> Result<u16> {
    u16::try_from(len)
        .map_err(|_| Error::GeneralFailure(format!("{} entries do not fit in one section", len)))
}

fn read_question(cursor: &mut WireCursor<'_>) -> Result<Question> {
    let name = read_label(cursor)?;
    let qtype = QueryType::from(cursor.read_u16()?);
    let qclass = QueryClass::from(cursor.read_u16()?);
    trace!("read question {} {} {}", name, qtype, qclass);
    Ok(Question {
        name,
        qtype,
        qclass,
    })
}

/// Decodes `count` resource records.
//
// RFC 1035: https://datatracker.ietf.org/doc/html/rfc1035#section-3.2.1
//
// 0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
// /                      NAME                     /
// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
// |                      TYPE                     |
// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
// |                     CLASS                     |
// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
// |                      TTL                      |
// |                                               |
// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
// |                   RDLENGTH                    |
// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--|
// /                     RDATA                     /
// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
fn read_records(cursor: &mut WireCursor<'_>, count: u16) -> Result<Vec<ResourceRecord>> {
    let mut records = Vec::new();

    for _ in 0..count {
        let name = read_label(cursor)?;
        let qtype = QueryType::from(cursor.read_u16()?);
        let qclass = QueryClass::from(cursor.read_u16()?);
        let ttl = cursor.read_u32()?;
        let rdata_len = cursor.read_u16()? as usize;
        let rdata = cursor.read_bytes(rdata_len)?;

        let data = match qtype {
            QueryType::Txt => read_txt_chunks(rdata)?,
            _ => Buffer::from_slice(rdata)?,
        };

        trace!("read record {} {} {} rdata {} bytes", name, qtype, qclass, rdata_len);
        records.push(ResourceRecord {
            name,
            qtype,
            qclass,
            ttl,
            data,
        });
    }

    Ok(records)
}

/// Joins the character-strings of TXT rdata back into one text.
fn read_txt_chunks(rdata: &[u8]) -> Result<Buffer> {
    let mut cursor = WireCursor::new(rdata);
    let mut text = Rope::new();
    while cursor.remaining() > 0 {
        let length = cursor.pop_byte()? as usize;
        text.append_bytes(cursor.read_bytes(length)?)?;
    }
    text.flatten()
}

/// Splits `text` into character-strings of at most 255 bytes, each prefixed
/// by its own length byte.
pub(crate) fn txt_chunks(text: &[u8]) -> Result<Buffer> {
    let mut out = Buffer::empty(text.len() + (text.len() + MAX_TXT_CHUNK - 1) / MAX_TXT_CHUNK)?;
    let data = out.data_mut();
    let mut written = 0;
    for chunk in text.chunks(MAX_TXT_CHUNK) {
        data[written] = chunk.len() as u8;
        data[written + 1..written + 1 + chunk.len()].copy_from_slice(chunk);
        written += 1 + chunk.len();
    }
    Ok(out)
}

fn write_question(rope: &mut Rope, question: &Question) -> Result<()> {
    rope.push_buffer(encode_label(&question.name)?);
    rope.append_u16(question.qtype.into())?;
    rope.append_u16(question.qclass.into())
}

fn write_record(rope: &mut Rope, record: &ResourceRecord) -> Result<()> {
    rope.push_buffer(encode_label(&record.name)?);
    rope.append_u16(record.qtype.into())?;
    rope.append_u16(record.qclass.into())?;
    rope.append_u32(0)?;

    let rdata = match record.qtype {
        QueryType::Txt => txt_chunks(record.data.data())?,
        _ => record.data.copy()?,
    };
    let rdata_len = u16::try_from(rdata.len()).map_err(|_| {
        Error::GeneralFailure(format!(
            "rdata of {} is {} bytes, too long for one record",
            record.name,
            rdata.len()
        ))
    })?;
    rope.append_u16(rdata_len)?;
    rope.push_buffer(rdata);
    Ok(())
}
