//! Conversion between dotted domain names and the length-prefixed label encoding.
//!
//! From RFC 1035 section 3.1:
//! "...Domain names in messages are expressed in terms of a sequence of labels.
//! Each label is represented as a one octet length field followed by that
//! number of octets.  Since every domain name ends with the null label of
//! the root, a domain name is terminated by a length byte of zero."
//!
//! Name compression is not used: names are always written as literal labels.

use crate::{
    buffer::Buffer,
    dns_parser::WireCursor,
    error::{Error, Result},
};

/// Max number of characters a decoded name may accumulate, dots included.
pub const MAX_NAME_LENGTH: usize = 256;

/// Max length of one label.
pub const MAX_LABEL_LENGTH: usize = 63;

/// Encodes `name` into labels.
///
/// Trailing dots are ignored. The name is scanned right to left so every
/// label length is known when its length byte is written. The caller is
/// trusted to pass a name accepted by [validate_name].
pub fn encode_label(name: &str) -> Result<Buffer> {
    let name = name.trim_end_matches('.').as_bytes();
    if name.is_empty() {
        return Buffer::from_slice(&[0]);
    }

    // One length byte in front, the zero terminator at the end.
    let mut out = Buffer::empty(name.len() + 2)?;
    let data = out.data_mut();
    let mut run = 0;
    for (i, &c) in name.iter().enumerate().rev() {
        if c == b'.' {
            data[i + 1] = run as u8;
            run = 0;
        } else {
            data[i + 1] = c;
            run += 1;
        }
    }
    data[0] = run as u8;

    Ok(out)
}

/// Decodes one name from the start of `data`.
///
/// Returns the name and the number of bytes it occupied.
pub fn decode_label(data: &[u8]) -> Result<(String, usize)> {
    let mut cursor = WireCursor::new(data);
    let name = read_label(&mut cursor)?;
    Ok((name, cursor.offset()))
}

/// Reads a name at the current position of `cursor`.
///
/// Fails with [Error::BodyTooShort] if the input ends before the zero
/// terminator, and with [Error::LabelTooLong] once the name grows beyond
/// [MAX_NAME_LENGTH].
pub(crate) fn read_label(cursor: &mut WireCursor<'_>) -> Result<String> {
    let mut name = NameBuilder::new();
    let mut first = true;

    loop {
        let length = cursor.pop_byte()?;
        if length == 0 {
            break;
        }

        if !first {
            name.push_char(b'.')?;
        }
        first = false;

        for _ in 0..length {
            let c = cursor.pop_byte()?;
            if c == 0 || c == b'.' {
                return Err(Error::GeneralFailure(format!(
                    "label byte 0x{:02x} at offset {} cannot be represented in a dotted name",
                    c,
                    cursor.offset() - 1
                )));
            }
            name.push_char(c)?;
        }
    }

    name.into_string()
}

/// Checks that `name` can be carried in a message and decoded back unchanged.
pub fn validate_name(name: &str) -> Result<()> {
    if name.contains('\0') {
        return Err(Error::InvalidName(format!("{:?} has an embedded NUL", name)));
    }

    let trimmed = name.trim_end_matches('.');
    if trimmed.is_empty() {
        return Ok(());
    }

    // encoded = first length byte + name + terminator
    if trimmed.len() + 2 > MAX_NAME_LENGTH {
        return Err(Error::InvalidName(format!(
            "{} is {} bytes long, max is {}",
            name,
            trimmed.len(),
            MAX_NAME_LENGTH - 2
        )));
    }

    for label in trimmed.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LENGTH {
            return Err(Error::InvalidName(format!(
                "{} has a label of {} bytes",
                name,
                label.len()
            )));
        }
    }

    Ok(())
}

/// Fixed-size scratch space a name is decoded into.
struct NameBuilder {
    buf: [u8; MAX_NAME_LENGTH],
    len: usize,
}

impl NameBuilder {
    const fn new() -> Self {
        Self {
            buf: [0; MAX_NAME_LENGTH],
            len: 0,
        }
    }

    fn push_char(&mut self, c: u8) -> Result<()> {
        if self.len >= MAX_NAME_LENGTH {
            return Err(Error::LabelTooLong);
        }
        self.buf[self.len] = c;
        self.len += 1;
        Ok(())
    }

    fn into_string(self) -> Result<String> {
        String::from_utf8(self.buf[..self.len].to_vec())
            .map_err(|e| Error::GeneralFailure(format!("name is not utf8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_label, encode_label, validate_name, MAX_LABEL_LENGTH};
    use crate::error::Error;
    use test_log::test;

    #[test]
    fn test_encode_label() {
        let encoded = encode_label("www.example.com.").unwrap();
        assert_eq!(
            encoded.data(),
            b"\x03www\x07example\x03com\x00".as_ref()
        );

        assert_eq!(encode_label("www").unwrap().data(), b"\x03www\x00".as_ref());
        assert_eq!(encode_label("").unwrap().data(), &[0]);
        assert_eq!(encode_label("...").unwrap().data(), &[0]);
    }

    #[test]
    fn test_label_inverse() {
        let long_label = "a".repeat(MAX_LABEL_LENGTH);
        let long_name = vec![long_label.as_str(); 3].join(".");
        for name in &["a", "www.example.com", "x.y.", long_name.as_str()] {
            let encoded = encode_label(name).unwrap();
            let (decoded, used) = decode_label(encoded.data()).unwrap();
            assert_eq!(decoded, name.trim_end_matches('.'));
            assert_eq!(used, encoded.len());
        }
    }

    #[test]
    fn test_decode_stops_at_terminator() {
        let (name, used) = decode_label(b"\x01a\x01b\x00\xff\xff").unwrap();
        assert_eq!(name, "a.b");
        assert_eq!(used, 5);
    }

    #[test]
    fn test_decode_truncated() {
        assert_eq!(decode_label(b"\x03ww"), Err(Error::BodyTooShort));
        assert_eq!(decode_label(b"\x03www"), Err(Error::BodyTooShort));
        assert_eq!(decode_label(b""), Err(Error::BodyTooShort));
    }

    #[test]
    fn test_decode_too_long() {
        let mut data = Vec::new();
        for _ in 0..5 {
            data.push(63);
            data.extend_from_slice(&[b'a'; 63]);
        }
        data.push(0);
        assert_eq!(decode_label(&data), Err(Error::LabelTooLong));
    }

    #[test]
    fn test_decode_rejects_dot_in_label() {
        assert!(matches!(
            decode_label(b"\x03a.b\x00"),
            Err(Error::GeneralFailure(_))
        ));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("www.example.com.").is_ok());
        assert!(validate_name("").is_ok());
        assert!(validate_name("a..b").is_err());
        assert!(validate_name("nul\0name").is_err());
        assert!(validate_name(&"a".repeat(MAX_LABEL_LENGTH + 1)).is_err());

        let too_long = vec!["abcdefg"; 40].join(".");
        assert!(validate_name(&too_long).is_err());
    }
}
