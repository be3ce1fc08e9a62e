//! Record reader

use super::errors::{CodecError, CodecResult};
use super::HEADER_LEN;

/// A single decoded record borrowing from the input buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvRecord<'a> {
    pub tlv_type: u16,
    pub value: &'a [u8],
}

/// Sequential reader over a buffer of concatenated records
#[derive(Debug, Clone)]
pub struct TlvReader<'a> {
    rest: &'a [u8],
}

impl<'a> TlvReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> &'a [u8] {
        self.rest
    }

    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn parse_header(&self) -> CodecResult<Option<(u16, usize)>> {
        if self.rest.is_empty() {
            return Ok(None);
        }
        if self.rest.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                available: self.rest.len(),
            });
        }
        let tlv_type = u16::from_be_bytes([self.rest[0], self.rest[1]]);
        let len = u16::from_be_bytes([self.rest[2], self.rest[3]]) as usize;
        if self.rest.len() < HEADER_LEN + len {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN + len,
                available: self.rest.len(),
            });
        }
        Ok(Some((tlv_type, len)))
    }

    /// Type of the next record without consuming it
    pub fn peek_type(&self) -> CodecResult<Option<u16>> {
        Ok(self.parse_header()?.map(|(t, _)| t))
    }

    /// Consume and return the next record, or `None` at end of input
    pub fn next_record(&mut self) -> CodecResult<Option<TlvRecord<'a>>> {
        let Some((tlv_type, len)) = self.parse_header()? else {
            return Ok(None);
        };
        let value = &self.rest[HEADER_LEN..HEADER_LEN + len];
        self.rest = &self.rest[HEADER_LEN + len..];
        Ok(Some(TlvRecord { tlv_type, value }))
    }

    /// Consume a record that must be of `tlv_type`
    pub fn pop(&mut self, tlv_type: u16) -> CodecResult<&'a [u8]> {
        match self.peek_type()? {
            None => Err(CodecError::Missing(tlv_type)),
            Some(actual) if actual != tlv_type => Err(CodecError::UnexpectedType {
                expected: tlv_type,
                actual,
            }),
            Some(_) => self
                .next_record()?
                .map(|r| r.value)
                .ok_or(CodecError::Missing(tlv_type)),
        }
    }

    /// Consume the next record only if it is of `tlv_type`
    pub fn pop_maybe(&mut self, tlv_type: u16) -> CodecResult<Option<&'a [u8]>> {
        if self.peek_type()? == Some(tlv_type) {
            Ok(self.next_record()?.map(|r| r.value))
        } else {
            Ok(None)
        }
    }

    /// Consume every consecutive record of `tlv_type`
    pub fn pop_all(&mut self, tlv_type: u16) -> CodecResult<Vec<&'a [u8]>> {
        let mut values = Vec::new();
        while let Some(value) = self.pop_maybe(tlv_type)? {
            values.push(value);
        }
        Ok(values)
    }

    /// Consume a record of `tlv_type` holding a big-endian u16
    pub fn pop_u16(&mut self, tlv_type: u16) -> CodecResult<u16> {
        let value = self.pop(tlv_type)?;
        let raw: [u8; 2] = value.try_into().map_err(|_| CodecError::InvalidValue {
            tlv_type,
            reason: format!("expected 2 bytes, got {}", value.len()),
        })?;
        Ok(u16::from_be_bytes(raw))
    }

    /// Skip records until one of `tlv_type` is next, then consume it
    ///
    /// Used by readers that only care about a few fields of a packet.
    pub fn seek(&mut self, tlv_type: u16) -> CodecResult<Option<&'a [u8]>> {
        while let Some(t) = self.peek_type()? {
            if t == tlv_type {
                return Ok(self.next_record()?.map(|r| r.value));
            }
            self.next_record()?;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_codec::TlvWriter;

    fn sample() -> Vec<u8> {
        let mut writer = TlvWriter::new();
        writer.put(1, b"one").unwrap();
        writer.put(2, b"a").unwrap();
        writer.put(2, b"b").unwrap();
        writer.put_u16(3, 0x01ab).unwrap();
        writer.finish()
    }

    #[test]
    fn test_sequential_pops() {
        let data = sample();
        let mut reader = TlvReader::new(&data);
        assert_eq!(reader.pop(1).unwrap(), b"one");
        assert_eq!(reader.pop_all(2).unwrap(), vec![b"a".as_slice(), b"b".as_slice()]);
        assert_eq!(reader.pop_maybe(9).unwrap(), None);
        assert_eq!(reader.pop_u16(3).unwrap(), 0x01ab);
        assert!(reader.is_empty());
        assert_eq!(reader.pop(1).unwrap_err(), CodecError::Missing(1));
    }

    #[test]
    fn test_pop_wrong_type() {
        let data = sample();
        let mut reader = TlvReader::new(&data);
        assert_eq!(
            reader.pop(2).unwrap_err(),
            CodecError::UnexpectedType { expected: 2, actual: 1 }
        );
        // a failed pop does not consume
        assert_eq!(reader.pop(1).unwrap(), b"one");
    }

    #[test]
    fn test_truncated_value() {
        let mut data = sample();
        data.truncate(5);
        let mut reader = TlvReader::new(&data);
        assert!(matches!(reader.pop(1), Err(CodecError::Truncated { needed: 7, available: 5 })));
    }

    #[test]
    fn test_seek_skips_records() {
        let data = sample();
        let mut reader = TlvReader::new(&data);
        assert_eq!(reader.seek(3).unwrap(), Some([0x01, 0xab].as_slice()));
        assert_eq!(reader.seek(1).unwrap(), None);
    }
}
