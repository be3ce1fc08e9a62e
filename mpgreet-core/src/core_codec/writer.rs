//! Record writer

use super::errors::{CodecError, CodecResult};
use super::MAX_VALUE_LEN;

/// Accumulates records into a byte buffer
#[derive(Debug, Default, Clone)]
pub struct TlvWriter {
    buf: Vec<u8>,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record
    ///
    /// # Errors
    ///
    /// Returns `CodecError::ValueTooLarge` if `value` does not fit the
    /// 16-bit length field.
    pub fn put(&mut self, tlv_type: u16, value: &[u8]) -> CodecResult<&mut Self> {
        if value.len() > MAX_VALUE_LEN {
            return Err(CodecError::ValueTooLarge(value.len()));
        }
        self.buf.extend_from_slice(&tlv_type.to_be_bytes());
        self.buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value);
        Ok(self)
    }

    /// Append a record whose value is a big-endian u16
    pub fn put_u16(&mut self, tlv_type: u16, value: u16) -> CodecResult<&mut Self> {
        self.put(tlv_type, &value.to_be_bytes())
    }

    /// Append one record per item, in order
    pub fn put_all<'a, I>(&mut self, tlv_type: u16, values: I) -> CodecResult<&mut Self>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        for value in values {
            self.put(tlv_type, value)?;
        }
        Ok(self)
    }

    /// Append already-encoded records verbatim
    pub fn put_raw(&mut self, encoded: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(encoded);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_layout() {
        let mut writer = TlvWriter::new();
        writer.put(0x0102, b"hi").unwrap();
        assert_eq!(writer.finish(), vec![0x01, 0x02, 0x00, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_put_empty_value() {
        let mut writer = TlvWriter::new();
        writer.put(0x0007, &[]).unwrap();
        assert_eq!(writer.as_bytes(), &[0x00, 0x07, 0x00, 0x00]);
    }

    #[test]
    fn test_value_too_large() {
        let mut writer = TlvWriter::new();
        let big = vec![0u8; MAX_VALUE_LEN + 1];
        assert_eq!(
            writer.put(1, &big).unwrap_err(),
            CodecError::ValueTooLarge(MAX_VALUE_LEN + 1)
        );
        assert!(writer.is_empty());
    }
}
