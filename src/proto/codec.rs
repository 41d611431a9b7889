//! Length-delimited binary primitives
//!
//! Every wire structure is written field by field: scalars little-endian,
//! strings with a 16-bit length prefix, byte strings with a 32-bit length
//! prefix, options with a presence byte. Decoding is strict; leftover or
//! missing bytes fail the frame.

use super::{ProtoError, ProtoResult};

/// Incremental writer for wire structures
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Start a structure with a type tag
    pub fn new(tag: u8) -> Self {
        Writer { buf: vec![tag] }
    }

    /// Start a bare structure (action payloads carry no tag of their own)
    pub fn bare() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(if value { 1 } else { 0 });
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// String with 16-bit length prefix
    pub fn put_str(&mut self, value: &str) {
        let bytes = value.as_bytes();
        self.buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(bytes);
    }

    /// Byte string with 32-bit length prefix
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value);
    }

    /// Presence byte followed by the value when present
    pub fn put_opt<T>(&mut self, value: Option<T>, put: impl FnOnce(&mut Self, T)) {
        match value {
            Some(v) => {
                self.buf.push(1);
                put(self, v);
            }
            None => self.buf.push(0),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Strict reader for wire structures
pub struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data }
    }

    fn need(&self, n: usize) -> ProtoResult<()> {
        if self.data.len() < n {
            return Err(ProtoError::Truncated);
        }
        Ok(())
    }

    pub fn take_u8(&mut self) -> ProtoResult<u8> {
        self.need(1)?;
        let value = self.data[0];
        self.data = &self.data[1..];
        Ok(value)
    }

    pub fn take_bool(&mut self) -> ProtoResult<bool> {
        match self.take_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtoError::InvalidValue(format!(
                "boolean byte {:#x}",
                other
            ))),
        }
    }

    pub fn take_u32(&mut self) -> ProtoResult<u32> {
        self.need(4)?;
        let value = u32::from_le_bytes(self.data[..4].try_into().unwrap());
        self.data = &self.data[4..];
        Ok(value)
    }

    pub fn take_str(&mut self) -> ProtoResult<String> {
        self.need(2)?;
        let len = u16::from_le_bytes(self.data[..2].try_into().unwrap()) as usize;
        self.data = &self.data[2..];
        self.need(len)?;
        let value = std::str::from_utf8(&self.data[..len])
            .map_err(|_| ProtoError::InvalidValue("non-UTF-8 string".to_string()))?
            .to_string();
        self.data = &self.data[len..];
        Ok(value)
    }

    pub fn take_bytes(&mut self) -> ProtoResult<Vec<u8>> {
        self.need(4)?;
        let len = u32::from_le_bytes(self.data[..4].try_into().unwrap()) as usize;
        self.data = &self.data[4..];
        self.need(len)?;
        let value = self.data[..len].to_vec();
        self.data = &self.data[len..];
        Ok(value)
    }

    pub fn take_opt<T>(
        &mut self,
        take: impl FnOnce(&mut Self) -> ProtoResult<T>,
    ) -> ProtoResult<Option<T>> {
        match self.take_u8()? {
            0 => Ok(None),
            1 => Ok(Some(take(self)?)),
            other => Err(ProtoError::InvalidValue(format!(
                "presence byte {:#x}",
                other
            ))),
        }
    }

    /// Fail if any bytes remain
    pub fn finish(self) -> ProtoResult<()> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(ProtoError::Trailing(self.data.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let mut w = Writer::bare();
        w.put_u8(7);
        w.put_bool(true);
        w.put_u32(123_456);
        w.put_str("digest");
        w.put_bytes(&[1, 2, 3]);
        w.put_opt(Some(9u32), |w, v| w.put_u32(v));
        w.put_opt(None::<u32>, |w, v| w.put_u32(v));
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.take_u8().unwrap(), 7);
        assert!(r.take_bool().unwrap());
        assert_eq!(r.take_u32().unwrap(), 123_456);
        assert_eq!(r.take_str().unwrap(), "digest");
        assert_eq!(r.take_bytes().unwrap(), vec![1, 2, 3]);
        assert_eq!(r.take_opt(|r| r.take_u32()).unwrap(), Some(9));
        assert_eq!(r.take_opt(|r| r.take_u32()).unwrap(), None);
        r.finish().unwrap();
    }

    #[test]
    fn test_truncated_fails() {
        let mut w = Writer::bare();
        w.put_bytes(&[1, 2, 3, 4]);
        let mut bytes = w.into_bytes();
        bytes.truncate(bytes.len() - 1);

        let mut r = Reader::new(&bytes);
        assert!(matches!(r.take_bytes(), Err(ProtoError::Truncated)));
    }

    #[test]
    fn test_trailing_fails() {
        let mut w = Writer::bare();
        w.put_u8(1);
        let mut bytes = w.into_bytes();
        bytes.push(0xAA);

        let mut r = Reader::new(&bytes);
        r.take_u8().unwrap();
        assert!(matches!(r.finish(), Err(ProtoError::Trailing(1))));
    }

    #[test]
    fn test_bad_presence_byte_fails() {
        let bytes = [2u8];
        let mut r = Reader::new(&bytes);
        assert!(r.take_opt(|r| r.take_u8()).is_err());
    }

    #[test]
    fn test_empty_string_and_bytes() {
        let mut w = Writer::bare();
        w.put_str("");
        w.put_bytes(&[]);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.take_str().unwrap(), "");
        assert_eq!(r.take_bytes().unwrap(), Vec::<u8>::new());
        r.finish().unwrap();
    }
}
