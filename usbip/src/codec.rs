use std::io;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("{record} requires {expected} bytes, got {actual}")]
    Truncated {
        record: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown {record} code {code:#06x}")]
    UnknownCode { record: &'static str, code: u32 },

    #[error("{record} length {len} exceeds limit of {max}")]
    Oversized {
        record: &'static str,
        len: usize,
        max: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FramingError {
    /// True when the peer closed the stream cleanly between records.
    pub fn is_eof(&self) -> bool {
        matches!(self, FramingError::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// A fixed-layout record whose fields are laid out on the wire in declaration order.
///
/// Multi-byte integers are big-endian. `decode` never reads past the input, a short input is a
/// [`FramingError::Truncated`].
pub trait Record: Sized {
    const NAME: &'static str;
    const LEN: usize;

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, FramingError>;

    fn write_fields(&self, fields: &mut FieldWriter<'_>);

    fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        if bytes.len() < Self::LEN {
            return Err(FramingError::Truncated {
                record: Self::NAME,
                expected: Self::LEN,
                actual: bytes.len(),
            });
        }
        Self::read_fields(&mut FieldReader::new(&bytes[..Self::LEN]))
    }

    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::LEN);
        self.encode_into(&mut bytes);
        bytes
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + Self::LEN, 0);
        self.write_fields(&mut FieldWriter::new(&mut out[start..]));
    }
}

/// Reads exactly one record from an async stream.
pub async fn read_record<T, R>(reader: &mut R) -> Result<T, FramingError>
where
    T: Record,
    R: AsyncRead + Unpin,
{
    let mut bytes = vec![0u8; T::LEN];
    reader.read_exact(&mut bytes).await?;
    T::decode(&bytes)
}

/// Reads `len` opaque bytes that follow a record, e.g. an OUT transfer buffer.
pub async fn read_payload<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(bytes)
}

/// Sequential big-endian field access over a slice already checked against [`Record::LEN`].
pub struct FieldReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        FieldReader { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> &'a [u8] {
        let field = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        field
    }

    pub fn u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    pub fn u16(&mut self) -> u16 {
        BigEndian::read_u16(self.take(2))
    }

    pub fn u32(&mut self) -> u32 {
        BigEndian::read_u32(self.take(4))
    }

    pub fn i32(&mut self) -> i32 {
        BigEndian::read_i32(self.take(4))
    }

    pub fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N));
        array
    }

    pub fn skip(&mut self, len: usize) {
        self.take(len);
    }
}

pub struct FieldWriter<'a> {
    bytes: &'a mut [u8],
    offset: usize,
}

impl<'a> FieldWriter<'a> {
    fn new(bytes: &'a mut [u8]) -> Self {
        FieldWriter { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> &mut [u8] {
        let start = self.offset;
        self.offset += len;
        &mut self.bytes[start..start + len]
    }

    pub fn u8(&mut self, value: u8) {
        self.take(1)[0] = value;
    }

    pub fn u16(&mut self, value: u16) {
        BigEndian::write_u16(self.take(2), value);
    }

    pub fn u32(&mut self, value: u32) {
        BigEndian::write_u32(self.take(4), value);
    }

    pub fn i32(&mut self, value: i32) {
        BigEndian::write_i32(self.take(4), value);
    }

    /// Copies `value` into a fixed-width field, zero padding or truncating to fit.
    pub fn bytes(&mut self, value: &[u8], width: usize) {
        let field = self.take(width);
        let len = value.len().min(width);
        field[..len].copy_from_slice(&value[..len]);
        field[len..].fill(0);
    }

    pub fn skip(&mut self, len: usize) {
        self.take(len);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pair {
        a: u16,
        b: i32,
    }

    impl Record for Pair {
        const NAME: &'static str = "Pair";
        const LEN: usize = 6;

        fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, FramingError> {
            Ok(Pair {
                a: fields.u16(),
                b: fields.i32(),
            })
        }

        fn write_fields(&self, fields: &mut FieldWriter<'_>) {
            fields.u16(self.a);
            fields.i32(self.b);
        }
    }

    #[test]
    fn encode_is_big_endian_in_field_order() {
        assert_eq!(
            Pair { a: 0x0102, b: -32 }.encode(),
            vec![0x01, 0x02, 0xff, 0xff, 0xff, 0xe0]
        );
    }

    #[test]
    fn decode_short_input_is_truncated_error() {
        assert_matches!(
            Pair::decode(&[0x01, 0x02, 0x03]),
            Err(FramingError::Truncated {
                record: "Pair",
                expected: 6,
                actual: 3
            })
        );
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        assert_eq!(
            Pair::decode(&[0, 1, 0, 0, 0, 2, 0xaa]).unwrap(),
            Pair { a: 1, b: 2 }
        );
    }

    #[test]
    fn fixed_width_bytes_are_zero_padded() {
        let mut out = vec![0xffu8; 4];
        FieldWriter::new(&mut out).bytes(b"ab", 4);
        assert_eq!(out, vec![b'a', b'b', 0, 0]);
    }

    #[tokio::test]
    async fn read_record_from_stream() {
        let mut input: &[u8] = &[0x00, 0x07, 0x00, 0x00, 0x00, 0x09];
        let pair: Pair = read_record(&mut input).await.unwrap();
        assert_eq!(pair, Pair { a: 7, b: 9 });
    }

    #[tokio::test]
    async fn read_record_eof() {
        let mut input: &[u8] = &[0x00];
        let err = read_record::<Pair, _>(&mut input).await.unwrap_err();
        assert!(err.is_eof());
    }
}
