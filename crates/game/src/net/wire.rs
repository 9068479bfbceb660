use rkyv::api::high::{HighDeserializer, HighSerializer, HighValidator};
use rkyv::bytecheck::CheckBytes;
use rkyv::rancor;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;
use rkyv::Archive;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("read of {wanted} bytes past end of payload ({remaining} left)")]
    UnexpectedEnd { wanted: usize, remaining: usize },
    #[error("invalid {what} tag {tag}")]
    InvalidTag { what: &'static str, tag: u8 },
    #[error("blob of {0} bytes does not fit a u16 length prefix")]
    BlobTooLong(usize),
    #[error("archive failed: {0}")]
    Archive(rancor::Error),
}

/// Little-endian payload writer backed by a growable buffer.
#[derive(Debug, Default)]
pub struct BufferWriter {
    buf: Vec<u8>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes a `u16` length prefix followed by the bytes.
    pub fn write_blob(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let len = u16::try_from(bytes.len()).map_err(|_| WireError::BlobTooLong(bytes.len()))?;
        self.write_u16(len);
        self.write_bytes(bytes);
        Ok(())
    }

    pub fn write_archived<T>(&mut self, value: &T) -> Result<(), WireError>
    where
        T: for<'a> rkyv::Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, rancor::Error>>,
    {
        let bytes = rkyv::to_bytes::<rancor::Error>(value).map_err(WireError::Archive)?;
        self.write_blob(&bytes)
    }
}

/// Cursor over one message payload. Reads never cross the end of the slice.
#[derive(Debug, Clone)]
pub struct BufferReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError::UnexpectedEnd {
                wanted: len,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), WireError> {
        self.read_bytes(len).map(|_| ())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        self.read_array().map(f32::from_le_bytes)
    }

    pub fn read_blob(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    pub fn read_archived<T>(&mut self) -> Result<T, WireError>
    where
        T: Archive,
        T::Archived: for<'b> CheckBytes<HighValidator<'b, rancor::Error>>
            + rkyv::Deserialize<T, HighDeserializer<rancor::Error>>,
    {
        let blob = self.read_blob()?;
        // Archives need their natural alignment; payload slices have none.
        let mut aligned: AlignedVec = AlignedVec::with_capacity(blob.len());
        aligned.extend_from_slice(blob);
        rkyv::from_bytes::<T, rancor::Error>(&aligned).map_err(WireError::Archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::ServerInfo;

    #[test]
    fn reads_stop_at_end_of_payload() {
        let mut writer = BufferWriter::new();
        writer.write_u16(7);
        let bytes = writer.into_inner();

        let mut reader = BufferReader::new(&bytes);
        assert_eq!(reader.read_u16().unwrap(), 7);
        assert!(matches!(
            reader.read_u32(),
            Err(WireError::UnexpectedEnd {
                wanted: 4,
                remaining: 0
            })
        ));
    }

    #[test]
    fn archived_values_survive_unaligned_offsets() {
        let info = ServerInfo {
            name: "test server".to_string(),
            players: 3,
            max_players: 16,
        };

        let mut writer = BufferWriter::new();
        writer.write_u8(0xAB);
        writer.write_archived(&info).unwrap();
        let bytes = writer.into_inner();

        let mut reader = BufferReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 0xAB);
        let decoded: ServerInfo = reader.read_archived().unwrap();
        assert_eq!(decoded, info);
        assert!(reader.is_exhausted());
    }
}
