//! On-flash record format.
//!
//! Every chunk of the partition starts with a 16-byte header, followed by the
//! key-value data and zero padding up to the end of the chunk:
//!
//! ```text
//! [0..4]   magic    0x53542a46 ("F*TS")
//! [4..8]   crc      CRC-32 over len, version and data[..len]
//! [8..12]  len      bytes of key-value data
//! [12..16] version  generation counter, highest valid one wins
//! [16..]   data     key1=value1\0key2=value2\0\0
//! ```
//!
//! All header fields are little-endian.
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};

pub const MAGIC: u32 = 0x5354_2a46;

/// Size of the record header.
pub const HDR_SIZE: usize = 16;

/// Largest chunk a record may occupy.
pub const MAX_SIZE: usize = 16 * 1024;

/// Largest amount of key-value data a record may carry.
pub const MAX_DATA_SIZE: usize = MAX_SIZE - HDR_SIZE;

const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

const MAGIC_OFFSET: usize = 0;
const CRC_OFFSET: usize = 4;
const LEN_OFFSET: usize = 8;
const VERSION_OFFSET: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CodecError {
    /// Encoding does not fit the data area.
    CapacityExceeded,
    /// Key is empty or contains `=` or `\0`, or value contains `\0`.
    InvalidKey,
    /// Data is not a well-formed key-value blob.
    Corrupt,
}

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseResult {
    /// Chunk yet to be written.
    Unset,
    /// Chunk does not contain a valid record.
    Invalid,
}

/// Fields of a record header, before the record is validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub len: usize,
    pub version: u32,
}

/// A validated record, borrowing its data from the chunk it was read from.
#[derive(Debug, PartialEq)]
pub struct Record<'a> {
    pub version: u32,
    pub data: &'a [u8],
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Checksum of a record. The magic and crc fields are not part of it.
pub fn checksum(len: u32, version: u32, data: &[u8]) -> u32 {
    let mut digest = CRC.digest();
    digest.update(&len.to_le_bytes());
    digest.update(&version.to_le_bytes());
    digest.update(data);
    digest.finalize()
}

/// Parse the header at the start of `chunk` without checking the record against it.
///
/// Used to decide whether the remainder of a chunk is worth reading.
pub fn peek(chunk: &[u8]) -> Result<Header, ParseResult> {
    if chunk.len() < HDR_SIZE {
        return Err(ParseResult::Invalid);
    }
    if chunk[..HDR_SIZE].iter().all(|b| *b == 0xff) {
        return Err(ParseResult::Unset);
    }
    if read_u32(chunk, MAGIC_OFFSET) != MAGIC {
        return Err(ParseResult::Invalid);
    }

    Ok(Header {
        len: read_u32(chunk, LEN_OFFSET) as usize,
        version: read_u32(chunk, VERSION_OFFSET),
    })
}

/// Fill in the header of `chunk`, whose data area already holds `len` bytes of encoded data.
pub fn seal(chunk: &mut [u8], version: u32, len: usize) {
    let crc = checksum(len as u32, version, &chunk[HDR_SIZE..HDR_SIZE + len]);
    write_u32(chunk, MAGIC_OFFSET, MAGIC);
    write_u32(chunk, CRC_OFFSET, crc);
    write_u32(chunk, LEN_OFFSET, len as u32);
    write_u32(chunk, VERSION_OFFSET, version);
}

/// Validate the record at the start of `chunk`.
///
/// `chunk` must at least cover the header and the data the header claims.
pub fn open(chunk: &[u8], capacity: usize) -> Result<Record<'_>, ParseResult> {
    let Header { len, version } = peek(chunk)?;
    if len > capacity || HDR_SIZE + len > chunk.len() {
        return Err(ParseResult::Invalid);
    }

    let data = &chunk[HDR_SIZE..HDR_SIZE + len];
    if read_u32(chunk, CRC_OFFSET) != checksum(len as u32, version, data) {
        return Err(ParseResult::Invalid);
    }

    Ok(Record { version, data })
}

pub fn validate_key(key: &str) -> Result<(), CodecError> {
    if key.is_empty() || key.bytes().any(|b| b == b'=' || b == 0) {
        return Err(CodecError::InvalidKey);
    }
    Ok(())
}

pub fn validate_value(value: &str) -> Result<(), CodecError> {
    if value.bytes().any(|b| b == 0) {
        return Err(CodecError::InvalidKey);
    }
    Ok(())
}

/// Encode key-value pairs into `out` and yield the encoded length.
///
/// The encoding is terminated by two consecutive zero bytes, also when there are no pairs at all.
pub fn encode<'a, I>(entries: I, out: &mut [u8]) -> Result<usize, CodecError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut pos = 0;
    for (key, value) in entries {
        validate_key(key)?;
        validate_value(value)?;

        let end = pos + key.len() + 1 + value.len() + 1;
        if end > out.len() {
            return Err(CodecError::CapacityExceeded);
        }

        out[pos..pos + key.len()].copy_from_slice(key.as_bytes());
        pos += key.len();
        out[pos] = b'=';
        pos += 1;
        out[pos..pos + value.len()].copy_from_slice(value.as_bytes());
        pos += value.len();
        out[pos] = 0;
        pos += 1;
    }

    let terminator = if pos == 0 { 2 } else { 1 };
    if pos + terminator > out.len() {
        return Err(CodecError::CapacityExceeded);
    }
    out[pos..pos + terminator].fill(0);

    Ok(pos + terminator)
}

/// Decode the data of a record into key-value pairs.
///
/// Zero-length data is the empty mapping of a store that was never written.
pub fn decode(data: &[u8]) -> Result<BTreeMap<String, String>, CodecError> {
    let mut entries = BTreeMap::new();
    if data.is_empty() {
        return Ok(entries);
    }

    let mut rest = data;
    loop {
        let Some(end) = rest.iter().position(|b| *b == 0) else {
            // Ran out of data before the terminator.
            return Err(CodecError::Corrupt);
        };

        let segment = &rest[..end];
        if segment.is_empty() {
            return Ok(entries);
        }

        let text = core::str::from_utf8(segment).map_err(|_| CodecError::Corrupt)?;
        let (key, value) = text.split_once('=').ok_or(CodecError::Corrupt)?;
        if key.is_empty() {
            return Err(CodecError::Corrupt);
        }
        entries.insert(key.to_string(), value.to_string());

        rest = &rest[end + 1..];
    }
}
