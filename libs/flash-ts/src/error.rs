use crate::block::{BlockError, BlockErrorKind};
use crate::record::CodecError;

/// Errors yielded by [crate::FlashTs].
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// An offset or length is not aligned to the granularity of the medium.
    Misaligned,

    /// The partition does not fit within the device.
    OutOfBounds,

    /// The partition does not contain at least two erase blocks and two chunks.
    PartitionTooSmall,

    /// The encoded key-value data does not fit within a single chunk.
    CapacityExceeded,

    /// A key is empty or contains `=` or `\0`, or a value contains `\0`.
    InvalidKey,

    /// A record failed magic, checksum, length or encoding validation.
    CorruptRecord,

    /// An erase block could not be erased, even after retrying.
    EraseFailed,

    /// After writing a record a readback does not yield the same record.
    ///
    /// Both the retry at the same chunk and the attempt at the next chunk failed.
    WriteVerifyFailed,

    /// No writable chunk is left in the partition.
    NoSpace,

    /// The underlying storage medium yielded an error.
    Other(E),
}

/// Kind of an [Error], without the device error payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    Misaligned,
    OutOfBounds,
    PartitionTooSmall,
    CapacityExceeded,
    InvalidKey,
    CorruptRecord,
    EraseFailed,
    WriteVerifyFailed,
    NoSpace,
    Io,
}

impl<E> Error<E> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Misaligned => ErrorKind::Misaligned,
            Error::OutOfBounds => ErrorKind::OutOfBounds,
            Error::PartitionTooSmall => ErrorKind::PartitionTooSmall,
            Error::CapacityExceeded => ErrorKind::CapacityExceeded,
            Error::InvalidKey => ErrorKind::InvalidKey,
            Error::CorruptRecord => ErrorKind::CorruptRecord,
            Error::EraseFailed => ErrorKind::EraseFailed,
            Error::WriteVerifyFailed => ErrorKind::WriteVerifyFailed,
            Error::NoSpace => ErrorKind::NoSpace,
            Error::Other(_) => ErrorKind::Io,
        }
    }
}

impl<E: BlockError> Error<E> {
    /// Wrap a device error, lifting alignment and bounds violations into their own variants.
    pub(crate) fn device(e: E) -> Self {
        match e.kind() {
            BlockErrorKind::Misaligned => Error::Misaligned,
            BlockErrorKind::OutOfBounds => Error::OutOfBounds,
            BlockErrorKind::Corrupted | BlockErrorKind::Other => Error::Other(e),
        }
    }
}

impl<E> From<CodecError> for Error<E> {
    fn from(value: CodecError) -> Self {
        match value {
            CodecError::CapacityExceeded => Error::CapacityExceeded,
            CodecError::InvalidKey => Error::InvalidKey,
            CodecError::Corrupt => Error::CorruptRecord,
        }
    }
}
