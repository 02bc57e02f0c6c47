use thiserror::Error;

/// Coarse grouping of [`FsError`] variants. Callers that only care about the class of a
/// failure (bad name, exhausted table, misuse of a session, out of range) can match on this
/// instead of the individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Name,
    Capacity,
    State,
    Bounds,
    EndOfFile,
    Io,
    Corrupted,
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    #[error("file name exceeds {max} bytes: {0}", max = crate::fs::MAX_NAME_LEN)]
    NameTooLong(String),
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("found no file named {0}")]
    DoesNotExist(String),
    #[error("no free file descriptor")]
    NoFreeDescriptor,
    #[error("no free data block")]
    NoFreeBlock,
    #[error("no free open file table entry")]
    NoFreeSession,
    #[error("directory holds the maximum number of entries")]
    DirectoryFull,
    #[error("file is already open: {0}")]
    AlreadyOpen(String),
    #[error("file is open: {0}")]
    FileOpen(String),
    #[error("invalid open file table entry: {0}")]
    InvalidSlot(usize),
    #[error("seek offset {offset} outside file of length {length}")]
    SeekOutOfRange { offset: usize, length: usize },
    #[error("block {0} out of range")]
    BlockOutOfRange(usize),
    #[error("device has {0} blocks, the volume layout needs {blocks}", blocks = crate::fs::BLOCK_COUNT)]
    WrongGeometry(usize),
    #[error("end of file")]
    EndOfFile,
    #[error("block device error")]
    Io(#[from] std::io::Error),
    #[error("file system corrupted: {0}")]
    Corrupted(String),
}

impl FsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::AlreadyExists(_)
            | FsError::NameTooLong(_)
            | FsError::InvalidName(_)
            | FsError::DoesNotExist(_) => ErrorKind::Name,
            FsError::NoFreeDescriptor
            | FsError::NoFreeBlock
            | FsError::NoFreeSession
            | FsError::DirectoryFull => ErrorKind::Capacity,
            FsError::AlreadyOpen(_) | FsError::FileOpen(_) | FsError::InvalidSlot(_) => {
                ErrorKind::State
            }
            FsError::SeekOutOfRange { .. }
            | FsError::BlockOutOfRange(_)
            | FsError::WrongGeometry(_) => ErrorKind::Bounds,
            FsError::EndOfFile => ErrorKind::EndOfFile,
            FsError::Io(_) => ErrorKind::Io,
            FsError::Corrupted(_) => ErrorKind::Corrupted,
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_map_to_taxonomy() {
        assert_eq!(FsError::NameTooLong("ABCDE".into()).kind(), ErrorKind::Name);
        assert_eq!(FsError::NoFreeSession.kind(), ErrorKind::Capacity);
        assert_eq!(FsError::InvalidSlot(9).kind(), ErrorKind::State);
        assert_eq!(
            FsError::SeekOutOfRange {
                offset: 70,
                length: 60
            }
            .kind(),
            ErrorKind::Bounds
        );
    }

    #[test]
    fn io_errors_convert() {
        let err: FsError =
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "block out of range").into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
