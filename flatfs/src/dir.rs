use crate::error::{FsError, Result};
use crate::fs::{DESCRIPTOR_COUNT, MAX_FILE_SIZE, MAX_NAME_LEN};

use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Bytes occupied by one directory record inside the directory file.
pub const DIR_ENTRY_SIZE: usize = std::mem::size_of::<RawEntry>();

/// The directory file is capped by the same block pointer ceiling as any other file.
pub const MAX_DIR_ENTRIES: usize = MAX_FILE_SIZE / DIR_ENTRY_SIZE;

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RawEntry {
    /// NUL padded.
    name: [u8; MAX_NAME_LEN],
    descriptor: U32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub descriptor: usize,
}

/// Flat name to descriptor mapping kept in insertion order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Directory {
    entries: Vec<DirEntry>,
}

/// Rejects names that cannot be stored in a directory record.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('\0') {
        return Err(FsError::InvalidName(name.to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::NameTooLong(name.to_string()));
    }
    Ok(())
}

impl Directory {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.descriptor)
    }

    /// The name bound to a descriptor.
    pub fn name_of(&self, descriptor: usize) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.descriptor == descriptor)
            .map(|entry| entry.name.as_str())
    }

    pub fn add(&mut self, name: &str, descriptor: usize) -> Result<()> {
        validate_name(name)?;
        if self.lookup(name).is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
        if self.is_full() {
            return Err(FsError::DirectoryFull);
        }
        self.entries.push(DirEntry {
            name: name.to_string(),
            descriptor,
        });
        Ok(())
    }

    /// Removes the entry, keeping the remaining entries in order. Returns its descriptor.
    pub fn remove(&mut self, name: &str) -> Result<usize> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.name == name)
            .ok_or_else(|| FsError::DoesNotExist(name.to_string()))?;
        Ok(self.entries.remove(position).descriptor)
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_DIR_ENTRIES
    }

    /// Size in bytes of the directory file holding `entries` records.
    pub fn file_size(entries: usize) -> usize {
        entries * DIR_ENTRY_SIZE
    }

    /// Encodes the entries as packed records, the exact content of the directory file.
    pub fn serialize(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(Self::file_size(self.entries.len()));
        for entry in &self.entries {
            let mut name = [0; MAX_NAME_LEN];
            name[..entry.name.len()].copy_from_slice(entry.name.as_bytes());
            let raw = RawEntry {
                name,
                descriptor: U32::new(entry.descriptor as u32),
            };
            encoded.extend_from_slice(raw.as_bytes());
        }
        encoded
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() % DIR_ENTRY_SIZE != 0 {
            return Err(FsError::Corrupted(format!(
                "directory length {} is not a whole number of entries",
                buf.len()
            )));
        }

        let mut dir = Directory::new();
        for chunk in buf.chunks_exact(DIR_ENTRY_SIZE) {
            let raw = RawEntry::read_from_bytes(chunk)
                .map_err(|_| FsError::Corrupted("truncated directory entry".to_string()))?;
            let len = raw
                .name
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(MAX_NAME_LEN);
            let name = std::str::from_utf8(&raw.name[..len])
                .map_err(|_| FsError::Corrupted("directory entry name is not UTF-8".to_string()))?;

            let descriptor = raw.descriptor.get() as usize;
            if descriptor == 0 || descriptor >= DESCRIPTOR_COUNT {
                return Err(FsError::Corrupted(format!(
                    "entry {:?} refers to descriptor {}",
                    name, descriptor
                )));
            }
            dir.add(name, descriptor)
                .map_err(|e| FsError::Corrupted(format!("directory entry {:?}: {}", name, e)))?;
        }
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_fit_reference_sizing() {
        assert_eq!(DIR_ENTRY_SIZE, 8);
        assert_eq!(MAX_DIR_ENTRIES, 24);
    }

    #[test]
    fn lookup_finds_added_entries() {
        let mut dir = Directory::new();
        dir.add("f1", 1).unwrap();
        dir.add("f2", 2).unwrap();

        assert_eq!(dir.lookup("f1"), Some(1));
        assert_eq!(dir.lookup("f2"), Some(2));
        assert_eq!(dir.lookup("f3"), None);
        assert_eq!(dir.name_of(2), Some("f2"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut dir = Directory::new();
        dir.add("FILE", 1).unwrap();
        assert!(matches!(dir.add("FILE", 2), Err(FsError::AlreadyExists(_))));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn names_are_bounded() {
        assert!(validate_name("FILE").is_ok());
        assert!(matches!(validate_name("FIIIIILE"), Err(FsError::NameTooLong(_))));
        assert!(matches!(validate_name(""), Err(FsError::InvalidName(_))));
        assert!(matches!(validate_name("a\0"), Err(FsError::InvalidName(_))));
    }

    #[test]
    fn removal_compacts_and_keeps_order() {
        let mut dir = Directory::new();
        dir.add("a", 1).unwrap();
        dir.add("b", 2).unwrap();
        dir.add("c", 3).unwrap();

        assert_eq!(dir.remove("b").unwrap(), 2);
        let names: Vec<_> = dir.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert!(matches!(dir.remove("b"), Err(FsError::DoesNotExist(_))));
    }

    #[test]
    fn directory_fills_up() {
        let mut dir = Directory::new();
        for i in 0..MAX_DIR_ENTRIES {
            dir.add(&format!("F{}", i), i + 1).unwrap();
        }
        assert!(dir.is_full());
        assert!(matches!(dir.add("X", 27), Err(FsError::DirectoryFull)));
    }

    #[test]
    fn can_encode_and_decode_entries() {
        let mut dir = Directory::new();
        dir.add("F0", 1).unwrap();
        dir.add("FILE", 5).unwrap();

        let encoded = dir.serialize();
        assert_eq!(encoded.len(), 2 * DIR_ENTRY_SIZE);
        assert_eq!(&encoded[0..4], b"F0\0\0");
        assert_eq!(&encoded[4..8], &1u32.to_le_bytes());

        assert_eq!(Directory::parse(&encoded).unwrap(), dir);
    }

    #[test]
    fn ragged_directory_is_corruption() {
        assert!(matches!(
            Directory::parse(&[0; DIR_ENTRY_SIZE + 1]),
            Err(FsError::Corrupted(_))
        ));
    }

    #[test]
    fn entries_pointing_at_directory_slot_are_corruption() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"abc\0");
        raw.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(Directory::parse(&raw), Err(FsError::Corrupted(_))));
    }
}
