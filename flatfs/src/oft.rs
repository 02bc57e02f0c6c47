//! Open file sessions.
//!
//! A session owns the cursor of one open file together with a single staged block of that
//! file. Reads and writes operate on the staged buffer and move it whenever the cursor
//! crosses into another block; a buffer holding unwritten bytes is written back before it
//! is replaced and when the session is closed.

use crate::error::{FsError, Result};
use crate::fs::{BLOCK_SIZE, DIRECT_POINTERS, MAX_FILE_SIZE, OFT_CAPACITY};
use crate::io::BlockStorage;
use crate::store::Storage;

use log::{debug, warn};

/// Slot permanently holding the directory's own session.
pub const DIRECTORY_SLOT: usize = 0;

#[derive(Debug)]
pub struct Session {
    descriptor: usize,
    position: usize,
    /// Which block of the file, counted from 0, the buffer mirrors.
    staged: usize,
    buffer: [u8; BLOCK_SIZE],
    dirty: bool,
}

impl Session {
    /// Opens a session on `descriptor` positioned at the start of the file.
    pub fn open<T: BlockStorage>(store: &mut Storage<T>, descriptor: usize) -> Result<Self> {
        let mut session = Session {
            descriptor,
            position: 0,
            staged: 0,
            buffer: [0; BLOCK_SIZE],
            dirty: false,
        };
        session.load(store, 0)?;
        Ok(session)
    }

    pub fn descriptor(&self) -> usize {
        self.descriptor
    }

    pub fn position(&self) -> usize {
        self.position
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Fills the buffer with block `nth` of the file. Blocks past the end of the file hold
    /// nothing worth reading, so they start out zeroed.
    fn load<T: BlockStorage>(&mut self, store: &mut Storage<T>, nth: usize) -> Result<()> {
        debug_assert!(!self.dirty);
        let length = store.length(self.descriptor)?;
        match store.block_of(self.descriptor, nth)? {
            Some(blocknr) if nth * BLOCK_SIZE < length => {
                store.read_block(blocknr, &mut self.buffer)?
            }
            _ => self.buffer = [0; BLOCK_SIZE],
        }
        self.staged = nth;
        Ok(())
    }

    fn stage<T: BlockStorage>(&mut self, store: &mut Storage<T>, nth: usize) -> Result<()> {
        if nth == self.staged {
            return Ok(());
        }
        self.flush(store)?;
        debug!(
            "descriptor {} staging block {} of the file",
            self.descriptor, nth
        );
        self.load(store, nth)
    }

    /// Writes the buffer back to its block if it holds unwritten bytes.
    pub fn flush<T: BlockStorage>(&mut self, store: &mut Storage<T>) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let blocknr = store
            .block_of(self.descriptor, self.staged)?
            .ok_or_else(|| {
                FsError::Corrupted(format!(
                    "descriptor {} has unwritten data for unallocated block {}",
                    self.descriptor, self.staged
                ))
            })?;
        store.write_block(blocknr, &self.buffer)?;
        self.dirty = false;
        debug!("flushed descriptor {} to block {}", self.descriptor, blocknr);
        Ok(())
    }

    /// Flushes and goes back to the start of the file, re-reading block 0 even if it was
    /// already staged. Used after the file was rewritten or shortened underneath the
    /// session.
    pub fn rewind<T: BlockStorage>(&mut self, store: &mut Storage<T>) -> Result<()> {
        self.flush(store)?;
        self.position = 0;
        self.load(store, 0)
    }

    pub fn seek<T: BlockStorage>(&mut self, store: &mut Storage<T>, offset: usize) -> Result<()> {
        let length = store.length(self.descriptor)?;
        if offset > length {
            return Err(FsError::SeekOutOfRange { offset, length });
        }
        self.position = offset;
        // An offset at the very end of a full file has no block to stage.
        let nth = offset / BLOCK_SIZE;
        if nth < DIRECT_POINTERS {
            self.stage(store, nth)?;
        }
        Ok(())
    }

    /// Copies bytes from the cursor into `buf`. Returns fewer bytes than asked for when the
    /// end of the file comes first, and `EndOfFile` when there is nothing left at all.
    pub fn read<T: BlockStorage>(&mut self, store: &mut Storage<T>, buf: &mut [u8]) -> Result<usize> {
        let length = store.length(self.descriptor)?;
        if self.position >= length {
            return Err(FsError::EndOfFile);
        }

        let count = buf.len().min(length - self.position);
        let mut done = 0;
        while done < count {
            let offset = self.position % BLOCK_SIZE;
            self.stage(store, self.position / BLOCK_SIZE)?;
            let n = (BLOCK_SIZE - offset).min(count - done);
            buf[done..done + n].copy_from_slice(&self.buffer[offset..offset + n]);
            done += n;
            self.position += n;
        }
        Ok(count)
    }

    /// Copies `buf` into the file at the cursor, growing the file as needed. Stops at the
    /// file size ceiling or when the disk runs out of blocks, returning how much was
    /// written; fails only if nothing could be written for lack of a free block.
    pub fn write<T: BlockStorage>(&mut self, store: &mut Storage<T>, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let length = store.length(self.descriptor)?;
        let additional = (self.position + buf.len()).saturating_sub(length);
        match store.grow(self.descriptor, additional) {
            Ok(_) | Err(FsError::NoFreeBlock) => {}
            Err(e) => return Err(e),
        }

        let capacity = store.descriptor(self.descriptor)?.capacity();
        let count = buf.len().min(capacity.saturating_sub(self.position));
        if count == 0 {
            if self.position >= MAX_FILE_SIZE {
                warn!("descriptor {} is at the file size limit", self.descriptor);
                return Ok(0);
            }
            return Err(FsError::NoFreeBlock);
        }

        let mut done = 0;
        while done < count {
            let offset = self.position % BLOCK_SIZE;
            self.stage(store, self.position / BLOCK_SIZE)?;
            let n = (BLOCK_SIZE - offset).min(count - done);
            self.buffer[offset..offset + n].copy_from_slice(&buf[done..done + n]);
            self.dirty = true;
            done += n;
            self.position += n;
        }

        if self.position > length {
            store.set_length(self.descriptor, self.position)?;
        }
        if count < buf.len() {
            warn!(
                "write to descriptor {} truncated to {} of {} bytes",
                self.descriptor,
                count,
                buf.len()
            );
        }
        Ok(count)
    }
}

/// Fixed table of sessions. Slot 0 belongs to the directory for as long as the volume is
/// mounted; user files get the remaining slots.
#[derive(Debug)]
pub struct OpenFileTable {
    slots: [Option<Session>; OFT_CAPACITY],
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    pub fn open_directory(&mut self, session: Session) {
        self.slots[DIRECTORY_SLOT] = Some(session);
    }

    pub fn directory_mut(&mut self) -> Result<&mut Session> {
        self.slots[DIRECTORY_SLOT]
            .as_mut()
            .ok_or_else(|| FsError::Corrupted("directory is not open".to_string()))
    }

    /// Places a session in the lowest free user slot.
    pub fn insert(&mut self, session: Session) -> Result<usize> {
        let slot = (DIRECTORY_SLOT + 1..OFT_CAPACITY)
            .find(|&slot| self.slots[slot].is_none())
            .ok_or(FsError::NoFreeSession)?;
        self.slots[slot] = Some(session);
        Ok(slot)
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots[DIRECTORY_SLOT + 1..].iter().any(Option::is_none)
    }

    /// The user session in `slot`.
    pub fn get_mut(&mut self, slot: usize) -> Result<&mut Session> {
        if slot == DIRECTORY_SLOT {
            return Err(FsError::InvalidSlot(slot));
        }
        self.slots
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or(FsError::InvalidSlot(slot))
    }

    pub fn get(&self, slot: usize) -> Option<&Session> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn remove(&mut self, slot: usize) -> Result<Session> {
        if slot == DIRECTORY_SLOT {
            return Err(FsError::InvalidSlot(slot));
        }
        self.slots
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or(FsError::InvalidSlot(slot))
    }

    pub fn is_open(&self, descriptor: usize) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|session| session.descriptor == descriptor)
    }

    /// Every open session, the directory's included.
    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut Session> + '_ {
        self.slots.iter_mut().flatten()
    }
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Bitmap;
    use crate::fs::{BLOCK_COUNT, DATA_START};
    use crate::io::MemDisk;
    use crate::node::DescriptorTable;

    fn store_with_file() -> (Storage<MemDisk>, usize) {
        let mut descriptors = DescriptorTable::new();
        let index = descriptors.allocate().unwrap();
        let store = Storage::new(MemDisk::new(BLOCK_COUNT), Bitmap::new(), descriptors);
        (store, index)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn empty_file_reads_end_of_file() {
        let (mut store, index) = store_with_file();
        let mut session = Session::open(&mut store, index).unwrap();

        let mut buf = [0; 10];
        assert!(matches!(
            session.read(&mut store, &mut buf),
            Err(FsError::EndOfFile)
        ));
    }

    #[test]
    fn write_stays_buffered_until_block_change() {
        let (mut store, index) = store_with_file();
        let mut session = Session::open(&mut store, index).unwrap();

        assert_eq!(session.write(&mut store, &[7; 10]).unwrap(), 10);
        assert!(session.is_dirty());
        let mut raw = [0; BLOCK_SIZE];
        store.read_block(DATA_START, &mut raw).unwrap();
        assert_eq!(raw[0], 0);

        session.flush(&mut store).unwrap();
        store.read_block(DATA_START, &mut raw).unwrap();
        assert_eq!(&raw[..10], &[7; 10]);
    }

    #[test]
    fn writes_and_reads_cross_block_boundaries() {
        let (mut store, index) = store_with_file();
        let mut session = Session::open(&mut store, index).unwrap();
        let data = pattern(150);

        assert_eq!(session.write(&mut store, &data).unwrap(), 150);
        assert_eq!(store.length(index).unwrap(), 150);
        assert_eq!(store.descriptor(index).unwrap().block_count(), 3);

        session.seek(&mut store, 0).unwrap();
        let mut back = vec![0; 150];
        assert_eq!(session.read(&mut store, &mut back).unwrap(), 150);
        assert_eq!(back, data);
    }

    #[test]
    fn write_truncates_at_file_size_limit() {
        let (mut store, index) = store_with_file();
        let mut session = Session::open(&mut store, index).unwrap();

        assert_eq!(session.write(&mut store, &pattern(250)).unwrap(), MAX_FILE_SIZE);
        assert_eq!(session.position(), MAX_FILE_SIZE);
        assert_eq!(session.write(&mut store, &[1]).unwrap(), 0);
        assert_eq!(store.length(index).unwrap(), MAX_FILE_SIZE);
    }

    #[test]
    fn overwrite_in_place_keeps_length() {
        let (mut store, index) = store_with_file();
        let mut session = Session::open(&mut store, index).unwrap();
        session.write(&mut store, &[1; 100]).unwrap();

        session.seek(&mut store, 10).unwrap();
        assert_eq!(session.write(&mut store, &[2; 20]).unwrap(), 20);
        assert_eq!(store.length(index).unwrap(), 100);

        session.seek(&mut store, 0).unwrap();
        let mut back = [0; 100];
        session.read(&mut store, &mut back).unwrap();
        assert_eq!(&back[..10], &[1; 10]);
        assert_eq!(&back[10..30], &[2; 20]);
        assert_eq!(&back[30..], &[1; 70]);
    }

    #[test]
    fn seek_beyond_length_is_rejected() {
        let (mut store, index) = store_with_file();
        let mut session = Session::open(&mut store, index).unwrap();
        session.write(&mut store, &[1; 60]).unwrap();

        assert!(session.seek(&mut store, 60).is_ok());
        assert!(matches!(
            session.seek(&mut store, 61),
            Err(FsError::SeekOutOfRange {
                offset: 61,
                length: 60
            })
        ));
        assert_eq!(session.position(), 60);
    }

    #[test]
    fn seek_to_end_of_full_file_is_allowed() {
        let (mut store, index) = store_with_file();
        let mut session = Session::open(&mut store, index).unwrap();
        session.write(&mut store, &pattern(MAX_FILE_SIZE)).unwrap();

        session.seek(&mut store, MAX_FILE_SIZE).unwrap();
        let mut buf = [0; 1];
        assert!(matches!(
            session.read(&mut store, &mut buf),
            Err(FsError::EndOfFile)
        ));
    }

    #[test]
    fn seeking_never_allocates() {
        let (mut store, index) = store_with_file();
        let mut session = Session::open(&mut store, index).unwrap();
        session.write(&mut store, &[1; BLOCK_SIZE]).unwrap();
        let free = store.bitmap.free_count();

        session.seek(&mut store, BLOCK_SIZE).unwrap();
        assert_eq!(store.bitmap.free_count(), free);
    }

    #[test]
    fn write_without_free_blocks_fails() {
        let (mut store, index) = store_with_file();
        for blocknr in DATA_START..BLOCK_COUNT {
            store.bitmap.allocate(blocknr);
        }
        let mut session = Session::open(&mut store, index).unwrap();

        assert!(matches!(
            session.write(&mut store, &[1; 4]),
            Err(FsError::NoFreeBlock)
        ));
        assert_eq!(store.length(index).unwrap(), 0);
    }

    #[test]
    fn write_is_short_when_disk_fills_up() {
        let (mut store, index) = store_with_file();
        for blocknr in DATA_START + 1..BLOCK_COUNT {
            store.bitmap.allocate(blocknr);
        }
        let mut session = Session::open(&mut store, index).unwrap();

        assert_eq!(session.write(&mut store, &[1; 100]).unwrap(), BLOCK_SIZE);
        assert_eq!(store.length(index).unwrap(), BLOCK_SIZE);
    }

    #[test]
    fn table_hands_out_lowest_user_slot() {
        let (mut store, index) = store_with_file();
        let mut table = OpenFileTable::new();
        table.open_directory(Session::open(&mut store, 0).unwrap());

        assert_eq!(table.insert(Session::open(&mut store, index).unwrap()).unwrap(), 1);
        assert!(table.is_open(index));
        assert!(matches!(table.get_mut(0), Err(FsError::InvalidSlot(0))));
        assert!(matches!(table.get_mut(2), Err(FsError::InvalidSlot(2))));
        assert!(matches!(table.get_mut(OFT_CAPACITY), Err(FsError::InvalidSlot(_))));

        table.remove(1).unwrap();
        assert!(!table.is_open(index));
        assert!(matches!(table.remove(1), Err(FsError::InvalidSlot(1))));
    }
}
