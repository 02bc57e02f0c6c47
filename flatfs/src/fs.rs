use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::alloc::Bitmap;
use crate::dir::{validate_name, Directory};
use crate::error::{FsError, Result};
use crate::io::{BlockStorage, MemDisk};
use crate::node::DescriptorTable;
use crate::oft::{OpenFileTable, Session, DIRECTORY_SLOT};
use crate::store::Storage;

use log::{debug, info, warn};

/// Bytes per block.
pub const BLOCK_SIZE: usize = 64;
/// Blocks per volume.
pub const BLOCK_COUNT: usize = 64;

/// Known locations.
pub const BITMAP_BLOCK: usize = 0;
pub const DESCRIPTOR_START: usize = 1;
pub const DESCRIPTOR_BLOCKS: usize = 7;
pub const DATA_START: usize = DESCRIPTOR_START + DESCRIPTOR_BLOCKS;
pub const DATA_BLOCKS: usize = BLOCK_COUNT - DATA_START;

pub const DESCRIPTORS_PER_BLOCK: usize = 4;
pub const DESCRIPTOR_COUNT: usize = DESCRIPTORS_PER_BLOCK * DESCRIPTOR_BLOCKS;
/// Block pointers per descriptor, which caps every file at `MAX_FILE_SIZE` bytes.
pub const DIRECT_POINTERS: usize = 3;
pub const MAX_FILE_SIZE: usize = DIRECT_POINTERS * BLOCK_SIZE;

/// Open file table entries, including the one reserved for the directory.
pub const OFT_CAPACITY: usize = 4;
pub const MAX_NAME_LEN: usize = 4;

const DIRECTORY: usize = 0;

/// A single flat-namespace volume laid out over a fixed 64 block device.
///
/// # Layout
/// =====================================================
/// | Bitmap | Descriptors (7 blocks) | Data Region      |
/// =====================================================
///
/// The directory is the file behind descriptor 0 and lives in the data region like any
/// other file. Bitmap, descriptors and directory are persisted when the caller asks for it
/// (`save_*`, `sync`), except that `create` and `destroy` rewrite the directory file.
pub struct Volume<T: BlockStorage> {
    store: Storage<T>,
    directory: Directory,
    oft: OpenFileTable,
}

impl<T: BlockStorage> Volume<T> {
    /// Initializes an empty file system onto owned block storage.
    pub fn format(dev: T) -> Result<Self> {
        check_geometry(&dev)?;
        let mut volume = Volume {
            store: Storage::new(dev, Bitmap::new(), DescriptorTable::new()),
            directory: Directory::new(),
            oft: OpenFileTable::new(),
        };
        volume.open_directory()?;
        volume.sync()?;
        info!(
            "formatted volume of {} blocks, {} bytes each",
            BLOCK_COUNT, BLOCK_SIZE
        );
        Ok(volume)
    }

    /// Reads a previously formatted volume back from block storage.
    pub fn mount(dev: T) -> Result<Self> {
        check_geometry(&dev)?;
        let mut volume = Volume {
            store: Storage::new(dev, Bitmap::new(), DescriptorTable::new()),
            directory: Directory::new(),
            oft: OpenFileTable::new(),
        };
        volume.store.bitmap = volume.read_bitmap()?;
        volume.store.descriptors = volume.read_descriptors()?;
        volume.open_directory()?;
        volume.directory = volume.read_directory()?;
        volume.check()?;
        info!("mounted volume with {} files", volume.directory.len());
        Ok(volume)
    }

    /// Flushes everything and hands the block storage back.
    pub fn unmount(mut self) -> Result<T> {
        self.sync()?;
        info!("unmounted volume");
        Ok(self.store.dev)
    }

    fn open_directory(&mut self) -> Result<()> {
        let session = Session::open(&mut self.store, DIRECTORY)?;
        self.oft.open_directory(session);
        Ok(())
    }

    /// Creates an empty file. No data blocks are used until the first write, though the
    /// directory file may need one more block for the new entry.
    pub fn create(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.directory.lookup(name).is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
        if self.directory.is_full() {
            return Err(FsError::DirectoryFull);
        }
        let needed = Directory::file_size(self.directory.len() + 1).div_ceil(BLOCK_SIZE);
        if needed > self.store.descriptor(DIRECTORY)?.block_count()
            && self.store.bitmap.find_free().is_none()
        {
            warn!("no free block for directory entry {}", name);
            return Err(FsError::NoFreeBlock);
        }

        let index = self.store.descriptors.allocate()?;
        let previous = self.directory.clone();
        let added = match self.directory.add(name, index) {
            Ok(()) => self.commit_directory(previous),
            Err(e) => Err(e),
        };
        if let Err(e) = added {
            self.store.release(index);
            return Err(e);
        }
        info!("created {} with descriptor {}", name, index);
        Ok(())
    }

    /// Deletes a file that is not open, returning its blocks and descriptor.
    pub fn destroy(&mut self, name: &str) -> Result<()> {
        let index = self
            .directory
            .lookup(name)
            .ok_or_else(|| FsError::DoesNotExist(name.to_string()))?;
        if self.oft.is_open(index) {
            return Err(FsError::FileOpen(name.to_string()));
        }

        let previous = self.directory.clone();
        self.directory.remove(name)?;
        self.commit_directory(previous)?;
        self.store.release(index);
        info!("destroyed {} (descriptor {})", name, index);
        Ok(())
    }

    /// Opens a file at offset 0 and returns its open file table slot.
    pub fn open(&mut self, name: &str) -> Result<usize> {
        let index = self
            .directory
            .lookup(name)
            .ok_or_else(|| FsError::DoesNotExist(name.to_string()))?;
        if self.oft.is_open(index) {
            return Err(FsError::AlreadyOpen(name.to_string()));
        }
        if !self.oft.has_free_slot() {
            return Err(FsError::NoFreeSession);
        }

        let session = Session::open(&mut self.store, index)?;
        let slot = self.oft.insert(session)?;
        info!("opened {} in slot {}", name, slot);
        Ok(slot)
    }

    pub fn close(&mut self, slot: usize) -> Result<()> {
        self.oft.get_mut(slot)?.flush(&mut self.store)?;
        let session = self.oft.remove(slot)?;
        info!(
            "closed slot {} (descriptor {})",
            slot,
            session.descriptor()
        );
        Ok(())
    }

    pub fn read(&mut self, slot: usize, buf: &mut [u8]) -> Result<usize> {
        self.oft.get_mut(slot)?.read(&mut self.store, buf)
    }

    pub fn write(&mut self, slot: usize, buf: &[u8]) -> Result<usize> {
        self.oft.get_mut(slot)?.write(&mut self.store, buf)
    }

    pub fn seek(&mut self, slot: usize, offset: usize) -> Result<()> {
        self.oft.get_mut(slot)?.seek(&mut self.store, offset)
    }

    /// Current byte offset of the session in `slot`.
    pub fn position(&self, slot: usize) -> Result<usize> {
        if slot == DIRECTORY_SLOT {
            return Err(FsError::InvalidSlot(slot));
        }
        self.oft
            .get(slot)
            .map(Session::position)
            .ok_or(FsError::InvalidSlot(slot))
    }

    /// Every file with its length, in directory order.
    pub fn list(&self) -> Vec<(String, usize)> {
        self.directory
            .entries()
            .iter()
            .filter_map(|entry| {
                self.store
                    .descriptors
                    .get(entry.descriptor)
                    .map(|desc| (entry.name.clone(), desc.length))
            })
            .collect()
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn descriptors(&self) -> &DescriptorTable {
        &self.store.descriptors
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.store.bitmap
    }

    pub fn free_block_count(&self) -> usize {
        self.store.bitmap.free_count()
    }

    pub fn free_descriptor_count(&self) -> usize {
        self.store.descriptors.free_count()
    }

    /// The block the next allocation will land on.
    pub fn next_free_block(&self) -> Option<usize> {
        self.store.bitmap.find_free()
    }

    pub fn save_bitmap(&mut self) -> Result<()> {
        let mut block = [0; BLOCK_SIZE];
        block.copy_from_slice(self.store.bitmap.serialize());
        self.store.write_block(BITMAP_BLOCK, &block)?;
        debug!("saved bitmap");
        Ok(())
    }

    /// Replaces the in-memory bitmap with the one on disk. The loaded bitmap must agree
    /// with the descriptor table, otherwise the current one is kept and `Corrupted` returned.
    pub fn load_bitmap(&mut self) -> Result<()> {
        self.ensure_no_open_files()?;
        let loaded = self.read_bitmap()?;
        let previous = std::mem::replace(&mut self.store.bitmap, loaded);
        if let Err(e) = self.check() {
            warn!("kept current bitmap, the one on disk is inconsistent: {}", e);
            self.store.bitmap = previous;
            return Err(e);
        }
        debug!("loaded bitmap");
        Ok(())
    }

    fn read_bitmap(&mut self) -> Result<Bitmap> {
        let mut block = [0; BLOCK_SIZE];
        self.store.read_block(BITMAP_BLOCK, &mut block)?;
        Bitmap::parse(&block)
    }

    pub fn save_descriptors(&mut self) -> Result<()> {
        let encoded = self.store.descriptors.serialize();
        let mut block = [0; BLOCK_SIZE];
        for (i, chunk) in encoded.chunks_exact(BLOCK_SIZE).enumerate() {
            block.copy_from_slice(chunk);
            self.store.write_block(DESCRIPTOR_START + i, &block)?;
        }
        debug!("saved descriptor table");
        Ok(())
    }

    /// Replaces the in-memory descriptor table with the one on disk. The loaded table must
    /// agree with the bitmap and directory, otherwise the current one is kept and
    /// `Corrupted` returned.
    pub fn load_descriptors(&mut self) -> Result<()> {
        self.ensure_no_open_files()?;
        let loaded = self.read_descriptors()?;
        self.oft.directory_mut()?.flush(&mut self.store)?;
        let previous = std::mem::replace(&mut self.store.descriptors, loaded);
        let checked = self.check();
        if checked.is_err() {
            self.store.descriptors = previous;
        }
        // The directory buffer may mirror a block the old table pointed at.
        self.oft.directory_mut()?.rewind(&mut self.store)?;
        if let Err(e) = checked {
            warn!("kept current descriptor table, the one on disk is inconsistent: {}", e);
            return Err(e);
        }
        debug!("loaded descriptor table");
        Ok(())
    }

    fn read_descriptors(&mut self) -> Result<DescriptorTable> {
        let mut encoded = Vec::with_capacity(DESCRIPTOR_BLOCKS * BLOCK_SIZE);
        let mut block = [0; BLOCK_SIZE];
        for blocknr in DESCRIPTOR_START..DATA_START {
            self.store.read_block(blocknr, &mut block)?;
            encoded.extend_from_slice(&block);
        }
        DescriptorTable::parse(&encoded)
    }

    /// Rewrites the directory file from the in-memory directory through the directory's own
    /// session, growing or shrinking it like any other file.
    pub fn save_directory(&mut self) -> Result<()> {
        let encoded = self.directory.serialize();
        let session = self.oft.directory_mut()?;
        session.seek(&mut self.store, 0)?;
        let written = session.write(&mut self.store, &encoded)?;
        // Shrink before flushing so the length matches the entries even if the flush fails.
        if self.store.length(DIRECTORY)? > written {
            self.store.truncate(DIRECTORY, written)?;
        }
        session.flush(&mut self.store)?;
        if written < encoded.len() {
            return Err(FsError::NoFreeBlock);
        }
        session.rewind(&mut self.store)?;
        debug!("saved directory with {} entries", self.directory.len());
        Ok(())
    }

    /// Saves the directory after a change. On failure the directory reverts to `previous`,
    /// on disk as far as the device allows, and the original error is returned.
    fn commit_directory(&mut self, previous: Directory) -> Result<()> {
        let Err(e) = self.save_directory() else {
            return Ok(());
        };
        self.directory = previous;
        if let Err(undo) = self.save_directory() {
            warn!("could not restore the directory file: {}", undo);
        }
        Err(e)
    }

    /// Replaces the in-memory directory with the content of the directory file. The loaded
    /// entries must pair up with the descriptor table, otherwise the current directory is
    /// kept and `Corrupted` returned.
    pub fn load_directory(&mut self) -> Result<()> {
        self.ensure_no_open_files()?;
        let loaded = self.read_directory()?;
        let previous = std::mem::replace(&mut self.directory, loaded);
        if let Err(e) = self.check() {
            warn!("kept current directory, the one on disk is inconsistent: {}", e);
            self.directory = previous;
            return Err(e);
        }
        debug!("loaded directory with {} entries", self.directory.len());
        Ok(())
    }

    fn read_directory(&mut self) -> Result<Directory> {
        let length = self.store.length(DIRECTORY)?;
        let mut encoded = vec![0; length];
        let session = self.oft.directory_mut()?;
        session.rewind(&mut self.store)?;
        if length > 0 {
            session.read(&mut self.store, &mut encoded)?;
        }
        session.rewind(&mut self.store)?;
        Directory::parse(&encoded)
    }

    /// Flushes every open file and persists directory, bitmap and descriptors.
    pub fn sync(&mut self) -> Result<()> {
        for session in self.oft.sessions_mut() {
            session.flush(&mut self.store)?;
        }
        self.save_directory()?;
        self.save_bitmap()?;
        self.save_descriptors()?;
        info!("synced volume");
        Ok(())
    }

    /// Syncs, then writes every block of the device to `writer` in index order.
    pub fn save_snapshot<W: Write>(&mut self, mut writer: W) -> Result<()> {
        self.sync()?;
        let mut block = [0; BLOCK_SIZE];
        for blocknr in 0..self.store.dev.block_count() {
            self.store.read_block(blocknr, &mut block)?;
            writer.write_all(&block)?;
        }
        writer.flush()?;
        info!("saved snapshot of {} blocks", BLOCK_COUNT);
        Ok(())
    }

    pub fn save_to_path<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = File::create(path)?;
        self.save_snapshot(BufWriter::new(file))
    }

    /// Verifies the cross-structure invariants: every allocated block is referenced by
    /// exactly one descriptor and every referenced block is allocated, descriptor lengths
    /// agree with their pointers, and directory entries and occupied descriptors pair up
    /// one to one.
    pub fn check(&self) -> Result<()> {
        let mut owner = [None; BLOCK_COUNT];
        for (index, desc) in self.store.descriptors.occupied() {
            let used = desc.blocks.iter().flatten().count();
            if desc.length > MAX_FILE_SIZE
                || used != desc.block_count()
                || used != desc.length.div_ceil(BLOCK_SIZE)
            {
                return Err(FsError::Corrupted(format!(
                    "descriptor {} has {} blocks for {} bytes",
                    index, used, desc.length
                )));
            }
            for &blocknr in desc.blocks.iter().flatten() {
                if !(DATA_START..BLOCK_COUNT).contains(&blocknr) {
                    return Err(FsError::Corrupted(format!(
                        "descriptor {} points outside the data region at {}",
                        index, blocknr
                    )));
                }
                if let Some(other) = owner[blocknr] {
                    return Err(FsError::Corrupted(format!(
                        "block {} shared by descriptors {} and {}",
                        blocknr, other, index
                    )));
                }
                if !self.store.bitmap.is_allocated(blocknr) {
                    return Err(FsError::Corrupted(format!(
                        "block {} of descriptor {} is marked free",
                        blocknr, index
                    )));
                }
                owner[blocknr] = Some(index);
            }
        }
        if let Some(orphan) = self
            .store
            .bitmap
            .allocated()
            .find(|&blocknr| owner[blocknr].is_none())
        {
            return Err(FsError::Corrupted(format!(
                "block {} is allocated but unreferenced",
                orphan
            )));
        }

        let mut named = [false; DESCRIPTOR_COUNT];
        for entry in self.directory.entries() {
            if entry.descriptor == DIRECTORY || self.store.descriptors.get(entry.descriptor).is_none() {
                return Err(FsError::Corrupted(format!(
                    "{} refers to unused descriptor {}",
                    entry.name, entry.descriptor
                )));
            }
            if named[entry.descriptor] {
                return Err(FsError::Corrupted(format!(
                    "descriptor {} has more than one name",
                    entry.descriptor
                )));
            }
            named[entry.descriptor] = true;
        }
        if let Some((index, _)) = self
            .store
            .descriptors
            .occupied()
            .find(|&(index, _)| index != DIRECTORY && !named[index])
        {
            return Err(FsError::Corrupted(format!(
                "descriptor {} is in use but has no directory entry",
                index
            )));
        }

        if self.store.length(DIRECTORY)? != Directory::file_size(self.directory.len()) {
            return Err(FsError::Corrupted(
                "directory file does not match its entries".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_no_open_files(&self) -> Result<()> {
        for slot in DIRECTORY_SLOT + 1..OFT_CAPACITY {
            if let Some(session) = self.oft.get(slot) {
                let name = self
                    .directory
                    .name_of(session.descriptor())
                    .unwrap_or_default()
                    .to_string();
                return Err(FsError::FileOpen(name));
            }
        }
        Ok(())
    }
}

impl Volume<MemDisk> {
    /// Rebuilds an in-memory device from a snapshot and mounts it.
    pub fn load_snapshot<R: std::io::Read>(reader: R) -> Result<Self> {
        let volume = Self::mount(MemDisk::read_from(reader)?)?;
        info!("loaded snapshot");
        Ok(volume)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let volume = Self::mount(MemDisk::load(path)?)?;
        info!("loaded snapshot");
        Ok(volume)
    }
}

fn check_geometry<T: BlockStorage>(dev: &T) -> Result<()> {
    if dev.block_count() != BLOCK_COUNT {
        return Err(FsError::WrongGeometry(dev.block_count()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_volume() -> Volume<MemDisk> {
        Volume::format(MemDisk::new(BLOCK_COUNT)).expect("Could not format volume.")
    }

    #[test]
    fn layout_constants_are_consistent() {
        assert_eq!(DATA_START, 8);
        assert_eq!(DESCRIPTOR_COUNT, 28);
        assert_eq!(MAX_FILE_SIZE, 192);
    }

    #[test]
    fn fresh_volume_has_empty_directory() {
        let fs = create_test_volume();
        assert!(fs.list().is_empty());
        assert_eq!(fs.next_free_block(), Some(DATA_START));
        fs.check().unwrap();
    }

    #[test]
    fn directory_file_takes_first_data_block() {
        let mut fs = create_test_volume();
        fs.create("FILE").unwrap();
        assert_eq!(fs.descriptors().get(0).unwrap().blocks[0], Some(DATA_START));
        assert_eq!(fs.next_free_block(), Some(DATA_START + 1));
    }

    #[test]
    fn device_of_wrong_size_is_rejected() {
        assert!(matches!(
            Volume::format(MemDisk::new(BLOCK_COUNT - 1)),
            Err(FsError::WrongGeometry(63))
        ));
    }

    #[test]
    fn blank_device_does_not_mount() {
        assert!(matches!(
            Volume::mount(MemDisk::new(BLOCK_COUNT)),
            Err(FsError::Corrupted(_))
        ));
    }

    #[test]
    fn can_create_and_remount_formatted_volume() {
        let mut fs = create_test_volume();
        fs.create("a").unwrap();
        let dev = fs.unmount().unwrap();

        let fs = Volume::mount(dev).unwrap();
        assert_eq!(fs.list(), vec![("a".to_string(), 0)]);
    }

    #[test]
    fn loading_tables_requires_closed_files() {
        let mut fs = create_test_volume();
        fs.create("a").unwrap();
        fs.open("a").unwrap();
        assert!(matches!(fs.load_descriptors(), Err(FsError::FileOpen(name)) if name == "a"));
    }

    /// Memory disk whose writes can be made to fail.
    struct FlakyDisk {
        inner: MemDisk,
        fail_writes: bool,
    }

    impl BlockStorage for FlakyDisk {
        fn block_count(&self) -> usize {
            self.inner.block_count()
        }

        fn read_block(&mut self, blocknr: usize, buf: &mut [u8]) -> std::io::Result<()> {
            self.inner.read_block(blocknr, buf)
        }

        fn write_block(&mut self, blocknr: usize, buf: &[u8]) -> std::io::Result<()> {
            if self.fail_writes {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "device write failed",
                ));
            }
            self.inner.write_block(blocknr, buf)
        }
    }

    fn create_flaky_volume() -> Volume<FlakyDisk> {
        let dev = FlakyDisk {
            inner: MemDisk::new(BLOCK_COUNT),
            fail_writes: false,
        };
        Volume::format(dev).expect("Could not format volume.")
    }

    #[test]
    fn failed_create_leaves_no_trace() {
        let mut fs = create_flaky_volume();
        fs.create("a").unwrap();
        let descriptors = fs.free_descriptor_count();
        let blocks = fs.free_block_count();

        fs.store.dev.fail_writes = true;
        assert!(matches!(fs.create("b"), Err(FsError::Io(_))));
        assert_eq!(fs.list(), vec![("a".to_string(), 0)]);
        assert_eq!(fs.free_descriptor_count(), descriptors);
        assert_eq!(fs.free_block_count(), blocks);
        assert_eq!(fs.store.length(DIRECTORY).unwrap(), Directory::file_size(1));
        fs.check().unwrap();

        fs.store.dev.fail_writes = false;
        fs.create("b").unwrap();
        let dev = fs.unmount().unwrap();
        let fs = Volume::mount(dev).unwrap();
        assert_eq!(fs.list().len(), 2);
    }

    #[test]
    fn failed_destroy_keeps_the_file() {
        let mut fs = create_flaky_volume();
        fs.create("a").unwrap();
        fs.create("b").unwrap();
        let slot = fs.open("a").unwrap();
        fs.write(slot, &[3; 10]).unwrap();
        fs.close(slot).unwrap();
        let descriptors = fs.free_descriptor_count();
        let blocks = fs.free_block_count();

        fs.store.dev.fail_writes = true;
        assert!(matches!(fs.destroy("a"), Err(FsError::Io(_))));
        assert_eq!(
            fs.list(),
            vec![("a".to_string(), 10), ("b".to_string(), 0)]
        );
        assert_eq!(fs.free_descriptor_count(), descriptors);
        assert_eq!(fs.free_block_count(), blocks);
        fs.check().unwrap();

        fs.store.dev.fail_writes = false;
        fs.destroy("a").unwrap();
        assert_eq!(fs.list(), vec![("b".to_string(), 0)]);
        fs.check().unwrap();
    }

    #[test]
    fn position_is_only_reported_for_user_slots() {
        let mut fs = create_test_volume();
        fs.create("a").unwrap();
        let slot = fs.open("a").unwrap();
        fs.write(slot, b"abc").unwrap();

        assert_eq!(fs.position(slot).unwrap(), 3);
        assert!(matches!(fs.position(DIRECTORY_SLOT), Err(FsError::InvalidSlot(0))));
        assert!(matches!(fs.position(slot + 1), Err(FsError::InvalidSlot(_))));
    }

    #[test]
    fn check_detects_orphaned_block() {
        let mut fs = create_test_volume();
        fs.store.bitmap.allocate(DATA_START + 5);
        assert!(matches!(fs.check(), Err(FsError::Corrupted(_))));
    }
}
