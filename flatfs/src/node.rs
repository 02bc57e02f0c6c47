use crate::alloc::Bitmap;
use crate::error::{FsError, Result};
use crate::fs::{
    BLOCK_COUNT, BLOCK_SIZE, DATA_START, DESCRIPTORS_PER_BLOCK, DESCRIPTOR_BLOCKS,
    DESCRIPTOR_COUNT, DIRECT_POINTERS, MAX_FILE_SIZE,
};

use log::{debug, warn};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Bytes occupied by one descriptor on disk.
pub const DESCRIPTOR_SIZE: usize = std::mem::size_of::<RawDescriptor>();

/// Length value marking an unoccupied slot on disk.
const FREE_SLOT: u32 = u32::MAX;

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
/// On-disk form of a descriptor. A zero block pointer is unused; block 0 always belongs to
/// the bitmap so it can never be a file's data block.
struct RawDescriptor {
    length: U32,
    blocks: [U32; DIRECT_POINTERS],
}

/// Storage record for one file: its length in bytes and the data blocks holding it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub length: usize,
    pub blocks: [Option<usize>; DIRECT_POINTERS],
}

impl Descriptor {
    /// Number of leading block pointers in use.
    pub fn block_count(&self) -> usize {
        self.blocks.iter().take_while(|block| block.is_some()).count()
    }

    /// Bytes the allocated blocks can hold.
    pub fn capacity(&self) -> usize {
        self.block_count() * BLOCK_SIZE
    }

    fn to_raw(slot: &Option<Descriptor>) -> RawDescriptor {
        match slot {
            Some(desc) => RawDescriptor {
                length: U32::new(desc.length as u32),
                blocks: desc
                    .blocks
                    .map(|block| U32::new(block.map_or(0, |blocknr| blocknr as u32))),
            },
            None => RawDescriptor {
                length: U32::new(FREE_SLOT),
                blocks: [U32::new(0); DIRECT_POINTERS],
            },
        }
    }

    fn from_raw(index: usize, raw: &RawDescriptor) -> Result<Option<Descriptor>> {
        let length = raw.length.get();
        if length == FREE_SLOT {
            if raw.blocks.iter().any(|block| block.get() != 0) {
                return Err(FsError::Corrupted(format!(
                    "free descriptor {} holds block pointers",
                    index
                )));
            }
            return Ok(None);
        }

        let length = length as usize;
        if length > MAX_FILE_SIZE {
            return Err(FsError::Corrupted(format!(
                "descriptor {} length {} exceeds {}",
                index, length, MAX_FILE_SIZE
            )));
        }

        let mut desc = Descriptor {
            length,
            blocks: [None; DIRECT_POINTERS],
        };
        for (slot, raw_block) in desc.blocks.iter_mut().zip(raw.blocks.iter()) {
            let blocknr = raw_block.get() as usize;
            if blocknr == 0 {
                continue;
            }
            if !(DATA_START..BLOCK_COUNT).contains(&blocknr) {
                return Err(FsError::Corrupted(format!(
                    "descriptor {} points at reserved or missing block {}",
                    index, blocknr
                )));
            }
            *slot = Some(blocknr);
        }

        let used = desc.blocks.iter().filter(|block| block.is_some()).count();
        if used != desc.block_count() || used != length.div_ceil(BLOCK_SIZE) {
            return Err(FsError::Corrupted(format!(
                "descriptor {} has {} block pointers for {} bytes",
                index, used, length
            )));
        }
        Ok(Some(desc))
    }
}

/// Fixed table of descriptors. Slot 0 is the directory and is always occupied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorTable {
    slots: [Option<Descriptor>; DESCRIPTOR_COUNT],
}

impl DescriptorTable {
    pub fn new() -> Self {
        let mut slots = [None; DESCRIPTOR_COUNT];
        slots[0] = Some(Descriptor::default());
        Self { slots }
    }

    pub fn get(&self, index: usize) -> Option<&Descriptor> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Descriptor> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Indices of every occupied slot, the directory's included.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &Descriptor)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|desc| (index, desc)))
    }

    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }

    /// Claims the lowest free slot for an empty file.
    pub fn allocate(&mut self) -> Result<usize> {
        let index = (1..DESCRIPTOR_COUNT)
            .find(|&index| self.slots[index].is_none())
            .ok_or(FsError::NoFreeDescriptor)?;
        self.slots[index] = Some(Descriptor::default());
        debug!("allocated descriptor {}", index);
        Ok(index)
    }

    /// Frees the slot along with every data block it references.
    pub fn release(&mut self, index: usize, bitmap: &mut Bitmap) {
        debug_assert!(index != 0, "the directory descriptor is never released");
        if let Some(desc) = self.slots.get_mut(index).and_then(Option::take) {
            for blocknr in desc.blocks.iter().flatten() {
                bitmap.release(*blocknr);
            }
            debug!("released descriptor {}", index);
        }
    }

    /// Makes room for `additional` bytes past the current length, claiming blocks first-fit
    /// until the new length is covered, the pointers run out or the bitmap does. Returns how
    /// many of the requested bytes now fit. Running into the file size ceiling is not an
    /// error; running out of blocks before a single byte fits is.
    pub fn grow(&mut self, index: usize, additional: usize, bitmap: &mut Bitmap) -> Result<usize> {
        let desc = self
            .get_mut(index)
            .ok_or_else(|| FsError::Corrupted(format!("descriptor {} is not in use", index)))?;

        let target = (desc.length + additional).min(MAX_FILE_SIZE);
        let needed = target.div_ceil(BLOCK_SIZE);
        while desc.block_count() < needed {
            match bitmap.find_free() {
                Some(blocknr) => {
                    bitmap.allocate(blocknr);
                    let next = desc.block_count();
                    desc.blocks[next] = Some(blocknr);
                }
                None => {
                    warn!("no free block to grow descriptor {}", index);
                    break;
                }
            }
        }

        let applied = desc.capacity().min(target) - desc.length;
        if applied == 0 && target > desc.length {
            return Err(FsError::NoFreeBlock);
        }
        Ok(applied)
    }

    /// Shrinks a file to `length` bytes, freeing the blocks past the new end.
    pub fn truncate(&mut self, index: usize, length: usize, bitmap: &mut Bitmap) -> Result<()> {
        let desc = self
            .get_mut(index)
            .ok_or_else(|| FsError::Corrupted(format!("descriptor {} is not in use", index)))?;
        debug_assert!(length <= desc.length);

        let keep = length.div_ceil(BLOCK_SIZE);
        for block in desc.blocks.iter_mut().skip(keep) {
            if let Some(blocknr) = block.take() {
                bitmap.release(blocknr);
            }
        }
        desc.length = length;
        Ok(())
    }

    /// Serializes the whole table across its reserved blocks, slot order.
    pub fn serialize(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(DESCRIPTOR_BLOCKS * BLOCK_SIZE);
        for slot in self.slots.iter() {
            encoded.extend_from_slice(Descriptor::to_raw(slot).as_bytes());
        }
        // Pad out the final block.
        encoded.resize(DESCRIPTOR_BLOCKS * BLOCK_SIZE, 0);
        encoded
    }

    /// Reads the table back from the concatenation of its reserved blocks.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() != DESCRIPTOR_BLOCKS * BLOCK_SIZE {
            return Err(FsError::Corrupted(format!(
                "descriptor table must span {} bytes",
                DESCRIPTOR_BLOCKS * BLOCK_SIZE
            )));
        }

        let mut slots = [None; DESCRIPTOR_COUNT];
        for (index, chunk) in buf
            .chunks_exact(DESCRIPTOR_SIZE)
            .take(DESCRIPTOR_COUNT)
            .enumerate()
        {
            let raw = RawDescriptor::read_from_bytes(chunk).map_err(|_| {
                FsError::Corrupted(format!("descriptor {} is truncated", index))
            })?;
            slots[index] = Descriptor::from_raw(index, &raw)?;
        }

        if slots[0].is_none() {
            return Err(FsError::Corrupted(
                "directory descriptor is missing".to_string(),
            ));
        }
        Ok(Self { slots })
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

// The table must fill its reserved blocks exactly.
const _: () = assert!(DESCRIPTOR_SIZE * DESCRIPTORS_PER_BLOCK == BLOCK_SIZE);
