use crate::error::{FsError, Result};
use crate::fs::{BLOCK_COUNT, BLOCK_SIZE, DATA_BLOCKS, DATA_START};
use log::debug;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, PartialEq, Eq)]
pub struct Bitmap {
    /// One bit per data region block. Bit `i` of byte `n` tracks block
    /// `DATA_START + n * 8 + i`; everything past the data region stays zero.
    bitmap: [u8; BLOCK_SIZE],
}

impl Bitmap {
    pub fn new() -> Self {
        Self {
            bitmap: [0; BLOCK_SIZE],
        }
    }

    /// Reads the bitmap back from its on-disk block.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let map = Bitmap::read_from_bytes(buf).map_err(|_| {
            FsError::Corrupted(format!("bitmap block must be {} bytes", BLOCK_SIZE))
        })?;

        let stray = (DATA_BLOCKS..BLOCK_SIZE * 8)
            .any(|bit| map.bitmap[bit / 8] & (1 << (bit % 8)) != 0);
        if stray {
            return Err(FsError::Corrupted(
                "bitmap marks blocks outside the data region".to_string(),
            ));
        }
        Ok(map)
    }

    pub fn serialize(&self) -> &[u8] {
        self.as_bytes()
    }

    pub fn get(&self, blocknr: usize) -> State {
        let (byte, mask) = Self::locate(blocknr);
        if self.bitmap[byte] & mask == 0 {
            State::Free
        } else {
            State::Used
        }
    }

    pub fn is_allocated(&self, blocknr: usize) -> bool {
        self.get(blocknr) == State::Used
    }

    pub fn allocate(&mut self, blocknr: usize) {
        let (byte, mask) = Self::locate(blocknr);
        debug_assert!(self.bitmap[byte] & mask == 0, "block {} already allocated", blocknr);
        self.bitmap[byte] |= mask;
        debug!("allocated block {}", blocknr);
    }

    pub fn release(&mut self, blocknr: usize) {
        let (byte, mask) = Self::locate(blocknr);
        debug_assert!(self.bitmap[byte] & mask != 0, "block {} already free", blocknr);
        self.bitmap[byte] &= !mask;
        debug!("released block {}", blocknr);
    }

    /// The lowest numbered free block, if any. Allocation order is strictly first-fit so
    /// the same sequence of operations always lands on the same blocks.
    pub fn find_free(&self) -> Option<usize> {
        self.free_blocks().next()
    }

    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            marker: DATA_START,
            bitmap: self,
        }
    }

    pub fn free_count(&self) -> usize {
        self.free_blocks().count()
    }

    /// Every allocated block in ascending order.
    pub fn allocated(&self) -> impl Iterator<Item = usize> + '_ {
        (DATA_START..BLOCK_COUNT).filter(move |&blocknr| self.is_allocated(blocknr))
    }

    fn locate(blocknr: usize) -> (usize, u8) {
        assert!(
            (DATA_START..BLOCK_COUNT).contains(&blocknr),
            "block {} is outside the data region",
            blocknr
        );
        let bit = blocknr - DATA_START;
        (bit / 8, 1 << (bit % 8))
    }
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks the data region in ascending order yielding blocks that are free at the time
/// they are reached.
pub struct FreeBlocks<'a> {
    /// Keeps track of the next starting place for looking for available blocks.
    marker: usize,
    bitmap: &'a Bitmap,
}

impl Iterator for FreeBlocks<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.marker < BLOCK_COUNT {
            let blocknr = self.marker;
            self.marker += 1;
            if let State::Free = self.bitmap.get(blocknr) {
                return Some(blocknr);
            }
        }
        None
    }
}
