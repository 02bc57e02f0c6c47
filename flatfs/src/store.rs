use crate::alloc::Bitmap;
use crate::error::{FsError, Result};
use crate::fs::BLOCK_SIZE;
use crate::io::{BlockNumber, BlockStorage};
use crate::node::{Descriptor, DescriptorTable};

/// The block device together with the structures that account for it. Every file, the
/// directory included, reaches its data blocks through here.
pub struct Storage<T: BlockStorage> {
    pub(crate) dev: T,
    pub(crate) bitmap: Bitmap,
    pub(crate) descriptors: DescriptorTable,
}

impl<T: BlockStorage> Storage<T> {
    pub fn new(dev: T, bitmap: Bitmap, descriptors: DescriptorTable) -> Self {
        Self {
            dev,
            bitmap,
            descriptors,
        }
    }

    pub fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        if blocknr >= self.dev.block_count() {
            return Err(FsError::BlockOutOfRange(blocknr));
        }
        self.dev.read_block(blocknr, buf)?;
        Ok(())
    }

    pub fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        if blocknr >= self.dev.block_count() {
            return Err(FsError::BlockOutOfRange(blocknr));
        }
        self.dev.write_block(blocknr, buf)?;
        Ok(())
    }

    pub fn descriptor(&self, index: usize) -> Result<&Descriptor> {
        self.descriptors
            .get(index)
            .ok_or_else(|| FsError::Corrupted(format!("descriptor {} is not in use", index)))
    }

    pub fn length(&self, index: usize) -> Result<usize> {
        Ok(self.descriptor(index)?.length)
    }

    pub fn set_length(&mut self, index: usize, length: usize) -> Result<()> {
        let desc = self
            .descriptors
            .get_mut(index)
            .ok_or_else(|| FsError::Corrupted(format!("descriptor {} is not in use", index)))?;
        desc.length = length;
        Ok(())
    }

    /// The disk block backing block `nth` of a file, if one has been allocated.
    pub fn block_of(&self, index: usize, nth: usize) -> Result<Option<BlockNumber>> {
        Ok(self.descriptor(index)?.blocks.get(nth).copied().flatten())
    }

    pub fn grow(&mut self, index: usize, additional: usize) -> Result<usize> {
        self.descriptors.grow(index, additional, &mut self.bitmap)
    }

    pub fn truncate(&mut self, index: usize, length: usize) -> Result<()> {
        self.descriptors.truncate(index, length, &mut self.bitmap)
    }

    pub fn release(&mut self, index: usize) {
        self.descriptors.release(index, &mut self.bitmap)
    }
}
