use crate::fs::BLOCK_SIZE;
use crate::io::{BlockNumber, BlockStorage};
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::Path;

/// Emulates a block device in memory. The whole device can be written out to, and rebuilt
/// from, any byte stream as a snapshot: every block verbatim, in index order.
#[derive(Clone, PartialEq, Eq)]
pub struct MemDisk {
    blocks: Vec<[u8; BLOCK_SIZE]>,
}

impl MemDisk {
    /// Creates a zeroed device of `nblocks` blocks.
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: vec![[0; BLOCK_SIZE]; nblocks],
        }
    }

    /// Rebuilds a device from a snapshot. The stream must hold a whole number of blocks.
    pub fn read_from<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        if raw.len() % BLOCK_SIZE != 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                "snapshot is not a whole number of blocks",
            ));
        }

        let blocks = raw
            .chunks_exact(BLOCK_SIZE)
            .map(|chunk| {
                let mut block = [0; BLOCK_SIZE];
                block.copy_from_slice(chunk);
                block
            })
            .collect();
        Ok(Self { blocks })
    }

    /// Writes every block, in index order, to `writer`.
    pub fn write_to<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        for block in &self.blocks {
            writer.write_all(block)?;
        }
        writer.flush()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        Self::read_from(BufReader::new(File::open(path)?))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        self.write_to(BufWriter::new(File::create(path)?))
    }

    fn check_access(&self, blocknr: BlockNumber, len: usize) -> std::io::Result<()> {
        if blocknr >= self.blocks.len() {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block out of range",
            ));
        }
        if len != BLOCK_SIZE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer length must equal block size",
            ));
        }
        Ok(())
    }
}

impl BlockStorage for MemDisk {
    fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_access(blocknr, buf.len())?;
        buf.copy_from_slice(&self.blocks[blocknr]);
        Ok(())
    }

    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        self.check_access(blocknr, buf.len())?;
        self.blocks[blocknr].copy_from_slice(buf);
        Ok(())
    }
}
