use crate::fs::BLOCK_SIZE;
use crate::io::{BlockNumber, BlockStorage};
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};

/// Emulates a block device in userspace using a fixed-size file as block storage.
pub struct FileDisk {
    /// Exactly `block_count` blocks long.
    fd: File,
    block_count: usize,
}

impl FileDisk {
    /// Wraps a file previously prepared by [`FileDiskBuilder`], keeping its content.
    pub fn open(fd: File) -> std::io::Result<Self> {
        let len = fd.metadata()?.len() as usize;
        if len % BLOCK_SIZE != 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                "disk file is not a whole number of blocks",
            ));
        }
        Ok(FileDisk {
            fd,
            block_count: len / BLOCK_SIZE,
        })
    }

    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    pub fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()
    }

    fn seek_to(&mut self, blocknr: BlockNumber, len: usize) -> std::io::Result<()> {
        if blocknr >= self.block_count {
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
        self.fd
            .seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;
        Ok(())
    }
}

impl BlockStorage for FileDisk {
    fn block_count(&self) -> usize {
        self.block_count
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        self.seek_to(blocknr, buf.len())?;
        self.fd.read_exact(buf)
    }

    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        self.seek_to(blocknr, buf.len())?;
        self.fd.write_all(buf)
    }
}

pub struct FileDiskBuilder {
    fd: File,
    block_count: usize,
}

impl From<File> for FileDiskBuilder {
    fn from(fd: File) -> Self {
        FileDiskBuilder {
            fd,
            block_count: crate::fs::BLOCK_COUNT,
        }
    }
}

impl FileDiskBuilder {
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Zeroes the file out to the requested size. Whatever it held before is lost.
    pub fn build(mut self) -> std::io::Result<FileDisk> {
        self.zero_blocks()?;
        Ok(FileDisk {
            fd: self.fd,
            block_count: self.block_count,
        })
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        self.fd.set_len(0)?;
        self.fd.seek(SeekFrom::Start(0))?;
        let mut bfd = BufWriter::new(&self.fd);
        for _ in 0..self.block_count {
            bfd.write_all(&[0; BLOCK_SIZE])?;
        }
        bfd.flush()
    }
}
