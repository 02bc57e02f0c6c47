mod block;
mod file;
mod mem;

pub use block::{BlockNumber, BlockStorage};
pub use file::{FileDisk, FileDiskBuilder};
pub use mem::MemDisk;
