//! A flat, single-directory file system over a fixed 64 block device.
//!
//! Files are named by up to four bytes, hold at most three blocks of data and are accessed
//! through a small open file table of buffered sessions. The whole volume can be saved to,
//! and rebuilt from, a byte-exact snapshot.
mod alloc;
mod dir;
mod error;
mod fs;
pub mod io;
mod node;
mod oft;
mod store;

pub use crate::alloc::{Bitmap, FreeBlocks, State};
pub use crate::dir::{DirEntry, Directory, DIR_ENTRY_SIZE, MAX_DIR_ENTRIES};
pub use crate::error::{ErrorKind, FsError, Result};
pub use crate::fs::*;
pub use crate::node::{Descriptor, DescriptorTable};
pub use crate::oft::DIRECTORY_SLOT;
