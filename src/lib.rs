//! pmufs: a user-space persistent-memory file system.
//!
//! The design follows the "devolved kernel" split:
//!   + Supervisor (`kfs`): owns the PM arena, the global block and inode
//!     pools, trust groups, leases, the page mapper, delegation rings and
//!     the per-socket agent threads. Served synchronously through a small
//!     numbered command surface.
//!   + Client (`libfs`): linked into each application; runs the common
//!     read/write path entirely in user space over the mapped arena, with
//!     per-CPU allocator mirrors, a DRAM directory cache, a flat file-index
//!     mirror, a lite undo journal, and a delegation send path for bulk
//!     copies.
//!
//! Both halves are explicit context objects; nothing lives in globals.

#![warn(rust_2018_idioms)]
#![warn(unused_import_braces)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::result_unit_err)]

pub mod error;
pub mod kfs;
pub mod layout;
pub mod libfs;
pub mod params;
pub mod pm;
pub mod pmem;
pub mod range_tree;
pub mod ring_buffer;
pub mod stat;

pub use error::{Error, Result};
