//! Geometry and tunables.

/// Base page size of the PM arena.
pub const PAGE_SIZE: usize = 4096;

pub const PAGE_SHIFT: usize = 12;

/// Cache line size assumed for flush granularity and padding.
pub const CACHELINE: usize = 64;

/// File data is allocated in 2-MiB extents.
pub const FILE_BLOCK_SHIFT: usize = 21;

pub const FILE_BLOCK_SIZE: usize = 1 << FILE_BLOCK_SHIFT;

/// Pages per file extent.
pub const FILE_BLOCK_PAGE_CNT: usize = FILE_BLOCK_SIZE / PAGE_SIZE;

/// 8-byte index slots per 4-KiB index page, including the chain slot.
pub const FIDX_PER_PAGE: usize = PAGE_SIZE / 8;

/// Maximum PM nodes (sockets backed by a PM device).
pub const PM_MAX_INS: usize = 8;

/// Maximum CPUs the supervisor partitions pools across.
pub const MAX_CPU: usize = 64;

/// Size of the inode number space.
pub const MAX_INODE_NUM: usize = 32768;

/// Inode number 0 is never valid.
pub const INODE_NONE: u32 = 0;

/// Dir entries transition their ino word to this value on deletion.
pub const INODE_TOMBSTONE: u32 = 1;

/// The root directory.
pub const ROOT_INO: u32 = 2;

/// First number handed out to clients.
pub const FIRST_CLIENT_INO: u32 = 3;

pub const ROOT_PERM: u32 = 0o755;

/// Trust groups; id 0 is reserved to mean "no trust group".
pub const MAX_TGROUP: usize = 255;

/// Size of the dense pid -> tgroup map.
pub const MAX_PROCESS: usize = 1 << 22;

pub const MAX_PROCESS_PER_TGROUP: usize = 64;

/// Reader slots per lease.
pub const LEASE_MAX_OWNER: usize = 16;

/// Lease validity in timestamp-counter ticks.
pub const LEASE_PERIOD: u64 = 250_000_000;

/// Delegation request payload size; the valid flag lives on its own line.
pub const DELE_REQUEST_SIZE: usize = 128;

/// Bytes of one delegation ring, header included.
pub const RING_BYTES: usize = 16 * PAGE_SIZE;

/// Empty polls before an agent yields and checks for stop.
pub const AGENT_RING_CHECK_COUNT: u64 = 220_000;

/// Served requests between agent yield points.
pub const AGENT_REQUEST_CHECK_COUNT: u64 = 3000;

/// Completion-poll spins before the application thread yields.
pub const APP_CHECK_COUNT: u64 = 1_000_000;

/// Chunk list capacity for one translated agent request.
pub const AGENT_TASK_MAX: usize = FILE_BLOCK_PAGE_CNT + 1;

/// Per-thread notifier slots.
pub const MAX_THREADS: usize = 256;

/// Nesting levels of in-flight delegation per thread.
pub const DELE_LEVELS: usize = 4;

/// Inodes fetched from the supervisor per client refill.
pub const INODE_CHUNK: usize = 64;

/// Pages fetched from the supervisor per client block refill.
pub const BLOCK_CHUNK: usize = 4 * FILE_BLOCK_PAGE_CNT;

/// Delegate writes at or above this many bytes.
pub const WRITE_DELEGATION_LIMIT: usize = 256 * 1024;

/// Delegate reads at or above this many bytes.
pub const READ_DELEGATION_LIMIT: usize = 256 * 1024;

pub const MAX_MAP_FILE: usize = 65536;

/// Stripes of the per-inode map lock table.
pub const FILE_MAP_LOCK_SIZE: usize = 1024;

pub const NAME_MAX: usize = 255;

/// Per-CPU fd namespace size and the cpu tag shift.
pub const MAX_FD: usize = 1024;

pub const FILETABLE_CPUSHIFT: usize = 16;

pub const FILETABLE_FDMASK: i32 = (1 << FILETABLE_CPUSHIFT) - 1;

/// Library descriptors start here so they never collide with host fds.
pub const BASE_FD: i32 = 1 << 28;

/// Paths under this prefix belong to the library file system.
pub const ROOT_PATH: &str = "/pmufs";

/// Directory hash grow/shrink factor.
pub const DIR_REHASH_FACTOR: u64 = 2;

/// Initial size index of the global full-path map.
pub const GDIR_INIT_HASH_IDX: usize = 2;

/// Initial size index of a per-directory map.
pub const DIR_INIT_HASH_IDX: usize = 0;

/// Symbolic base of the mount window in a client address space.
pub const MOUNT_ADDR: u64 = 0x4000_0000_0000;

/// Symbolic bases of the shared ring region.
pub const RING_ADDR: u64 = 0x6000_0000_0000;
pub const LEASE_RING_ADDR: u64 = RING_ADDR;
pub const MAPPED_RING_ADDR: u64 = RING_ADDR + 0x10_0000;
pub const DELE_CNT_RING_ADDR: u64 = RING_ADDR + 0x20_0000;
pub const DELE_RING_ADDR: u64 = RING_ADDR + 0x40_0000;

/// One 4-KiB page of super-block state at the head of the arena.
pub const SUPER_PAGE_SIZE: usize = PAGE_SIZE;

pub const fn page_round_up(v: u64) -> u64 {
    (v + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

pub const fn page_round_down(v: u64) -> u64 {
    v & !(PAGE_SIZE as u64 - 1)
}

pub const fn cache_round_up(v: u64) -> u64 {
    (v + CACHELINE as u64 - 1) & !(CACHELINE as u64 - 1)
}

pub const fn cache_round_down(v: u64) -> u64 {
    v & !(CACHELINE as u64 - 1)
}

pub const fn file_block_round_up(v: u64) -> u64 {
    (v + FILE_BLOCK_SIZE as u64 - 1) & !(FILE_BLOCK_SIZE as u64 - 1)
}

pub const fn file_block_round_down(v: u64) -> u64 {
    v & !(FILE_BLOCK_SIZE as u64 - 1)
}
