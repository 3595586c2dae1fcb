//! In-memory layout of the shared arena
//!
//! The mapping is zero-filled by `ftruncate`, and all-zero is a valid
//! initial state for every field (state 0 is `Empty`).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64};

use crate::names::CHANNEL_NAME_LEN;

pub(crate) const ARENA_MAGIC: u32 = 0x4558_414d; // 'EXAM'
pub(crate) const ARENA_VERSION: u32 = 1;

/// Largest slot table a teacher may create
pub const MAX_CAPACITY: u32 = 1024;

#[repr(C)]
pub(crate) struct ArenaHeader {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub capacity: AtomicU32,
    pub active_count: AtomicU32,
    /// pid of the process currently holding the table lock (0 if none)
    pub lock_holder: AtomicU32,
    pub shutting_down: AtomicBool,
    pub next_attempt: AtomicU64,
}

#[repr(C)]
pub(crate) struct SlotRecord {
    pub state: AtomicU32,
    pub owner: AtomicU32,
    pub ticket: AtomicU32,
    pub grade: AtomicI32,
    pub attempt: AtomicU64,
    /// Written only under the table lock
    pub grade_channel: UnsafeCell<[u8; CHANNEL_NAME_LEN]>,
    /// Written only under the table lock
    pub ack_channel: UnsafeCell<[u8; CHANNEL_NAME_LEN]>,
}

pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<ArenaHeader>();
pub(crate) const SLOT_SIZE: usize = std::mem::size_of::<SlotRecord>();

const _: () = assert!(HEADER_SIZE % std::mem::align_of::<SlotRecord>() == 0);

/// Bytes needed for a table of `capacity` slots
pub fn arena_size(capacity: usize) -> usize {
    HEADER_SIZE + capacity * SLOT_SIZE
}

/// Copy `name` into a fixed field, NUL-padded
///
/// # Safety
/// The caller must hold the table lock.
pub(crate) unsafe fn write_name(cell: &UnsafeCell<[u8; CHANNEL_NAME_LEN]>, name: &str) {
    // SAFETY: exclusive access is guaranteed by the table lock.
    let buf = unsafe { &mut *cell.get() };
    buf.fill(0);
    let len = name.len().min(CHANNEL_NAME_LEN - 1);
    buf[..len].copy_from_slice(&name.as_bytes()[..len]);
}

/// Read a NUL-terminated name from a fixed field
///
/// # Safety
/// The caller must hold the table lock.
pub(crate) unsafe fn read_name(cell: &UnsafeCell<[u8; CHANNEL_NAME_LEN]>) -> String {
    // SAFETY: writers hold the table lock, as does the caller.
    let buf = unsafe { &*cell.get() };
    let end = buf.iter().position(|&b| b == 0).unwrap_or(CHANNEL_NAME_LEN);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
