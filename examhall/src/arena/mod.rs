//! Shared arena: the slot table mapped into every participant
//!
//! The teacher creates the arena (shared-memory object, table lock and
//! work-ready counter); students attach to it. All slot mutation happens
//! through [`SharedArena::with_table_lock`].

pub mod layout;
pub mod slot;
pub mod table;

pub use layout::{MAX_CAPACITY, arena_size};
pub use slot::{Claimed, ReleaseKind, SENTINEL_GRADE, SlotState, SlotView, check_transition};
pub use table::{ArenaSnapshot, TableGuard};

use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open};
use nix::sys::stat::Mode;
use tracing::{debug, info, warn};

use crate::error::{ExamError, Result};
use crate::names::Names;
use crate::sync::{NamedSemaphore, ResourceKind, ResourceLedger, WaitOutcome, semaphore, unlink_shared_memory};
use layout::{ARENA_MAGIC, ARENA_VERSION, ArenaHeader, HEADER_SIZE, SlotRecord};

/// Default interval after which a blocked lock waiter checks for a dead holder
pub const DEFAULT_LOCK_PROBE: Duration = Duration::from_millis(500);

/// A mapped slot table plus its table lock and work-ready counter
pub struct SharedArena {
    names: Names,
    base: NonNull<u8>,
    len: usize,
    capacity: usize,
    table_lock: NamedSemaphore,
    work_ready: Arc<NamedSemaphore>,
    lock_probe: Duration,
}

// SAFETY: shared fields are atomics; the channel-name cells are only touched
// while holding the cross-process table lock.
unsafe impl Send for SharedArena {}
unsafe impl Sync for SharedArena {}

impl std::fmt::Debug for SharedArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedArena")
            .field("names", &self.names)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Validate a requested slot count
pub fn validate_capacity(capacity: u32) -> Result<()> {
    if (1..=MAX_CAPACITY).contains(&capacity) {
        Ok(())
    } else {
        Err(ExamError::InvalidCapacity {
            capacity,
            max: MAX_CAPACITY,
        })
    }
}

fn map_shared(file: &File, len: usize, name: &str) -> Result<NonNull<u8>> {
    let length = NonZeroUsize::new(len).ok_or_else(|| ExamError::CorruptLayout(format!("{} is empty", name)))?;
    // SAFETY: mapping a freshly opened shared-memory fd; the result is only
    // accessed within `len` bytes and unmapped once in Drop.
    let ptr = unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file,
            0,
        )
    }
    .map_err(|errno| ExamError::Os {
        name: name.to_string(),
        errno,
    })?;
    Ok(ptr.cast())
}

impl SharedArena {
    /// Create a zeroed arena with `capacity` slots (teacher side)
    ///
    /// Stale names left by a crashed teacher are removed first. Every name
    /// created is recorded in `ledger`, so a failure halfway through is
    /// cleaned up when the ledger is released.
    pub fn create(names: &Names, capacity: u32, ledger: &mut ResourceLedger) -> Result<Self> {
        debug!(?names, capacity, "SharedArena::create: called");
        validate_capacity(capacity)?;

        let arena_name = names.arena();
        let lock_name = names.table_lock();
        let queue_name = names.work_ready();

        unlink_shared_memory(&arena_name)?;
        semaphore::unlink(&lock_name)?;
        semaphore::unlink(&queue_name)?;

        // Semaphores first: once the arena is visible, attaching students can
        // rely on them existing.
        let table_lock = NamedSemaphore::create(&lock_name, 1)?;
        ledger.track("teacher", ResourceKind::Semaphore, &lock_name);
        let work_ready = NamedSemaphore::create(&queue_name, 0)?;
        ledger.track("teacher", ResourceKind::Semaphore, &queue_name);

        let fd = shm_open(
            arena_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|errno| ExamError::from_errno(&arena_name, errno))?;
        ledger.track("teacher", ResourceKind::SharedMemory, &arena_name);

        let file = File::from(fd);
        let len = arena_size(capacity as usize);
        file.set_len(len as u64)?;
        let base = map_shared(&file, len, &arena_name)?;

        let arena = Self {
            names: names.clone(),
            base,
            len,
            capacity: capacity as usize,
            table_lock,
            work_ready: Arc::new(work_ready),
            lock_probe: DEFAULT_LOCK_PROBE,
        };

        let header = arena.header();
        header.capacity.store(capacity, Ordering::Relaxed);
        header.active_count.store(0, Ordering::Relaxed);
        header.shutting_down.store(false, Ordering::Relaxed);
        header.version.store(ARENA_VERSION, Ordering::Relaxed);
        header.magic.store(ARENA_MAGIC, Ordering::Release);

        info!(name = %arena_name, capacity, bytes = len, "Arena created");
        Ok(arena)
    }

    /// Map an existing arena (student side)
    ///
    /// `NotFound` means no teacher is running.
    pub fn attach(names: &Names) -> Result<Self> {
        let arena_name = names.arena();
        debug!(name = %arena_name, "SharedArena::attach: called");

        let fd = match shm_open(arena_name.as_str(), OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::ENOENT) => return Err(ExamError::NotFound { name: arena_name }),
            Err(errno) => return Err(ExamError::from_errno(&arena_name, errno)),
        };
        let file = File::from(fd);
        let len = file.metadata()?.len() as usize;
        if len < HEADER_SIZE {
            return Err(ExamError::CorruptLayout(format!(
                "{} is {} bytes, smaller than the {} byte header",
                arena_name, len, HEADER_SIZE
            )));
        }

        let base = map_shared(&file, len, &arena_name)?;
        // Unmap on every early return below.
        let mapping = Mapping { base, len };

        // SAFETY: the mapping is at least HEADER_SIZE bytes and page aligned.
        let header = unsafe { &*(base.as_ptr() as *const ArenaHeader) };
        if header.magic.load(Ordering::Acquire) != ARENA_MAGIC {
            return Err(ExamError::CorruptLayout(format!("{} has no valid header", arena_name)));
        }
        let version = header.version.load(Ordering::Relaxed);
        if version != ARENA_VERSION {
            return Err(ExamError::CorruptLayout(format!(
                "{} has layout version {}, expected {}",
                arena_name, version, ARENA_VERSION
            )));
        }
        let capacity = header.capacity.load(Ordering::Relaxed);
        if validate_capacity(capacity).is_err() {
            return Err(ExamError::CorruptLayout(format!(
                "{} declares capacity {}",
                arena_name, capacity
            )));
        }
        let needed = arena_size(capacity as usize);
        if len < needed {
            return Err(ExamError::CorruptLayout(format!(
                "{} is {} bytes but capacity {} needs {}",
                arena_name, len, capacity, needed
            )));
        }

        let table_lock = NamedSemaphore::open(&names.table_lock())?;
        let work_ready = NamedSemaphore::open(&names.work_ready())?;

        std::mem::forget(mapping);
        debug!(name = %arena_name, capacity, "SharedArena::attach: attached");
        Ok(Self {
            names: names.clone(),
            base,
            len,
            capacity: capacity as usize,
            table_lock,
            work_ready: Arc::new(work_ready),
            lock_probe: DEFAULT_LOCK_PROBE,
        })
    }

    /// Override the dead-holder probe interval
    pub fn with_lock_probe(mut self, probe: Duration) -> Self {
        self.lock_probe = probe;
        self
    }

    pub fn names(&self) -> &Names {
        &self.names
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn work_ready(&self) -> &Arc<NamedSemaphore> {
        &self.work_ready
    }

    /// Sticky shutdown flag; readable without the lock
    pub fn is_shutting_down(&self) -> bool {
        self.header().shutting_down.load(Ordering::Acquire)
    }

    /// Write the grade for a slot the caller exclusively owns for this attempt
    pub fn publish_grade(&self, index: usize, grade: i32) -> Result<()> {
        self.record(index)?.grade.store(grade, Ordering::Release);
        Ok(())
    }

    /// Read the grade after the grade channel fired
    pub fn read_grade(&self, index: usize) -> Result<i32> {
        Ok(self.record(index)?.grade.load(Ordering::Acquire))
    }

    /// Run `f` while holding the table lock
    ///
    /// The lock is released when `f` returns, including on panic.
    pub fn with_table_lock<R>(&self, f: impl FnOnce(&mut TableGuard<'_>) -> R) -> Result<R> {
        let mut guard = self.lock()?;
        Ok(f(&mut guard))
    }

    /// Acquire the table lock
    ///
    /// If the lock stays unavailable for a probe interval and the recorded
    /// holder process is gone, ownership is inherited by exactly one waiter.
    pub fn lock(&self) -> Result<TableGuard<'_>> {
        let me = std::process::id();
        let holder_field = &self.header().lock_holder;
        loop {
            match self.table_lock.wait_timeout(self.lock_probe)? {
                WaitOutcome::Acquired => {
                    holder_field.store(me, Ordering::Release);
                    return Ok(TableGuard::new(self));
                }
                WaitOutcome::TimedOut => {
                    let holder = holder_field.load(Ordering::Acquire);
                    if holder == 0 || holder == me || process_alive(holder) {
                        continue;
                    }
                    if holder_field
                        .compare_exchange(holder, me, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        warn!(dead_holder = holder, "Inherited table lock from a dead process");
                        return Ok(TableGuard::new(self));
                    }
                }
            }
        }
    }

    pub(crate) fn unlock(&self) {
        self.header().lock_holder.store(0, Ordering::Release);
        if let Err(e) = self.table_lock.signal() {
            warn!(error = %e, "Failed to release table lock");
        }
    }

    pub(crate) fn header(&self) -> &ArenaHeader {
        // SAFETY: base points to a live mapping of at least HEADER_SIZE bytes.
        unsafe { &*(self.base.as_ptr() as *const ArenaHeader) }
    }

    pub(crate) fn record(&self, index: usize) -> Result<&SlotRecord> {
        if index >= self.capacity {
            return Err(ExamError::SlotOutOfRange {
                index,
                capacity: self.capacity,
            });
        }
        // SAFETY: attach/create verified len >= arena_size(capacity), and the
        // slot array starts right after the header at proper alignment.
        unsafe {
            let first = self.base.as_ptr().add(HEADER_SIZE) as *const SlotRecord;
            Ok(&*first.add(index))
        }
    }
}

impl Drop for SharedArena {
    fn drop(&mut self) {
        drop(Mapping {
            base: self.base,
            len: self.len,
        });
    }
}

/// Owned mmap region, unmapped on drop
struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/len describe a mapping created by map_shared that is
        // unmapped exactly once.
        if let Err(errno) = unsafe { munmap(self.base.cast(), self.len) } {
            warn!(%errno, "munmap failed");
        }
    }
}

/// Check whether a process exists (signal 0 probes without delivering)
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(tag: &str) -> Names {
        let id = uuid::Uuid::now_v7().simple().to_string();
        Names::new(format!("{}{}", tag, &id[id.len() - 8..])).unwrap()
    }

    #[test]
    fn test_create_rejects_bad_capacity_before_creating_anything() {
        let names = names("cap");
        let mut ledger = ResourceLedger::new();
        for capacity in [0, MAX_CAPACITY + 1] {
            let err = SharedArena::create(&names, capacity, &mut ledger).unwrap_err();
            assert!(matches!(err, ExamError::InvalidCapacity { .. }));
        }
        assert!(ledger.live().is_empty());
        assert!(SharedArena::attach(&names).unwrap_err().is_not_found());
    }

    #[test]
    fn test_attach_without_teacher_is_not_found() {
        let err = SharedArena::attach(&names("none")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_create_then_attach_shares_state() {
        let names = names("share");
        let mut ledger = ResourceLedger::new();
        let teacher = SharedArena::create(&names, 4, &mut ledger).unwrap();
        let student = SharedArena::attach(&names).unwrap();

        assert_eq!(student.capacity(), 4);
        assert!(!student.is_shutting_down());

        teacher.header().shutting_down.store(true, Ordering::Release);
        assert!(student.is_shutting_down());

        teacher.publish_grade(2, 5).unwrap();
        assert_eq!(student.read_grade(2).unwrap(), 5);
        assert!(student.read_grade(4).is_err());

        drop(student);
        drop(teacher);
        ledger.release_all().unwrap();
        assert!(SharedArena::attach(&names).unwrap_err().is_not_found());
    }

    #[test]
    fn test_attach_rejects_truncated_region() {
        let names = names("trunc");
        let mut ledger = ResourceLedger::new();
        let teacher = SharedArena::create(&names, 8, &mut ledger).unwrap();

        let fd = shm_open(names.arena().as_str(), OFlag::O_RDWR, Mode::empty()).unwrap();
        File::from(fd).set_len(arena_size(2) as u64).unwrap();

        let err = SharedArena::attach(&names).unwrap_err();
        assert!(matches!(err, ExamError::CorruptLayout(_)));

        drop(teacher);
        ledger.release_all().unwrap();
    }

    #[test]
    fn test_create_replaces_stale_names() {
        let names = names("stale");
        let stale_lock = NamedSemaphore::create(&names.table_lock(), 0).unwrap();

        let mut ledger = ResourceLedger::new();
        let arena = SharedArena::create(&names, 1, &mut ledger).unwrap();
        // The fresh table lock starts unlocked despite the stale one at count 0
        arena.with_table_lock(|table| table.capacity()).unwrap();

        drop(arena);
        drop(stale_lock);
        ledger.release_all().unwrap();
    }

    #[test]
    fn test_lock_released_on_panic() {
        let names = names("panic");
        let mut ledger = ResourceLedger::new();
        let arena = Arc::new(SharedArena::create(&names, 1, &mut ledger).unwrap());

        let inner = Arc::clone(&arena);
        let result = std::thread::spawn(move || {
            inner
                .with_table_lock(|_| -> () { panic!("boom") })
                .unwrap();
        })
        .join();
        assert!(result.is_err());

        // Would block forever if the guard leaked
        assert_eq!(arena.with_table_lock(|t| t.capacity()).unwrap(), 1);
        drop(arena);
        ledger.release_all().unwrap();
    }

    #[test]
    fn test_dead_holder_is_taken_over() {
        let names = names("dead");
        let mut ledger = ResourceLedger::new();
        let arena = SharedArena::create(&names, 1, &mut ledger)
            .unwrap()
            .with_lock_probe(Duration::from_millis(20));

        // Simulate a holder process that died while holding the lock
        arena.table_lock.wait().unwrap();
        arena.header().lock_holder.store(i32::MAX as u32, Ordering::Release);

        let capacity = arena.with_table_lock(|t| t.capacity()).unwrap();
        assert_eq!(capacity, 1);
        // Lock is usable again afterwards
        assert_eq!(arena.with_table_lock(|t| t.active_count()).unwrap(), 0);

        drop(arena);
        ledger.release_all().unwrap();
    }

    #[test]
    #[serial_test::serial]
    fn test_default_names_round_trip() {
        let names = Names::default();
        let mut ledger = ResourceLedger::new();
        let teacher = SharedArena::create(&names, 2, &mut ledger).unwrap();
        let student = SharedArena::attach(&names).unwrap();
        assert_eq!(student.names().arena(), "/exam_shm");
        assert_eq!(student.capacity(), 2);

        drop(student);
        drop(teacher);
        ledger.release_all().unwrap();
        assert!(ledger.live().is_empty());
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(i32::MAX as u32));
    }
}
