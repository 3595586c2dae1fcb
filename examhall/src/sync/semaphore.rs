//! Named POSIX counting semaphores

use std::ffi::CString;
use std::ptr::NonNull;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use tracing::debug;

use crate::error::{ExamError, Result};

const SEM_MODE: libc::c_uint = 0o600;

/// Result of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Acquired,
    TimedOut,
}

/// Handle to a globally named counting semaphore
///
/// Dropping the handle only closes it. The name stays visible until
/// [`NamedSemaphore::destroy`] is called by the owning participant.
#[derive(Debug)]
pub struct NamedSemaphore {
    name: String,
    raw: NonNull<libc::sem_t>,
}

// SAFETY: sem_post/sem_wait/sem_close are thread-safe on a valid handle, and
// the handle stays valid until Drop.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

fn c_name(name: &str) -> Result<CString> {
    let invalid = |reason: &str| ExamError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if !name.starts_with('/') || name[1..].contains('/') {
        return Err(invalid("must be '/' followed by a name without slashes"));
    }
    if name.len() < 2 || name.len() > 251 {
        return Err(invalid("length must be 1..=250 after the leading '/'"));
    }
    CString::new(name).map_err(|_| invalid("contains a NUL byte"))
}

fn to_timespec(deadline: SystemTime) -> libc::timespec {
    let since_epoch = deadline.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    libc::timespec {
        tv_sec: since_epoch.as_secs() as libc::time_t,
        tv_nsec: since_epoch.subsec_nanos() as libc::c_long,
    }
}

impl NamedSemaphore {
    /// Create a new semaphore; fails if the name is already taken
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        debug!(name, initial, "NamedSemaphore::create: called");
        let c = c_name(name)?;
        // SAFETY: c is a valid NUL-terminated string; with O_CREAT sem_open
        // takes (mode, value) as its variadic arguments.
        let raw = unsafe {
            libc::sem_open(
                c.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                SEM_MODE,
                initial as libc::c_uint,
            )
        };
        Self::from_raw(name, raw)
    }

    /// Attach to an existing semaphore
    pub fn open(name: &str) -> Result<Self> {
        debug!(name, "NamedSemaphore::open: called");
        let c = c_name(name)?;
        // SAFETY: c is a valid NUL-terminated string.
        let raw = unsafe { libc::sem_open(c.as_ptr(), 0) };
        Self::from_raw(name, raw)
    }

    fn from_raw(name: &str, raw: *mut libc::sem_t) -> Result<Self> {
        if raw == libc::SEM_FAILED {
            return Err(ExamError::last_os(name));
        }
        let raw = NonNull::new(raw).ok_or_else(|| ExamError::last_os(name))?;
        Ok(Self {
            name: name.to_string(),
            raw,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Increment the count, waking one waiter
    pub fn signal(&self) -> Result<()> {
        // SAFETY: raw is a live handle from sem_open.
        if unsafe { libc::sem_post(self.raw.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(ExamError::last_os(&self.name))
        }
    }

    /// Post without reporting errors
    ///
    /// sem_post is async-signal-safe, so this may run from a signal handler
    /// context where nothing can be logged or allocated.
    pub fn signal_unchecked(&self) {
        // SAFETY: raw is a live handle from sem_open.
        unsafe {
            libc::sem_post(self.raw.as_ptr());
        }
    }

    /// Block until the count is positive, then decrement it
    pub fn wait(&self) -> Result<()> {
        loop {
            // SAFETY: raw is a live handle from sem_open.
            if unsafe { libc::sem_wait(self.raw.as_ptr()) } == 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => return Err(ExamError::Os { name: self.name.clone(), errno }),
            }
        }
    }

    /// Like [`wait`](Self::wait) but gives up at `deadline`
    pub fn wait_until(&self, deadline: SystemTime) -> Result<WaitOutcome> {
        let ts = to_timespec(deadline);
        loop {
            // SAFETY: raw is a live handle and ts outlives the call.
            if unsafe { libc::sem_timedwait(self.raw.as_ptr(), &ts) } == 0 {
                return Ok(WaitOutcome::Acquired);
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ETIMEDOUT => return Ok(WaitOutcome::TimedOut),
                errno => return Err(ExamError::Os { name: self.name.clone(), errno }),
            }
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<WaitOutcome> {
        self.wait_until(SystemTime::now() + timeout)
    }

    /// Decrement without blocking; `false` if the count was zero
    pub fn try_wait(&self) -> Result<bool> {
        loop {
            // SAFETY: raw is a live handle from sem_open.
            if unsafe { libc::sem_trywait(self.raw.as_ptr()) } == 0 {
                return Ok(true);
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::EAGAIN => return Ok(false),
                errno => return Err(ExamError::Os { name: self.name.clone(), errno }),
            }
        }
    }

    /// Current count (a snapshot, racy by nature)
    pub fn value(&self) -> Result<i32> {
        let mut value: libc::c_int = 0;
        // SAFETY: raw is a live handle and value is a valid out pointer.
        if unsafe { libc::sem_getvalue(self.raw.as_ptr(), &mut value) } == 0 {
            Ok(value)
        } else {
            Err(ExamError::last_os(&self.name))
        }
    }

    /// Remove the name so no further `open` succeeds; repeated calls are no-ops
    pub fn destroy(&self) -> Result<()> {
        unlink(&self.name)
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: raw came from sem_open and is closed exactly once.
        unsafe {
            libc::sem_close(self.raw.as_ptr());
        }
    }
}

/// Unlink a semaphore name; a missing name is not an error
pub fn unlink(name: &str) -> Result<()> {
    let c = c_name(name)?;
    // SAFETY: c is a valid NUL-terminated string.
    if unsafe { libc::sem_unlink(c.as_ptr()) } == 0 {
        debug!(name, "unlink: semaphore removed");
        return Ok(());
    }
    match Errno::last() {
        Errno::ENOENT => Ok(()),
        errno => Err(ExamError::from_errno(name, errno)),
    }
}
