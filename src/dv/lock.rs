//! The error-checking mutex guarding a Data Vector's buffer.
//!
//! `PTHREAD_MUTEX_ERRORCHECK` rather than a poisoning or silently recursive
//! lock: re-acquisition from the holding thread must report
//! [`Error::AlreadyLocked`] and release by a non-holder [`Error::NotHeld`],
//! while cross-thread acquisition blocks normally. Priority inheritance is
//! enabled so a low-priority holder cannot starve the loop thread.

use core::cell::UnsafeCell;

use crate::errors::{Errno, Error};

pub(crate) struct ErrorcheckMutex {
    // Boxed: pthread mutexes must not move once initialized.
    inner: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

unsafe impl Send for ErrorcheckMutex {}
unsafe impl Sync for ErrorcheckMutex {}

impl ErrorcheckMutex {
    pub(crate) fn new() -> Result<Self, Error> {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));

        let mut attr: libc::pthread_mutexattr_t = unsafe { core::mem::zeroed() };
        let err = unsafe { libc::pthread_mutexattr_init(&mut attr) };
        if err != 0 {
            return Err(Error::Lock(Errno(err)));
        }

        // Neither call can fail with a valid attr and constant arguments.
        unsafe {
            libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_ERRORCHECK);
            libc::pthread_mutexattr_setprotocol(&mut attr, libc::PTHREAD_PRIO_INHERIT);
        }

        let err = unsafe { libc::pthread_mutex_init(inner.get(), &attr) };
        unsafe { libc::pthread_mutexattr_destroy(&mut attr) };
        if err != 0 {
            return Err(Error::Lock(Errno(err)));
        }

        Ok(ErrorcheckMutex { inner })
    }

    /// Block until the lock is held by the calling thread.
    pub(crate) fn lock(&self) -> Result<(), Error> {
        match unsafe { libc::pthread_mutex_lock(self.inner.get()) } {
            0 => Ok(()),
            libc::EDEADLK => Err(Error::AlreadyLocked),
            err => Err(Error::Lock(Errno(err))),
        }
    }

    /// Release the lock held by the calling thread.
    pub(crate) fn unlock(&self) -> Result<(), Error> {
        match unsafe { libc::pthread_mutex_unlock(self.inner.get()) } {
            0 => Ok(()),
            libc::EPERM => Err(Error::NotHeld),
            err => Err(Error::Lock(Errno(err))),
        }
    }
}

impl Drop for ErrorcheckMutex {
    fn drop(&mut self) {
        unsafe { libc::pthread_mutex_destroy(self.inner.get()) };
    }
}
