//! Real-time thread management.
//!
//! All flight threads and the time-critical kernel threads run under
//! `SCHED_FIFO`, which schedules the highest-priority runnable thread until
//! it blocks or exits. Four priority bands matter:
//!
//! 1. Hardware IRQ kernel threads: priority 50 (kernel default). Everything
//!    of ours stays below so interrupt servicing is never delayed.
//! 2. Timer softirq kernel threads (`ktimersoftd/N`): raised to 49 at
//!    initialization. The periodic dispatcher depends on them; they must
//!    never be starved by an application thread.
//! 3. The init thread: 48, so it can bring up the application threads
//!    without being preempted by them.
//! 4. Application threads: `[1, 47]`.
//!
//! Initialization degrades gracefully on hosts that refuse `SCHED_FIFO`
//! escalation (unprivileged development boxes) or lack the softirq threads
//! (non-RT kernels): the manager logs, records non-realtime mode, and keeps
//! every other contract: input validation, affinity, periodic dispatch and
//! deadline accounting are identical. Flight hardware runs privileged and
//! gets the full policy.

use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;

use crate::errors::{Errno, Error};

/// Kernel default priority of hardware IRQ threads. Reserved.
pub const HW_IRQ_PRIORITY: u8 = 50;
/// Priority the timer softirq threads are raised to.
pub const KTIMERSOFTD_PRIORITY: u8 = 49;
/// Priority of the thread that initializes the node.
pub const INIT_THREAD_PRIORITY: u8 = 48;
/// Highest priority permitted for a new thread.
pub const MAX_NEW_THREAD_PRIORITY: u8 = 47;
/// Lowest priority permitted for a new thread.
pub const MIN_NEW_THREAD_PRIORITY: u8 = 1;

/// CPU affinity for new threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Core0,
    Core1,
    All,
}

/// A created thread, waitable exactly once.
pub struct ThreadHandle {
    join: thread::JoinHandle<Result<(), Error>>,
}

static INSTANCE: OnceLock<Result<ThreadManager, Error>> = OnceLock::new();

/// Process-wide thread manager. Not threadsafe itself: call it from the init
/// thread.
pub struct ThreadManager {
    realtime: bool,
}

impl ThreadManager {
    /// Access the singleton. The first call initializes the kernel
    /// scheduling environment: raises the timer softirq threads, then puts
    /// the calling thread at [`INIT_THREAD_PRIORITY`] pinned to core 0.
    pub fn instance() -> Result<&'static ThreadManager, Error> {
        INSTANCE.get_or_init(ThreadManager::init).as_ref().map_err(|&e| e)
    }

    fn init() -> Result<ThreadManager, Error> {
        raise_ktimersoftd_threads();

        apply_affinity(Affinity::Core0)?;
        let realtime = match apply_policy(INIT_THREAD_PRIORITY) {
            Ok(()) => true,
            Err(Error::SchedPolicy(errno)) if errno.raw() == libc::EPERM => {
                log::warn!("SCHED_FIFO unavailable (EPERM); running without realtime policy");
                false
            }
            Err(err) => return Err(err),
        };

        Ok(ThreadManager { realtime })
    }

    /// Whether `SCHED_FIFO` escalation is actually in effect.
    pub fn is_realtime(&self) -> bool {
        self.realtime
    }

    /// Create a one-shot `SCHED_FIFO` thread.
    ///
    /// The body runs only after scheduling policy, priority, and affinity
    /// are in place; a setup failure is returned here, not from the body.
    pub fn create_thread<F>(
        &self,
        body: F,
        priority: u8,
        affinity: Affinity,
    ) -> Result<ThreadHandle, Error>
    where
        F: FnOnce() -> Result<(), Error> + Send + 'static,
    {
        validate_priority(priority)?;
        self.spawn(priority, affinity, body)
    }

    /// Create a periodic `SCHED_FIFO` thread.
    ///
    /// The body begins strictly every `period_ns`, paced by a monotonic
    /// interval timer, so no wake-up skew accumulates. When the body returns
    /// an error, `err_handler` receives it; when the body runs past its
    /// deadline (the timer fired while it ran, or more than once before it
    /// woke) `err_handler` receives [`Error::MissedDeadline`]. A handler
    /// returning `Ok(())` continues the cadence; `Err(e)` becomes the
    /// thread's exit value.
    pub fn create_periodic_thread<F, H>(
        &self,
        mut body: F,
        priority: u8,
        affinity: Affinity,
        period_ns: u64,
        mut err_handler: H,
    ) -> Result<ThreadHandle, Error>
    where
        F: FnMut() -> Result<(), Error> + Send + 'static,
        H: FnMut(Error) -> Result<(), Error> + Send + 'static,
    {
        validate_priority(priority)?;
        self.spawn(priority, affinity, move || {
            let timer = TimerFd::new_periodic(period_ns)?;
            loop {
                if let Err(step_err) = body() {
                    err_handler(step_err)?;
                }

                // An expiration queued while the body ran means the body
                // finished after its deadline.
                let overrun = timer.poll_expirations()?;
                if overrun > 0 {
                    err_handler(Error::MissedDeadline)?;
                    // Already past the boundary: start the next body now.
                    continue;
                }

                // Wait out the period; multiple expirations on wake mean the
                // wake itself came late.
                if timer.wait()? > 1 {
                    err_handler(Error::MissedDeadline)?;
                }
            }
        })
    }

    /// Block until the thread returns and yield its result.
    pub fn wait(&self, handle: ThreadHandle) -> Result<(), Error> {
        handle.join.join().map_err(|_| Error::ThreadPanicked)?
    }

    fn spawn<F>(&self, priority: u8, affinity: Affinity, body: F) -> Result<ThreadHandle, Error>
    where
        F: FnOnce() -> Result<(), Error> + Send + 'static,
    {
        let realtime = self.realtime;
        let (setup_tx, setup_rx) = mpsc::channel();

        let join = thread::Builder::new()
            .spawn(move || {
                let setup = configure_current_thread(priority, affinity, realtime);
                let _ = setup_tx.send(setup);
                setup?;
                body()
            })
            .map_err(|err| {
                Error::ThreadCreate(Errno(err.raw_os_error().unwrap_or(0) as libc::c_int))
            })?;

        match setup_rx.recv() {
            Ok(Ok(())) => Ok(ThreadHandle { join }),
            Ok(Err(setup_err)) => {
                let _ = join.join();
                Err(setup_err)
            }
            // Sender dropped without reporting: the thread died in setup.
            Err(_) => {
                let _ = join.join();
                Err(Error::ThreadPanicked)
            }
        }
    }
}

fn validate_priority(priority: u8) -> Result<(), Error> {
    if !(MIN_NEW_THREAD_PRIORITY..=MAX_NEW_THREAD_PRIORITY).contains(&priority) {
        return Err(Error::InvalidPriority);
    }
    Ok(())
}

fn configure_current_thread(priority: u8, affinity: Affinity, realtime: bool) -> Result<(), Error> {
    apply_affinity(affinity)?;
    if realtime {
        apply_policy(priority)?;
    }
    Ok(())
}

fn apply_policy(priority: u8) -> Result<(), Error> {
    let param = libc::sched_param {
        sched_priority: priority as libc::c_int,
    };
    let err = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if err != 0 {
        return Err(Error::SchedPolicy(Errno(err)));
    }
    Ok(())
}

fn apply_affinity(affinity: Affinity) -> Result<(), Error> {
    let cpu = match affinity {
        // No restriction.
        Affinity::All => return Ok(()),
        Affinity::Core0 => 0,
        Affinity::Core1 => 1,
    };

    let mut set: libc::cpu_set_t = unsafe { core::mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
    }
    let err =
        unsafe { libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set) };
    if err != 0 {
        let errno = Errno::last();
        if errno.raw() == libc::EINVAL {
            // The core does not exist on this host.
            return Err(Error::InvalidAffinity);
        }
        return Err(Error::SchedAffinity(errno));
    }
    Ok(())
}

/// Raise every `ktimersoftd/N` kernel thread to [`KTIMERSOFTD_PRIORITY`].
///
/// The threads are found by scanning `/proc/<pid>/comm`. On a kernel without
/// them (no PREEMPT_RT) there is nothing to raise and the periodic timers are
/// serviced in hard-irq context anyway.
fn raise_ktimersoftd_threads() {
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("cannot scan /proc for timer softirq threads: {err}");
            return;
        }
    };

    let mut found = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<libc::pid_t>().ok()) else {
            continue;
        };
        let comm = match std::fs::read_to_string(entry.path().join("comm")) {
            Ok(comm) => comm,
            Err(_) => continue,
        };
        if !comm.trim_end().starts_with("ktimersoftd/") {
            continue;
        }

        found += 1;
        let param = libc::sched_param {
            sched_priority: KTIMERSOFTD_PRIORITY as libc::c_int,
        };
        if unsafe { libc::sched_setscheduler(pid, libc::SCHED_FIFO, &param) } != 0 {
            log::warn!(
                "failed to raise {} (pid {pid}): {}",
                comm.trim_end(),
                Errno::last()
            );
        }
    }

    if found == 0 {
        log::warn!("no ktimersoftd threads on this kernel; skipping softirq priority setup");
    }
}

/// Monotonic interval timer backing the periodic dispatcher.
struct TimerFd(libc::c_int);

impl TimerFd {
    fn new_periodic(period_ns: u64) -> Result<Self, Error> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK)
        };
        if fd < 0 {
            return Err(Error::TimerFd(Errno::last()));
        }
        let timer = TimerFd(fd);

        let spec = libc::itimerspec {
            it_interval: ns_to_timespec(period_ns),
            it_value: ns_to_timespec(period_ns),
        };
        if unsafe { libc::timerfd_settime(timer.0, 0, &spec, core::ptr::null_mut()) } != 0 {
            return Err(Error::TimerFd(Errno::last()));
        }
        Ok(timer)
    }

    /// Expirations since the last read, without waiting.
    fn poll_expirations(&self) -> Result<u64, Error> {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.0,
                (&mut count) as *mut u64 as *mut libc::c_void,
                core::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let errno = Errno::last();
            if errno.raw() == libc::EAGAIN || errno.raw() == libc::EWOULDBLOCK {
                return Ok(0);
            }
            return Err(Error::TimerFd(errno));
        }
        Ok(count)
    }

    /// Block until the next expiration; returns how many elapsed.
    fn wait(&self) -> Result<u64, Error> {
        let mut pollfd = libc::pollfd {
            fd: self.0,
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let ready = unsafe { libc::poll(&mut pollfd, 1, -1) };
            if ready < 0 {
                let errno = Errno::last();
                if errno.raw() == libc::EINTR {
                    continue;
                }
                return Err(Error::TimerFd(errno));
            }
            let count = self.poll_expirations()?;
            if count > 0 {
                return Ok(count);
            }
        }
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

fn ns_to_timespec(ns: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ns / crate::time::NS_IN_S) as libc::time_t,
        tv_nsec: (ns % crate::time::NS_IN_S) as libc::c_long,
    }
}
