//! Error kinds shared by every subsystem.
//!
//! Construction-time errors are terminal: the subsystem refuses to come up
//! and the node's entry function exits the process. Errors inside a loop
//! step are observational: the loop increments the error counter element and
//! continues.

use core::fmt;

/// Snapshot of `errno` taken immediately after a failed libc call.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub(crate) libc::c_int);

impl Errno {
    /// Capture the calling thread's current `errno`.
    pub(crate) fn last() -> Self {
        Errno(unsafe { *libc::__errno_location() })
    }

    /// The raw error number.
    pub fn raw(self) -> libc::c_int {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = unsafe { libc::strerror(self.0) };
        let cstr = unsafe { core::ffi::CStr::from_ptr(st) };
        write!(f, "{}", cstr.to_string_lossy())
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}: {})", self.0, self)
    }
}

/// Everything that can go wrong in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("config empty or inconsistent")]
    InvalidConfig,
    #[error("element not present in the data vector")]
    InvalidElem,
    #[error("region not present in the data vector")]
    InvalidRegion,
    #[error("value outside its closed enumeration")]
    InvalidEnum,
    #[error("typed access does not match the configured element type")]
    TypeMismatch,
    #[error("buffer length does not match the stored byte size")]
    SizeMismatch,
    #[error("priority outside the new-thread range")]
    InvalidPriority,
    #[error("cpu affinity not satisfiable on this host")]
    InvalidAffinity,
    #[error("time went backwards within a state")]
    InvalidTime,
    #[error("transition targets an undefined state")]
    InvalidTransition,
    #[error("region configured more than once")]
    DuplicateRegion,
    #[error("element configured more than once")]
    DuplicateElem,
    #[error("state machine config has no states")]
    NoStates,
    #[error("state id not among the configured states")]
    StateNotFound,
    #[error("lock already held by this thread")]
    AlreadyLocked,
    #[error("lock not held by this thread")]
    NotHeld,
    #[error("lock operation failed: {0}")]
    Lock(Errno),
    #[error("malformed dotted-quad address")]
    InvalidIp,
    #[error("port outside the permitted range")]
    InvalidPort,
    #[error("failed to read the clock: {0}")]
    ClockRead(Errno),
    #[error("clock within one year of overflowing its seconds field")]
    OverflowImminent,
    #[error("failed to spawn thread: {0}")]
    ThreadCreate(Errno),
    #[error("failed to apply scheduling policy: {0}")]
    SchedPolicy(Errno),
    #[error("failed to apply cpu affinity: {0}")]
    SchedAffinity(Errno),
    #[error("period timer failure: {0}")]
    TimerFd(Errno),
    #[error("thread body panicked")]
    ThreadPanicked,
    #[error("thread returned where no return was expected")]
    UnexpectedExit,
    #[error("failed to create socket: {0}")]
    NetCreateSocket(Errno),
    #[error("failed to set socket options: {0}")]
    NetSetSockOpt(Errno),
    #[error("failed to bind socket: {0}")]
    NetBind(Errno),
    #[error("failed to send datagram: {0}")]
    NetSend(Errno),
    #[error("failed to receive datagram: {0}")]
    NetRecv(Errno),
    #[error("datagram length does not match the expected payload size")]
    NetUnexpectedSize,
    #[error("select failed: {0}")]
    Select(Errno),
    #[error("timeout greater than the permitted maximum")]
    TimeoutTooLarge,
    #[error("vector parameters have different lengths")]
    VectorSizeMismatch,
    #[error("empty buffer")]
    EmptyBuffer,
    #[error("no channel configured for node")]
    UnknownNode,
    #[error("peer failed to acknowledge clock synchronization")]
    ClockSyncFailed,
    #[error("periodic body ran past its deadline")]
    MissedDeadline,
}
