use std::fmt;

use crate::handle::Handle;

/// Errors internal to the resource manager's own bookkeeping.
///
/// These are distinct from TPM response codes: an `Error` means the
/// resource manager itself could not complete an operation (a
/// programming error, or some other condition fatal to the process),
/// not that the TPM rejected a command. Rejected commands are reported
/// back to the client as synthesized responses (see `rc.rs`), never as
/// this type.
#[derive(Debug)]
pub enum Error {
    /// Attempted to insert a vhandle that's already present in the map.
    Duplicate(Handle),
    /// Attempted to allocate or insert a new vhandle while the map was
    /// already at capacity.
    Full,
    /// The monotone vhandle counter wrapped around the transient range.
    HandleSpaceExhausted,
    /// A worker-finalization precondition was violated (the dispatch
    /// thread was still running, or `shutdown` was called twice).
    WorkerStillRunning,
}

/// Error type for collaborator traits (`AccessBroker`, `Sink`) whose
/// concrete failure modes are the caller's business, not ours.
pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::Error::*;
        match self {
            Duplicate(h) => write!(f, "vhandle {:#x} already present in map", h.raw()),
            Full => write!(f, "handle map is at capacity"),
            HandleSpaceExhausted => write!(f, "transient vhandle space exhausted"),
            WorkerStillRunning => write!(f, "dispatch worker is still running"),
        }
    }
}

impl std::error::Error for Error {}
