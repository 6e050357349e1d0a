//! The access broker: the thread-safe, mutex-protected TPM driver
//! wrapper. Out of scope to implement; this module only names the
//! interface the virtualizer programs against.

use std::sync::Arc;

use crate::handle::Handle;
use crate::handle_map::ContextBlob;
use crate::protocol::Tpm2Command;
use crate::protocol::Tpm2Response;

/// Thin façade over the real TPM driver. Thread-safe, so it may be
/// shared with other subsystems beyond the resource manager.
///
/// Every fallible operation reports failure as a raw TPM response code
/// rather than a generic error, matching the `(response | null, rc)`
/// calling convention used throughout the protocol: on failure there is
/// no response object, only an `rc` the caller propagates verbatim.
pub trait AccessBroker: Send + Sync {
    /// The concrete response type this broker's underlying parser
    /// produces.
    type Response: Tpm2Response;

    /// Forward a command's bytes to the TPM and return its response.
    /// `Err(rc)` means the broker itself could not obtain a response
    /// (as opposed to the TPM returning a response carrying a non-zero
    /// `rc`, which is still `Ok`).
    fn send_command(&self, cmd: &dyn Tpm2Command) -> Result<Self::Response, u32>;

    /// Restore a saved transient context into the TPM, returning the
    /// physical handle it was assigned.
    fn context_load(&self, blob: &ContextBlob) -> Result<Handle, u32>;

    /// Save and evict a loaded transient context, returning the opaque
    /// blob that can later be passed back to `context_load`.
    fn context_saveflush(&self, phandle: Handle) -> Result<ContextBlob, u32>;
}

/// A shareable handle to an [`AccessBroker`], the form the dispatch
/// worker and any other subsystem hold it in.
pub type SharedAccessBroker<B> = Arc<B>;
