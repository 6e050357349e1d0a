//! Tpm2Command / Tpm2Response: the command/response byte-buffer parser
//! collaborator.
//!
//! The real parser (decoding/encoding the TPM wire format) is out of
//! scope for this crate; these traits are the seam the virtualizer
//! programs against, narrow enough that any concrete parser
//! implementation can be dropped in.

use crate::handle::Handle;

/// A parsed TPM command, as a mutable value object the virtualizer
/// rewrites handles on in place.
pub trait Tpm2Command: Send {
    /// Identity of the connection this command arrived on.
    fn connection_id(&self) -> u64;
    /// `TPM_CC_*` command code.
    fn command_code(&self) -> u32;
    /// Number of handles in the command's handle area, 0..=3.
    fn handle_count(&self) -> usize;
    /// The handle at `index` (`index < handle_count()`).
    fn handle_at(&self, index: usize) -> Handle;
    /// Rewrite the handle at `index` in place.
    fn set_handle_at(&mut self, index: usize, handle: Handle);
    /// The flush target handle from the parameter area. Only meaningful
    /// when `command_code() == cc::FLUSH_CONTEXT`; the flush target
    /// lives in the parameter area, not the handle area.
    fn flush_target(&self) -> Handle;
    /// The command's `TPMA_CC`-style attribute bitfield (e.g. session
    /// use, decrypt/encrypt parameter flags). The virtualizer does not
    /// interpret these itself; they're exposed because the parser
    /// carries them and a downstream collaborator may need them.
    fn attributes(&self) -> u32;
    /// Rewrite the command's attribute bitfield in place.
    fn set_attributes(&mut self, attributes: u32);
    /// The raw command byte buffer.
    fn raw(&self) -> &[u8];
}

/// A parsed TPM response, as a mutable value object the virtualizer
/// rewrites handles on in place.
pub trait Tpm2Response: Send {
    /// Identity of the connection this response is destined for.
    fn connection_id(&self) -> u64;
    /// The TPM response code.
    fn rc(&self) -> u32;
    /// The response's handle field, if it has one (a response carries 0
    /// or 1 handles).
    fn handle(&self) -> Option<Handle>;
    /// Rewrite the response's handle field in place.
    fn set_handle(&mut self, handle: Handle);
    /// The response's attribute bitfield (e.g. the `TPM_ST` tag,
    /// distinguishing a sessions-bearing response from a sessionless
    /// one). Not interpreted by the virtualizer itself.
    fn attributes(&self) -> u32;
    /// Rewrite the response's attribute bitfield in place.
    fn set_attributes(&mut self, attributes: u32);
    /// The raw response byte buffer.
    fn raw(&self) -> &[u8];
}

/// Ability to synthesize a response locally, without a TPM round trip,
/// used for quota rejection, flush-context handling, and reporting an
/// access-broker failure back to the client.
///
/// Split out from [`Tpm2Response`] because it's the one place the
/// virtualizer needs to *construct* a concrete response type rather
/// than just mutate one handed to it, which isn't object-safe as part
/// of the read/write trait above.
pub trait Tpm2ResponseFactory: Tpm2Response {
    /// Build a response carrying `rc` and no handle, addressed back to
    /// `connection_id`.
    fn synthesize(connection_id: u64, rc: u32) -> Self;
}
