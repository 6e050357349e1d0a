//! Response-code constants and helpers.
//!
//! Resource-manager-synthesized errors are OR'd with
//! [`TSS2_RESMGR_ERROR_LEVEL`]; handle-parameter errors additionally
//! follow the TPM convention `TPM_RC_HANDLE | TPM_RC_P | TPM_RC_<n>`.

/// Level mask applied to every resource-manager-synthesized response
/// code, distinguishing it from a genuine TPM-originated one.
pub const TSS2_RESMGR_ERROR_LEVEL: u32 = 7 << 16;

/// Quota exhaustion: the connection's handle map is already at capacity.
pub const TSS2_RESMGR_RC_OBJECT_MEMORY: u32 = TSS2_RESMGR_ERROR_LEVEL | 0x0001;

/// Base `TPM_RC_HANDLE` value (a handle reference is unknown/invalid).
pub const TPM_RC_HANDLE: u32 = 0x008b;
/// Marks an error as parameter-related per the TPM RC format.
pub const TPM_RC_P: u32 = 0x040;
/// First parameter slot.
pub const TPM_RC_1: u32 = 0x100;

/// `RM_RC(fmt1_rc)`: wrap a TPM format-1 response code at the resource
/// manager's error level.
pub fn rm_rc(fmt1_rc: u32) -> u32 {
    TSS2_RESMGR_ERROR_LEVEL | fmt1_rc
}

/// `TPM_RC_HANDLE | TPM_RC_P | TPM_RC_<param_index>`, wrapped via
/// [`rm_rc`]. `param_index` is 1-based, matching the TPM parameter
/// numbering convention (the flush target is always parameter 1).
pub fn rm_rc_handle(param_index: u32) -> u32 {
    rm_rc(TPM_RC_HANDLE | TPM_RC_P | (param_index << 8))
}

/// TPM command codes the quota gate and flush interception care about.
/// Everything else is forwarded unconditionally.
pub mod cc {
    /// `TPM_CC_CreatePrimary`: creates a new transient object.
    pub const CREATE_PRIMARY: u32 = 0x0000_0131;
    /// `TPM_CC_Load`: loads a new transient object from a blob.
    pub const LOAD: u32 = 0x0000_0157;
    /// `TPM_CC_LoadExternal`: loads an externally-provided transient object.
    pub const LOAD_EXTERNAL: u32 = 0x0000_0167;
    /// `TPM_CC_FlushContext`: the special-cased command in §4.6.
    pub const FLUSH_CONTEXT: u32 = 0x0000_0165;
}

/// Commands whose success response introduces a brand-new transient
/// handle the quota gate must account for in advance.
pub fn creates_transient_object(command_code: u32) -> bool {
    matches!(command_code, cc::CREATE_PRIMARY | cc::LOAD | cc::LOAD_EXTERNAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rm_rc_handle_param_1() {
        let rc = rm_rc_handle(1);
        assert_eq!(rc & TSS2_RESMGR_ERROR_LEVEL, TSS2_RESMGR_ERROR_LEVEL);
        assert_eq!(rc & 0xffff, TPM_RC_HANDLE | TPM_RC_P | TPM_RC_1);
    }

    #[test]
    fn object_memory_is_distinct_from_handle_errors() {
        assert_ne!(TSS2_RESMGR_RC_OBJECT_MEMORY, rm_rc_handle(1));
    }
}
