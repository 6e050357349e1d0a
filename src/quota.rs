//! Quota gate: rejects transient-object-creating commands when the
//! issuing connection's handle map is already full, without ever
//! touching the access broker.

use crate::handle_map::HandleMap;
use crate::rc;

/// Outcome of checking a command against the connection's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// The command may proceed to dispatch.
    Admit,
    /// The command must be rejected with this response code, and never
    /// reach the access broker.
    Reject(u32),
}

/// Check whether `command_code` may proceed given the state of
/// `handle_map`. Only commands known to introduce a new transient
/// object are subject to the gate (`TPM_CC_CreatePrimary`,
/// `TPM_CC_Load`, `TPM_CC_LoadExternal`); every other command is always
/// admitted here (it may still be rejected later, e.g. by the TPM
/// itself).
pub fn check(command_code: u32, handle_map: &HandleMap) -> QuotaDecision {
    if rc::creates_transient_object(command_code) && handle_map.is_full() {
        QuotaDecision::Reject(rc::TSS2_RESMGR_RC_OBJECT_MEMORY)
    } else {
        QuotaDecision::Admit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_when_not_full() {
        let map = HandleMap::new(2, 0x8000_0000);
        assert_eq!(check(rc::cc::LOAD, &map), QuotaDecision::Admit);
    }

    #[test]
    fn admits_unrelated_commands_even_when_full() {
        let map = HandleMap::new(0, 0x8000_0000);
        assert_eq!(check(0x1234, &map), QuotaDecision::Admit);
    }

    #[test]
    fn rejects_creating_commands_when_full() {
        let map = HandleMap::new(0, 0x8000_0000);
        assert_eq!(
            check(rc::cc::CREATE_PRIMARY, &map),
            QuotaDecision::Reject(rc::TSS2_RESMGR_RC_OBJECT_MEMORY)
        );
        assert_eq!(
            check(rc::cc::LOAD, &map),
            QuotaDecision::Reject(rc::TSS2_RESMGR_RC_OBJECT_MEMORY)
        );
        assert_eq!(
            check(rc::cc::LOAD_EXTERNAL, &map),
            QuotaDecision::Reject(rc::TSS2_RESMGR_RC_OBJECT_MEMORY)
        );
    }
}
