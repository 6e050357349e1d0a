//! Resource manager configuration.
//!
//! Kept as an explicit, constructor-passed struct rather than a global
//! or a dynamic property bag.

use crate::handle::TRANSIENT_HANDLE_BASE;

/// Tunables for a single connection's [`crate::handle_map::HandleMap`].
#[derive(Debug, Clone, Copy)]
pub struct ResourceManagerConfig {
    /// Maximum number of simultaneously-live vhandles per connection.
    /// 27 is a typical value, matching common TPM transient-object
    /// limits.
    pub handle_map_capacity: u32,
    /// First vhandle value the allocator hands out; the counter
    /// increments from here and never wraps into another handle range.
    pub transient_handle_base: u32,
}

impl Default for ResourceManagerConfig {
    fn default() -> ResourceManagerConfig {
        ResourceManagerConfig {
            handle_map_capacity: 27,
            transient_handle_base: TRANSIENT_HANDLE_BASE,
        }
    }
}
