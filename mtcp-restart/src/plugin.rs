//! Plugin hook interface for external collaborators (e.g. MPI restart
//! coordination) that need to observe or steer restoration without the
//! core depending on them.
//!
//! Resolved statically: a `&mut dyn PluginHooks` is threaded through the
//! relevant calls. No registration machinery, no dynamic loading — this
//! one vtable, fixed before self-relocation begins, is the only indirection
//! permitted on the restore path.

use crate::restore_info::RestoreInfo;
use mtcp_image::Area;

/// Callbacks consulted during restoration. Implement this to customize
/// behavior without modifying the core restore path.
pub trait PluginHooks {
    /// Called once, after the header and image descriptor are known but
    /// before self-relocation, with the opportunity to adjust `rinfo` or
    /// pre-configure the address space (e.g. multi-process coordination
    /// barrier before every rank proceeds).
    fn hook(&mut self, rinfo: &RestoreInfo);

    /// Consulted for every live mapping during the sweep. Returning `true`
    /// preserves the region past the sweep (it is treated the same as the
    /// reserved range, vDSO, or vvar); the default never preserves
    /// anything extra.
    fn skip_region(&mut self, _area: &Area, _rinfo: &RestoreInfo) -> bool {
        false
    }
}

/// The default, no-op plugin used when no external collaborator is
/// configured.
pub struct NoopPlugin;

impl PluginHooks for NoopPlugin {
    fn hook(&mut self, _rinfo: &RestoreInfo) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_plugin_never_skips() {
        let mut p = NoopPlugin;
        let area = Area::terminator();
        let header: mtcp_image::MtcpHeader = unsafe { std::mem::zeroed() };
        crate::restore_info::init(header, Default::default(), -1);
        unsafe {
            assert!(!p.skip_region(&area, crate::restore_info::get()));
        }
    }
}
