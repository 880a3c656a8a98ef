//! Virtual-memory seam
//!
//! The scheduler only needs to know when two tasks live in different address
//! spaces; installing page tables is the VMM's job, reached through the hook
//! below. Kernel threads carry no address space and never trigger a switch.

use spin::Once;

/// Opaque handle to an address space. Tasks sharing a space share the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpaceId(pub u64);

/// Installed by the VMM; called from the context-switch path with the
/// incoming task's address space.
pub trait AddressSpaceHook: Send + Sync {
    fn switch_address_space(&self, next: AddressSpaceId);
}

static HOOK: Once<&'static dyn AddressSpaceHook> = Once::new();

/// Register the VMM hook. First call wins.
pub fn set_hook(hook: &'static dyn AddressSpaceHook) {
    HOOK.call_once(|| hook);
}

/// Ask the VMM to install `next`'s page tables. A no-op until the VMM
/// registers itself (early boot runs on the boot page tables).
pub fn switch_address_space(next: AddressSpaceId) {
    if let Some(hook) = HOOK.get() {
        hook.switch_address_space(next);
    }
}
