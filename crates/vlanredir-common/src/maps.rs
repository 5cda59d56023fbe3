//! Map names, keys and value layouts of the redirect program.
//!
//! Both maps are keyed by a `u32` VLAN key:
//!
//! - `0` holds untagged frames,
//! - `1..=4094` hold tagged frames of that VLAN,
//! - `4095` is the global override entry.

/// Name of the XDP program inside the object file.
pub const XDP_PROGRAM: &str = "vlan_redirect";

/// VLAN key -> output interface index.
pub const VLAN_REDIRECT_MAP: &str = "vlan_redirect_map";

/// VLAN key -> [`VlanCounters`].
pub const VLAN_STATS_MAP: &str = "vlan_stats";

/// Capacity of both maps.
pub const MAP_MAX_ENTRIES: u32 = 4096;

/// Key used for frames without an 802.1Q/802.1ad tag.
pub const UNTAGGED_KEY: u32 = 0;

/// Key of the entry that, when it holds a non-zero target, captures every frame.
pub const GLOBAL_OVERRIDE_KEY: u32 = 4095;

/// Redirect value meaning "no target". Interface index 0 is never a real link.
pub const NO_REDIRECT: u32 = 0;

/// Per-VLAN counters written by the XDP program.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct VlanCounters {
    /// Bytes of frames redirected (frame length from data to data_end).
    pub bytes: u64,
    /// Frames redirected.
    pub packets: u64,
    /// Frames dropped.
    pub dropped: u64,
}

impl VlanCounters {
    /// Initial value for a key whose first frame was redirected.
    pub const fn forwarded(len: u64) -> Self {
        Self {
            bytes: len,
            packets: 1,
            dropped: 0,
        }
    }

    /// Initial value for a key whose first frame was dropped.
    pub const fn dropped() -> Self {
        Self {
            bytes: 0,
            packets: 0,
            dropped: 1,
        }
    }
}

// aya's typed maps require Pod. Kept behind `user` so the eBPF build never
// pulls in the user-space loader.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::VlanCounters;
    use aya::Pod;

    unsafe impl Pod for VlanCounters {}
}
