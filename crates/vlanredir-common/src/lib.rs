#![cfg_attr(not(test), no_std)]

//! Types shared between the `vlan_redirect` XDP program and user space.
//!
//! Everything here is `no_std` so the eBPF side can link it. The map value
//! layouts are `#[repr(C)]` and must stay in lockstep with the kernel program.

pub mod classify;
pub mod maps;

pub use classify::{
    classify, frame_vlan_id, is_vlan_ethertype, vlan_id_from_tci, Verdict, DOT1Q_HDR_LEN,
    ETHERTYPE_OFFSET, ETH_HDR_LEN, ETH_P_8021AD, ETH_P_8021Q, TCI_OFFSET, VLAN_VID_MASK,
};
pub use maps::{
    VlanCounters, GLOBAL_OVERRIDE_KEY, MAP_MAX_ENTRIES, NO_REDIRECT, UNTAGGED_KEY, VLAN_REDIRECT_MAP,
    VLAN_STATS_MAP, XDP_PROGRAM,
};
