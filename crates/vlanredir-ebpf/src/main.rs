#![no_std]
#![no_main]

use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::bindings::xdp_action;
use aya_ebpf::helpers::bpf_redirect;
use aya_ebpf::macros::{map, xdp};
use aya_ebpf::maps::HashMap;
use aya_ebpf::programs::XdpContext;
use vlanredir_common::{
    classify, frame_vlan_id, Verdict, VlanCounters, DOT1Q_HDR_LEN, ETH_HDR_LEN,
    GLOBAL_OVERRIDE_KEY, MAP_MAX_ENTRIES, UNTAGGED_KEY,
};

#[map(name = "vlan_redirect_map")]
static VLAN_REDIRECT_MAP: HashMap<u32, u32> =
    HashMap::<u32, u32>::with_max_entries(MAP_MAX_ENTRIES, 0);

#[map(name = "vlan_stats")]
static VLAN_STATS: HashMap<u32, VlanCounters> =
    HashMap::<u32, VlanCounters>::with_max_entries(MAP_MAX_ENTRIES, 0);

#[xdp]
pub fn vlan_redirect(ctx: XdpContext) -> u32 {
    let data = ctx.data() as *const u8;
    let data_end = ctx.data_end() as *const u8;
    let pkt_len = (data_end as usize).saturating_sub(data as usize) as u64;

    let vlan_id = match header_vlan_id(data, data_end) {
        Some(id) => id,
        None => {
            record_drop(UNTAGGED_KEY);
            return xdp_action::XDP_DROP;
        }
    };

    match classify(vlan_id, lookup_redirect, redirect) {
        Verdict::Override { .. } => {
            record_forward(vlan_id, pkt_len);
            record_forward(GLOBAL_OVERRIDE_KEY, pkt_len);
            xdp_action::XDP_REDIRECT
        }
        Verdict::Vlan { .. } => {
            record_forward(vlan_id, pkt_len);
            xdp_action::XDP_REDIRECT
        }
        Verdict::Drop => {
            record_drop(vlan_id);
            xdp_action::XDP_DROP
        }
    }
}

/// Bounds-checks the packet pointers and parses the header through a view of
/// constant length, so every byte read is covered by a check on `data_end`.
#[inline(always)]
fn header_vlan_id(data: *const u8, data_end: *const u8) -> Option<u32> {
    if in_bounds(data, DOT1Q_HDR_LEN, data_end) {
        let header = unsafe { core::slice::from_raw_parts(data, DOT1Q_HDR_LEN) };
        frame_vlan_id(header)
    } else if in_bounds(data, ETH_HDR_LEN, data_end) {
        let header = unsafe { core::slice::from_raw_parts(data, ETH_HDR_LEN) };
        frame_vlan_id(header)
    } else {
        None
    }
}

#[inline(always)]
fn in_bounds(data: *const u8, len: usize, data_end: *const u8) -> bool {
    data.wrapping_add(len) <= data_end
}

#[inline(always)]
fn lookup_redirect(key: u32) -> Option<u32> {
    unsafe { VLAN_REDIRECT_MAP.get(&key).copied() }
}

#[inline(always)]
fn redirect(ifindex: u32) -> bool {
    unsafe { bpf_redirect(ifindex, 0) == xdp_action::XDP_REDIRECT as i64 }
}

fn record_forward(key: u32, pkt_len: u64) {
    match VLAN_STATS.get_ptr_mut(&key) {
        Some(ptr) => unsafe {
            relaxed_add(addr_of_mut!((*ptr).bytes), pkt_len);
            relaxed_add(addr_of_mut!((*ptr).packets), 1);
        },
        None => {
            let _ = VLAN_STATS.insert(&key, &VlanCounters::forwarded(pkt_len), 0);
        }
    }
}

fn record_drop(key: u32) {
    match VLAN_STATS.get_ptr_mut(&key) {
        Some(ptr) => unsafe { relaxed_add(addr_of_mut!((*ptr).dropped), 1) },
        None => {
            let _ = VLAN_STATS.insert(&key, &VlanCounters::dropped(), 0);
        }
    }
}

/// Relaxed load then relaxed store. Not a fetch-add: two CPUs hitting the same
/// key at once can lose an increment, but a reader never sees a torn value.
#[inline(always)]
unsafe fn relaxed_add(field: *mut u64, delta: u64) {
    let cell = AtomicU64::from_ptr(field);
    cell.store(
        cell.load(Ordering::Relaxed).wrapping_add(delta),
        Ordering::Relaxed,
    );
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
