//! Per-frame VLAN classification and redirect decision.
//!
//! The XDP program bounds-checks the packet pointers itself (the verifier
//! wants those inline), hands a fixed-length view of the header to
//! [`frame_vlan_id`] and the resulting key to [`classify`], which decides
//! between the global override, the frame's own VLAN entry and a drop.

use crate::maps::{GLOBAL_OVERRIDE_KEY, NO_REDIRECT, UNTAGGED_KEY};

/// Length of an untagged Ethernet header.
pub const ETH_HDR_LEN: usize = 14;

/// Length of an Ethernet header carrying one 802.1Q/802.1ad tag.
pub const DOT1Q_HDR_LEN: usize = 18;

/// Offset of the ethertype field.
pub const ETHERTYPE_OFFSET: usize = 12;

/// Offset of the tag control information of the outer tag.
pub const TCI_OFFSET: usize = 14;

pub const ETH_P_8021Q: u16 = 0x8100;
pub const ETH_P_8021AD: u16 = 0x88A8;

/// VLAN id bits of the TCI.
pub const VLAN_VID_MASK: u16 = 0x0fff;

/// Returns true for the two tag protocol identifiers the program understands.
#[inline(always)]
pub const fn is_vlan_ethertype(ethertype: u16) -> bool {
    ethertype == ETH_P_8021Q || ethertype == ETH_P_8021AD
}

/// Extracts the VLAN key from a host-order TCI, discarding PCP and DEI.
#[inline(always)]
pub const fn vlan_id_from_tci(tci: u16) -> u32 {
    (tci & VLAN_VID_MASK) as u32
}

/// VLAN key of a frame, or `None` when the Ethernet header, or the tag
/// header of a tagged frame, is truncated.
///
/// `frame` is the frame or any prefix of it; only the first
/// [`DOT1Q_HDR_LEN`] bytes are looked at. Only the outer tag counts, so a
/// QinQ frame is keyed by its service VLAN.
#[inline(always)]
pub fn frame_vlan_id(frame: &[u8]) -> Option<u32> {
    if frame.len() < ETH_HDR_LEN {
        return None;
    }
    let ethertype = u16::from_be_bytes([frame[ETHERTYPE_OFFSET], frame[ETHERTYPE_OFFSET + 1]]);
    if !is_vlan_ethertype(ethertype) {
        return Some(UNTAGGED_KEY);
    }

    if frame.len() < DOT1Q_HDR_LEN {
        return None;
    }
    let tci = u16::from_be_bytes([frame[TCI_OFFSET], frame[TCI_OFFSET + 1]]);
    Some(vlan_id_from_tci(tci))
}

/// Outcome of [`classify`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Redirected through the global override. Counted against the frame's
    /// VLAN key and against [`GLOBAL_OVERRIDE_KEY`].
    Override { ifindex: u32 },
    /// Redirected through the frame's own VLAN entry.
    Vlan { ifindex: u32 },
    /// No usable target, or every redirect attempt failed.
    Drop,
}

impl Verdict {
    /// Target interface of a redirect verdict.
    pub const fn ifindex(&self) -> Option<u32> {
        match self {
            Verdict::Override { ifindex } | Verdict::Vlan { ifindex } => Some(*ifindex),
            Verdict::Drop => None,
        }
    }
}

/// Decides what happens to a frame carrying `vlan_id`.
///
/// `lookup` reads the redirect map, `redirect` asks the kernel to redirect to
/// an interface and reports whether it accepted. A non-zero override is tried
/// first for every frame, even when the frame's own VLAN has no entry. If the
/// override redirect fails the frame's own entry is tried next.
#[inline(always)]
pub fn classify<L, R>(vlan_id: u32, lookup: L, mut redirect: R) -> Verdict
where
    L: Fn(u32) -> Option<u32>,
    R: FnMut(u32) -> bool,
{
    let target = lookup(vlan_id);

    if let Some(ifindex) = lookup(GLOBAL_OVERRIDE_KEY) {
        if ifindex != NO_REDIRECT && redirect(ifindex) {
            return Verdict::Override { ifindex };
        }
    }

    match target {
        Some(ifindex) if ifindex != NO_REDIRECT && redirect(ifindex) => Verdict::Vlan { ifindex },
        _ => Verdict::Drop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::collections::HashMap;

    fn run(map: &HashMap<u32, u32>, vlan_id: u32, accept: &[u32]) -> (Verdict, Vec<u32>) {
        let attempts = RefCell::new(Vec::new());
        let verdict = classify(
            vlan_id,
            |key| map.get(&key).copied(),
            |ifindex| {
                attempts.borrow_mut().push(ifindex);
                accept.contains(&ifindex)
            },
        );
        (verdict, attempts.into_inner())
    }

    #[test]
    fn test_tci_masks_priority_bits() {
        assert_eq!(vlan_id_from_tci(0xE00A), 10);
        assert_eq!(vlan_id_from_tci(0x0FFF), 4095);
        assert!(is_vlan_ethertype(0x8100));
        assert!(is_vlan_ethertype(0x88A8));
        assert!(!is_vlan_ethertype(0x0800));
    }

    /// Header with the given ethertype and TCI, padded to `len` bytes.
    fn frame(ethertype: u16, tci: u16, len: usize) -> Vec<u8> {
        let mut frame = vec![0xAA; 12];
        frame.extend_from_slice(&ethertype.to_be_bytes());
        frame.extend_from_slice(&tci.to_be_bytes());
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        frame.resize(len, 0);
        frame
    }

    #[test]
    fn test_frame_shorter_than_ethernet_header() {
        assert_eq!(frame_vlan_id(&[]), None);
        assert_eq!(frame_vlan_id(&frame(0x0800, 0, ETH_HDR_LEN - 1)), None);
    }

    #[test]
    fn test_untagged_frame() {
        assert_eq!(frame_vlan_id(&frame(0x0800, 0, ETH_HDR_LEN)), Some(UNTAGGED_KEY));
        assert_eq!(frame_vlan_id(&frame(0x86DD, 0x0064, 64)), Some(UNTAGGED_KEY));
    }

    #[test]
    fn test_truncated_tag_header() {
        for len in ETH_HDR_LEN..DOT1Q_HDR_LEN {
            assert_eq!(frame_vlan_id(&frame(ETH_P_8021Q, 10, len)), None, "len {}", len);
        }
        assert_eq!(frame_vlan_id(&frame(ETH_P_8021Q, 10, DOT1Q_HDR_LEN)), Some(10));
    }

    #[test]
    fn test_qinq_uses_outer_tag() {
        let mut qinq = frame(ETH_P_8021AD, 300, 64);
        qinq[16..18].copy_from_slice(&ETH_P_8021Q.to_be_bytes());
        qinq[18..20].copy_from_slice(&20u16.to_be_bytes());
        assert_eq!(frame_vlan_id(&qinq), Some(300));
    }

    #[test]
    fn test_frame_tci_keeps_only_vid_bits() {
        // PCP 7, DEI set, VID 10.
        assert_eq!(frame_vlan_id(&frame(ETH_P_8021Q, 0xF00A, 64)), Some(10));
        assert_eq!(frame_vlan_id(&frame(ETH_P_8021Q, 0xFFFF, 64)), Some(GLOBAL_OVERRIDE_KEY));
    }

    #[test]
    fn test_override_captures_unconfigured_vlan() {
        let map = HashMap::from([(GLOBAL_OVERRIDE_KEY, 7)]);
        let (verdict, attempts) = run(&map, 10, &[7]);
        assert_eq!(verdict, Verdict::Override { ifindex: 7 });
        assert_eq!(attempts, vec![7]);
    }

    #[test]
    fn test_override_wins_over_vlan_entry() {
        let map = HashMap::from([(10, 3), (GLOBAL_OVERRIDE_KEY, 7)]);
        let (verdict, _) = run(&map, 10, &[3, 7]);
        assert_eq!(verdict, Verdict::Override { ifindex: 7 });
    }

    #[test]
    fn test_failed_override_falls_back_to_vlan_entry() {
        let map = HashMap::from([(10, 3), (GLOBAL_OVERRIDE_KEY, 7)]);
        let (verdict, attempts) = run(&map, 10, &[3]);
        assert_eq!(verdict, Verdict::Vlan { ifindex: 3 });
        assert_eq!(attempts, vec![7, 3]);
    }

    #[test]
    fn test_untagged_entry_without_override() {
        let map = HashMap::from([(UNTAGGED_KEY, 5)]);
        let (verdict, _) = run(&map, UNTAGGED_KEY, &[5]);
        assert_eq!(verdict, Verdict::Vlan { ifindex: 5 });
        assert_eq!(verdict.ifindex(), Some(5));
    }

    #[test]
    fn test_zero_override_is_ignored() {
        let map = HashMap::from([(20, 4), (GLOBAL_OVERRIDE_KEY, NO_REDIRECT)]);
        let (verdict, attempts) = run(&map, 20, &[4]);
        assert_eq!(verdict, Verdict::Vlan { ifindex: 4 });
        assert_eq!(attempts, vec![4]);
    }

    #[test]
    fn test_unknown_vlan_is_dropped() {
        let map = HashMap::from([(10, 3)]);
        let (verdict, attempts) = run(&map, 30, &[3]);
        assert_eq!(verdict, Verdict::Drop);
        assert!(attempts.is_empty());
    }

    #[test]
    fn test_zero_target_and_failed_redirect_drop() {
        let map = HashMap::from([(10, NO_REDIRECT), (11, 9)]);
        assert_eq!(run(&map, 10, &[9]).0, Verdict::Drop);
        assert_eq!(run(&map, 11, &[]).0, Verdict::Drop);
        assert_eq!(Verdict::Drop.ifindex(), None);
    }
}
