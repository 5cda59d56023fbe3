//! Selection state of the display: which entity is focused and which
//! counter family is charted.
//!
//! Navigation methods return `true` when the selection changed and the
//! display has to redraw.

use serde::Serialize;

use crate::topology::{EntityRef, Topology};
use crate::types::DisplayMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Selector {
    pub selected: EntityRef,
    pub mode: DisplayMode,
}

impl Selector {
    /// Selects the first input in bytes mode. `None` for a topology without
    /// inputs.
    pub fn new(topology: &Topology) -> Option<Self> {
        topology.inputs().first().map(|input| Selector {
            selected: EntityRef::Input {
                ifindex: input.ifindex,
            },
            mode: DisplayMode::Bytes,
        })
    }

    /// Next interface, inputs then outputs, wrapping. A selected VLAN moves
    /// relative to its parent.
    pub fn right(&mut self, topology: &Topology) -> bool {
        self.step(topology, 1)
    }

    /// Previous interface, wrapping.
    pub fn left(&mut self, topology: &Topology) -> bool {
        self.step(topology, -1)
    }

    /// From a VLAN: the previous VLAN, or the parent input for the first one.
    pub fn up(&mut self, topology: &Topology) -> bool {
        let EntityRef::Vlan { parent, vlan } = self.selected else {
            return false;
        };
        let Some(input) = topology.input(parent) else {
            return false;
        };
        let vlans = input.vlans();
        self.selected = match vlans.iter().position(|v| v.vlan_id == vlan) {
            Some(pos) if pos > 0 => EntityRef::Vlan {
                parent,
                vlan: vlans[pos - 1].vlan_id,
            },
            _ => EntityRef::Input { ifindex: parent },
        };
        true
    }

    /// From an input: its first VLAN. From a VLAN: the next one, if any.
    pub fn down(&mut self, topology: &Topology) -> bool {
        let next = match self.selected {
            EntityRef::Input { ifindex } => topology
                .input(ifindex)
                .and_then(|input| input.vlans().first())
                .map(|v| (ifindex, v.vlan_id)),
            EntityRef::Vlan { parent, vlan } => topology.input(parent).and_then(|input| {
                let vlans = input.vlans();
                vlans
                    .iter()
                    .position(|v| v.vlan_id == vlan)
                    .and_then(|pos| vlans.get(pos + 1))
                    .map(|v| (parent, v.vlan_id))
            }),
            EntityRef::Output { .. } => None,
        };
        match next {
            Some((parent, vlan)) => {
                self.selected = EntityRef::Vlan { parent, vlan };
                true
            }
            None => false,
        }
    }

    pub fn set_mode(&mut self, mode: DisplayMode) -> bool {
        let changed = self.mode != mode;
        self.mode = mode;
        changed
    }

    fn step(&mut self, topology: &Topology, offset: isize) -> bool {
        let ring: Vec<EntityRef> = topology
            .inputs()
            .iter()
            .map(|i| EntityRef::Input { ifindex: i.ifindex })
            .chain(
                topology
                    .outputs()
                    .iter()
                    .map(|o| EntityRef::Output { ifindex: o.ifindex }),
            )
            .collect();
        if ring.is_empty() {
            return false;
        }

        let anchor = match self.selected {
            EntityRef::Vlan { parent, .. } => EntityRef::Input { ifindex: parent },
            other => other,
        };
        let Some(pos) = ring.iter().position(|e| *e == anchor) else {
            self.selected = ring[0];
            return true;
        };
        let len = ring.len() as isize;
        let next = ring[(pos as isize + offset).rem_euclid(len) as usize];
        let changed = next != self.selected;
        self.selected = next;
        changed
    }
}
