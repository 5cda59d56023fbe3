//! In-memory graph of input interfaces, output interfaces and VLAN entries.
//!
//! Both interface lists are kept sorted by ifindex, VLAN entries sorted by id
//! within their input. Links between entities are keys, never owning
//! pointers: a VLAN entry names its redirect target by output ifindex and an
//! [`EntityRef`] addresses any entity for selection and display.

use serde::Serialize;

use crate::stats::History;
use crate::types::{VlanId, XdpMode};

/// Address of one entity in the [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntityRef {
    Input { ifindex: u32 },
    Output { ifindex: u32 },
    Vlan { parent: u32, vlan: VlanId },
}

/// Common view over everything that owns a counter history.
pub trait HasHistory {
    /// Display name (`eth0`, `eth0.10`, `eth0.any`).
    fn label(&self) -> String;
    fn is_up(&self) -> bool;
    fn history(&self) -> &History;
    fn history_mut(&mut self) -> &mut History;
}

/// Ingress interface with the redirect program attached.
#[derive(Debug, Clone)]
pub struct InputInterface {
    pub ifindex: u32,
    pub name: String,
    pub is_up: bool,
    pub promiscuous: bool,
    /// Mode the program was attached with, `None` until attached.
    pub xdp_mode: Option<XdpMode>,
    pub history: History,
    vlans: Vec<VlanEntry>,
}

impl InputInterface {
    fn new(ifindex: u32, name: &str, history_depth: usize) -> Self {
        InputInterface {
            ifindex,
            name: name.to_string(),
            is_up: false,
            promiscuous: false,
            xdp_mode: None,
            history: History::new(history_depth),
            vlans: Vec::new(),
        }
    }

    /// VLAN entries sorted by id.
    pub fn vlans(&self) -> &[VlanEntry] {
        &self.vlans
    }

    pub fn vlans_mut(&mut self) -> &mut [VlanEntry] {
        &mut self.vlans
    }

    pub fn vlan(&self, vlan: VlanId) -> Option<&VlanEntry> {
        self.vlans
            .binary_search_by_key(&vlan, |entry| entry.vlan_id)
            .ok()
            .map(|i| &self.vlans[i])
    }

    /// Returns the entry for `vlan`, creating it with `redirect` if absent.
    /// An existing entry keeps its original target.
    pub fn insert_vlan(
        &mut self,
        vlan: VlanId,
        redirect: Option<u32>,
        history_depth: usize,
    ) -> &mut VlanEntry {
        let pos = match self.vlans.binary_search_by_key(&vlan, |entry| entry.vlan_id) {
            Ok(pos) => pos,
            Err(pos) => {
                self.vlans.insert(
                    pos,
                    VlanEntry {
                        vlan_id: vlan,
                        parent: self.ifindex,
                        parent_name: self.name.clone(),
                        redirect,
                        is_up: false,
                        history: History::new(history_depth),
                    },
                );
                pos
            }
        };
        &mut self.vlans[pos]
    }
}

impl HasHistory for InputInterface {
    fn label(&self) -> String {
        self.name.clone()
    }

    fn is_up(&self) -> bool {
        self.is_up
    }

    fn history(&self) -> &History {
        &self.history
    }

    fn history_mut(&mut self) -> &mut History {
        &mut self.history
    }
}

/// Egress interface, shared by every input redirecting to it.
#[derive(Debug, Clone)]
pub struct OutputInterface {
    pub ifindex: u32,
    pub name: String,
    pub is_up: bool,
    pub promiscuous: bool,
    pub history: History,
}

impl HasHistory for OutputInterface {
    fn label(&self) -> String {
        self.name.clone()
    }

    fn is_up(&self) -> bool {
        self.is_up
    }

    fn history(&self) -> &History {
        &self.history
    }

    fn history_mut(&mut self) -> &mut History {
        &mut self.history
    }
}

/// One VLAN key configured on an input.
#[derive(Debug, Clone)]
pub struct VlanEntry {
    pub vlan_id: VlanId,
    /// Ifindex of the owning input.
    pub parent: u32,
    parent_name: String,
    /// Output ifindex read back from the redirect map at load time.
    pub redirect: Option<u32>,
    pub is_up: bool,
    pub history: History,
}

impl HasHistory for VlanEntry {
    fn label(&self) -> String {
        format!("{}.{}", self.parent_name, self.vlan_id)
    }

    fn is_up(&self) -> bool {
        self.is_up
    }

    fn history(&self) -> &History {
        &self.history
    }

    fn history_mut(&mut self) -> &mut History {
        &mut self.history
    }
}

/// Owner of every entity and its history.
#[derive(Debug, Clone)]
pub struct Topology {
    inputs: Vec<InputInterface>,
    outputs: Vec<OutputInterface>,
    history_depth: usize,
}

impl Topology {
    /// Empty topology whose entities keep `history_depth` deltas.
    pub fn new(history_depth: usize) -> Self {
        Topology {
            inputs: Vec::new(),
            outputs: Vec::new(),
            history_depth,
        }
    }

    pub fn history_depth(&self) -> usize {
        self.history_depth
    }

    pub fn inputs(&self) -> &[InputInterface] {
        &self.inputs
    }

    pub fn inputs_mut(&mut self) -> &mut [InputInterface] {
        &mut self.inputs
    }

    pub fn outputs(&self) -> &[OutputInterface] {
        &self.outputs
    }

    pub fn outputs_mut(&mut self) -> &mut [OutputInterface] {
        &mut self.outputs
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    /// Returns the input with `ifindex`, creating it if absent.
    pub fn insert_input(&mut self, ifindex: u32, name: &str) -> &mut InputInterface {
        let depth = self.history_depth;
        let pos = match self.inputs.binary_search_by_key(&ifindex, |i| i.ifindex) {
            Ok(pos) => pos,
            Err(pos) => {
                self.inputs
                    .insert(pos, InputInterface::new(ifindex, name, depth));
                pos
            }
        };
        &mut self.inputs[pos]
    }

    /// Returns the output with `ifindex`, creating it if absent.
    pub fn insert_output(&mut self, ifindex: u32, name: &str) -> &mut OutputInterface {
        let depth = self.history_depth;
        let pos = match self.outputs.binary_search_by_key(&ifindex, |o| o.ifindex) {
            Ok(pos) => pos,
            Err(pos) => {
                self.outputs.insert(
                    pos,
                    OutputInterface {
                        ifindex,
                        name: name.to_string(),
                        is_up: false,
                        promiscuous: false,
                        history: History::new(depth),
                    },
                );
                pos
            }
        };
        &mut self.outputs[pos]
    }

    pub fn input(&self, ifindex: u32) -> Option<&InputInterface> {
        self.inputs
            .binary_search_by_key(&ifindex, |i| i.ifindex)
            .ok()
            .map(|pos| &self.inputs[pos])
    }

    pub fn input_mut(&mut self, ifindex: u32) -> Option<&mut InputInterface> {
        self.inputs
            .binary_search_by_key(&ifindex, |i| i.ifindex)
            .ok()
            .map(move |pos| &mut self.inputs[pos])
    }

    pub fn output(&self, ifindex: u32) -> Option<&OutputInterface> {
        self.outputs
            .binary_search_by_key(&ifindex, |o| o.ifindex)
            .ok()
            .map(|pos| &self.outputs[pos])
    }

    pub fn output_mut(&mut self, ifindex: u32) -> Option<&mut OutputInterface> {
        self.outputs
            .binary_search_by_key(&ifindex, |o| o.ifindex)
            .ok()
            .map(move |pos| &mut self.outputs[pos])
    }

    /// Returns the VLAN entry under `parent`, creating it if absent. `None`
    /// if the parent input does not exist.
    pub fn insert_vlan(
        &mut self,
        parent: u32,
        vlan: VlanId,
        redirect: Option<u32>,
    ) -> Option<&mut VlanEntry> {
        let depth = self.history_depth;
        self.input_mut(parent)
            .map(|input| input.insert_vlan(vlan, redirect, depth))
    }

    pub fn vlan(&self, parent: u32, vlan: VlanId) -> Option<&VlanEntry> {
        self.input(parent).and_then(|input| input.vlan(vlan))
    }

    /// Output a VLAN entry redirects to, if any.
    pub fn redirect_target(&self, entry: &VlanEntry) -> Option<&OutputInterface> {
        entry.redirect.and_then(|ifindex| self.output(ifindex))
    }

    /// Every entity in display order: each input followed by its VLANs, then
    /// the outputs.
    pub fn entities(&self) -> Vec<EntityRef> {
        let mut refs = Vec::with_capacity(
            self.inputs.len()
                + self.outputs.len()
                + self.inputs.iter().map(|i| i.vlans.len()).sum::<usize>(),
        );
        for input in &self.inputs {
            refs.push(EntityRef::Input {
                ifindex: input.ifindex,
            });
            refs.extend(input.vlans.iter().map(|v| EntityRef::Vlan {
                parent: input.ifindex,
                vlan: v.vlan_id,
            }));
        }
        refs.extend(self.outputs.iter().map(|o| EntityRef::Output {
            ifindex: o.ifindex,
        }));
        refs
    }

    /// Resolves an [`EntityRef`].
    pub fn entity(&self, entity: EntityRef) -> Option<&dyn HasHistory> {
        match entity {
            EntityRef::Input { ifindex } => self.input(ifindex).map(|i| i as &dyn HasHistory),
            EntityRef::Output { ifindex } => self.output(ifindex).map(|o| o as &dyn HasHistory),
            EntityRef::Vlan { parent, vlan } => {
                self.vlan(parent, vlan).map(|v| v as &dyn HasHistory)
            }
        }
    }
}
