//! In-memory stand-ins for the kernel side, used by unit and integration
//! tests.
//!
//! [`FakeKernel`] holds per-input redirect and counter maps and can push
//! frames through [`vlanredir_common::classify`] the way the XDP program
//! does. [`FakeLink`] records every interface control call.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use vlanredir_common::{
    classify, frame_vlan_id, Verdict, VlanCounters, GLOBAL_OVERRIDE_KEY, UNTAGGED_KEY,
};

use crate::dataplane::{EngineLoader, RedirectMaps};
use crate::error::{Result, VlanRedirError};
use crate::link::{LinkControl, LinkStatus};
use crate::stats::Sample;
use crate::types::{VlanId, XdpMode};

#[derive(Debug, Default)]
struct KernelState {
    attached: BTreeSet<u32>,
    fail_attach: BTreeSet<u32>,
    fail_detach: BTreeSet<u32>,
    fail_map_write: BTreeSet<u32>,
    fail_counters: BTreeSet<u32>,
    redirects: BTreeMap<u32, BTreeMap<u32, u32>>,
    counters: BTreeMap<u32, BTreeMap<u32, VlanCounters>>,
}

/// Shared fake of every attached program instance and its maps.
#[derive(Debug, Clone, Default)]
pub struct FakeKernel {
    state: Arc<Mutex<KernelState>>,
}

impl FakeKernel {
    /// Inputs currently holding an attached program, sorted.
    pub fn attached(&self) -> Vec<u32> {
        self.state.lock().attached.iter().copied().collect()
    }

    pub fn fail_attach(&self, ifindex: u32) {
        self.state.lock().fail_attach.insert(ifindex);
    }

    pub fn fail_detach(&self, ifindex: u32) {
        self.state.lock().fail_detach.insert(ifindex);
    }

    pub fn fail_map_write(&self, ifindex: u32) {
        self.state.lock().fail_map_write.insert(ifindex);
    }

    pub fn fail_counters(&self, ifindex: u32) {
        self.state.lock().fail_counters.insert(ifindex);
    }

    /// Redirect map of `input`.
    pub fn redirects(&self, input: u32) -> BTreeMap<u32, u32> {
        self.state
            .lock()
            .redirects
            .get(&input)
            .cloned()
            .unwrap_or_default()
    }

    /// Writes a redirect entry behind the loader's back.
    pub fn set_redirect(&self, input: u32, key: u32, ifindex: u32) {
        self.state
            .lock()
            .redirects
            .entry(input)
            .or_default()
            .insert(key, ifindex);
    }

    /// Counter map entry of `input` for `key`.
    pub fn counters(&self, input: u32, key: u32) -> Option<VlanCounters> {
        self.state
            .lock()
            .counters
            .get(&input)
            .and_then(|m| m.get(&key))
            .copied()
    }

    pub fn set_counters(&self, input: u32, key: u32, counters: VlanCounters) {
        self.state
            .lock()
            .counters
            .entry(input)
            .or_default()
            .insert(key, counters);
    }

    /// Parses and classifies a raw frame received on `input`. A truncated
    /// header is dropped and counted against the untagged key.
    pub fn deliver_frame(&self, input: u32, frame: &[u8], up: &[u32]) -> Verdict {
        match frame_vlan_id(frame) {
            Some(vlan_id) => self.deliver(input, vlan_id, frame.len() as u64, up),
            None => {
                let mut state = self.state.lock();
                let counters = state.counters.entry(input).or_default();
                counters.entry(UNTAGGED_KEY).or_default().dropped += 1;
                Verdict::Drop
            }
        }
    }

    /// Classifies one frame received on `input` and updates its counters.
    /// `up` lists the outputs that accept redirects.
    pub fn deliver(&self, input: u32, vlan_id: u32, len: u64, up: &[u32]) -> Verdict {
        let mut state = self.state.lock();
        let redirects = state.redirects.get(&input).cloned().unwrap_or_default();
        let verdict = classify(
            vlan_id,
            |key| redirects.get(&key).copied(),
            |ifindex| up.contains(&ifindex),
        );

        let counters = state.counters.entry(input).or_default();
        let mut forward = |key: u32| {
            let entry = counters.entry(key).or_default();
            entry.bytes += len;
            entry.packets += 1;
        };
        match verdict {
            Verdict::Override { .. } => {
                forward(vlan_id);
                forward(GLOBAL_OVERRIDE_KEY);
            }
            Verdict::Vlan { .. } => forward(vlan_id),
            Verdict::Drop => counters.entry(vlan_id).or_default().dropped += 1,
        }
        verdict
    }
}

/// [`EngineLoader`] attaching into a [`FakeKernel`].
#[derive(Debug, Clone)]
pub struct FakeEngineLoader {
    kernel: FakeKernel,
    mode: XdpMode,
}

impl FakeEngineLoader {
    pub fn new(kernel: FakeKernel) -> Self {
        Self {
            kernel,
            mode: XdpMode::Skb,
        }
    }
}

impl EngineLoader for FakeEngineLoader {
    fn mode(&self) -> XdpMode {
        self.mode
    }

    fn attach(&mut self, ifindex: u32, name: &str) -> Result<Box<dyn RedirectMaps>> {
        let mut state = self.kernel.state.lock();
        if state.fail_attach.contains(&ifindex) {
            return Err(VlanRedirError::attach_failed(name, "attach refused"));
        }
        state.attached.insert(ifindex);
        Ok(Box::new(FakeMaps {
            ifindex,
            interface: name.to_string(),
            kernel: self.kernel.clone(),
        }))
    }
}

struct FakeMaps {
    ifindex: u32,
    interface: String,
    kernel: FakeKernel,
}

impl RedirectMaps for FakeMaps {
    fn interface(&self) -> &str {
        &self.interface
    }

    fn set_redirect(&mut self, vlan: VlanId, ifindex: u32) -> Result<()> {
        let mut state = self.kernel.state.lock();
        if state.fail_map_write.contains(&self.ifindex) {
            return Err(VlanRedirError::map_program_failed(
                &self.interface,
                vlan.as_u16(),
                "map full",
            ));
        }
        state
            .redirects
            .entry(self.ifindex)
            .or_default()
            .insert(vlan.map_key(), ifindex);
        Ok(())
    }

    fn redirect(&self, vlan: VlanId) -> Result<Option<u32>> {
        Ok(self
            .kernel
            .state
            .lock()
            .redirects
            .get(&self.ifindex)
            .and_then(|m| m.get(&vlan.map_key()))
            .copied())
    }

    fn vlan_counters(&self) -> Result<Vec<(u32, VlanCounters)>> {
        let state = self.kernel.state.lock();
        if state.fail_counters.contains(&self.ifindex) {
            return Err(VlanRedirError::sampling_failed(&self.interface, "map read failed"));
        }
        Ok(state
            .counters
            .get(&self.ifindex)
            .map(|m| m.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default())
    }

    fn detach(&mut self) -> Result<()> {
        let mut state = self.kernel.state.lock();
        if state.fail_detach.contains(&self.ifindex) {
            return Err(VlanRedirError::attach_failed(&self.interface, "detach refused"));
        }
        state.attached.remove(&self.ifindex);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LinkState {
    names: BTreeMap<String, u32>,
    flags: BTreeMap<u32, LinkStatus>,
    counters: BTreeMap<u32, Sample>,
    fail_counters: BTreeSet<u32>,
    denied: BTreeSet<String>,
    calls: Vec<String>,
}

/// [`LinkControl`] over a fixed set of named interfaces.
#[derive(Debug, Default)]
pub struct FakeLink {
    state: Mutex<LinkState>,
}

impl FakeLink {
    /// Interfaces that exist, all down.
    pub fn with_interfaces(interfaces: &[(&str, u32)]) -> Self {
        let link = FakeLink::default();
        {
            let mut state = link.state.lock();
            for (name, ifindex) in interfaces {
                state.names.insert(name.to_string(), *ifindex);
                state.flags.insert(*ifindex, LinkStatus::default());
            }
        }
        link
    }

    /// Calls in order, e.g. `"up eth0"`, `"promisc eth0"`, `"rxvlan eth0"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn set_counters(&self, ifindex: u32, sample: Sample) {
        self.state.lock().counters.insert(ifindex, sample);
    }

    pub fn set_status(&self, ifindex: u32, status: LinkStatus) {
        self.state.lock().flags.insert(ifindex, status);
    }

    pub fn fail_counters(&self, ifindex: u32) {
        self.state.lock().fail_counters.insert(ifindex);
    }

    /// Every operation on `name` fails with `OperationDenied`.
    pub fn deny(&self, name: &str) {
        self.state.lock().denied.insert(name.to_string());
    }

    fn record(&self, op: &str, name: &str) -> Result<u32> {
        let mut state = self.state.lock();
        state.calls.push(format!("{} {}", op, name));
        if state.denied.contains(name) {
            return Err(VlanRedirError::operation_denied(op, "permission denied"));
        }
        state
            .names
            .get(name)
            .copied()
            .ok_or_else(|| VlanRedirError::interface_not_found(name))
    }
}

#[async_trait]
impl LinkControl for FakeLink {
    fn resolve(&self, name: &str) -> Result<u32> {
        self.state
            .lock()
            .names
            .get(name)
            .copied()
            .ok_or_else(|| VlanRedirError::interface_not_found(name))
    }

    async fn set_up(&self, name: &str) -> Result<()> {
        let ifindex = self.record("up", name)?;
        let mut state = self.state.lock();
        let status = state.flags.entry(ifindex).or_default();
        status.up = true;
        status.running = true;
        Ok(())
    }

    async fn set_promiscuous(&self, name: &str) -> Result<()> {
        let ifindex = self.record("promisc", name)?;
        self.state
            .lock()
            .flags
            .entry(ifindex)
            .or_default()
            .promiscuous = true;
        Ok(())
    }

    async fn disable_rx_vlan_offload(&self, name: &str) -> Result<()> {
        self.record("rxvlan", name).map(|_| ())
    }

    async fn disable_tx_vlan_offload(&self, name: &str) -> Result<()> {
        self.record("txvlan", name).map(|_| ())
    }

    async fn get_flags(&self, ifindex: u32) -> Result<LinkStatus> {
        self.state
            .lock()
            .flags
            .get(&ifindex)
            .copied()
            .ok_or_else(|| VlanRedirError::link_not_found(ifindex))
    }

    async fn get_counters(&self, ifindex: u32) -> Result<Sample> {
        let state = self.state.lock();
        if state.fail_counters.contains(&ifindex) || !state.flags.contains_key(&ifindex) {
            return Err(VlanRedirError::link_not_found(ifindex));
        }
        Ok(state.counters.get(&ifindex).copied().unwrap_or_default())
    }
}
