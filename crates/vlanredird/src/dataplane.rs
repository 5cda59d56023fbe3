//! Attachment of the XDP redirect program and access to its maps.
//!
//! Each input interface gets its own program instance. The instance owns its
//! two maps, so a [`RedirectMaps`] handle is both the attachment (detach) and
//! the map accessor (program redirects, read counters) for one input.

use aya::maps::{HashMap as BpfHashMap, MapData, MapError};
use aya::programs::xdp::XdpLinkId;
use aya::programs::{Xdp, XdpFlags};
use aya::{include_bytes_aligned, Ebpf, EbpfLoader};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info, instrument};
use vlanredir_common::{VlanCounters, VLAN_REDIRECT_MAP, VLAN_STATS_MAP, XDP_PROGRAM};

use crate::error::{Result, VlanRedirError};
use crate::types::{VlanId, XdpMode};

/// Object file produced by build.rs. Empty when the eBPF toolchain was
/// unavailable at build time.
static EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/vlanredir"));

/// Handle on one attached program instance and its maps.
pub trait RedirectMaps: Send {
    /// Input interface the program is attached to.
    fn interface(&self) -> &str;

    /// Writes `vlan -> ifindex` into the redirect map.
    fn set_redirect(&mut self, vlan: VlanId, ifindex: u32) -> Result<()>;

    /// Reads the redirect target of `vlan`, `None` if absent.
    fn redirect(&self, vlan: VlanId) -> Result<Option<u32>>;

    /// Snapshot of every entry of the counters map.
    fn vlan_counters(&self) -> Result<Vec<(u32, VlanCounters)>>;

    /// Detaches the program. Calling it twice is a no-op.
    fn detach(&mut self) -> Result<()>;
}

/// Loads and attaches program instances.
pub trait EngineLoader: Send {
    fn mode(&self) -> XdpMode;

    /// Loads a fresh program instance and attaches it to `ifindex`.
    fn attach(&mut self, ifindex: u32, name: &str) -> Result<Box<dyn RedirectMaps>>;
}

/// [`EngineLoader`] using aya and the embedded object.
#[derive(Debug, Clone, Copy)]
pub struct XdpEngineLoader {
    mode: XdpMode,
}

impl XdpEngineLoader {
    pub fn new(mode: XdpMode) -> Self {
        Self { mode }
    }
}

fn xdp_flags(mode: XdpMode) -> XdpFlags {
    let mode_flag = match mode {
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Driver => XdpFlags::DRV_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    };
    mode_flag | XdpFlags::UPDATE_IF_NOEXIST
}

impl EngineLoader for XdpEngineLoader {
    fn mode(&self) -> XdpMode {
        self.mode
    }

    #[instrument(skip(self))]
    fn attach(&mut self, ifindex: u32, name: &str) -> Result<Box<dyn RedirectMaps>> {
        if EBPF_BYTES.is_empty() {
            return Err(VlanRedirError::attach_failed(
                name,
                "XDP object missing from this build (eBPF toolchain unavailable)",
            ));
        }

        let mut ebpf = EbpfLoader::new()
            .load(EBPF_BYTES)
            .map_err(|e| VlanRedirError::attach_failed(name, format!("load object: {}", e)))?;

        let program: &mut Xdp = ebpf
            .program_mut(XDP_PROGRAM)
            .ok_or_else(|| {
                VlanRedirError::attach_failed(name, format!("program {} not found", XDP_PROGRAM))
            })?
            .try_into()
            .map_err(|e| VlanRedirError::attach_failed(name, format!("wrong program type: {}", e)))?;
        program
            .load()
            .map_err(|e| VlanRedirError::attach_failed(name, format!("load program: {}", e)))?;
        let link = program
            .attach_to_if_index(ifindex, xdp_flags(self.mode))
            .map_err(|e| VlanRedirError::attach_failed(name, format!("attach: {}", e)))?;

        let mut attachment = XdpAttachment {
            interface: name.to_string(),
            link: Some(link),
            redirects: None,
            counters: None,
            ebpf,
        };
        if let Err(e) = attachment.take_maps() {
            return Err(abandon(&mut attachment, e));
        }

        info!(interface = %name, ifindex, mode = %self.mode, "Attached redirect program");
        Ok(Box::new(attachment))
    }
}

/// Detaches an instance whose setup failed after it was attached. Returns
/// `cause`; a failing detach is logged since the program stays on the link.
fn abandon(engine: &mut dyn RedirectMaps, cause: VlanRedirError) -> VlanRedirError {
    if let Err(e) = engine.detach() {
        error!(
            interface = %engine.interface(),
            error = %e,
            cause = %cause,
            "Detach after failed setup failed, program left attached"
        );
    }
    cause
}

/// One loaded program instance attached to one input.
pub struct XdpAttachment {
    interface: String,
    link: Option<XdpLinkId>,
    redirects: Option<BpfHashMap<MapData, u32, u32>>,
    counters: Option<BpfHashMap<MapData, u32, VlanCounters>>,
    ebpf: Ebpf,
}

impl XdpAttachment {
    fn take_maps(&mut self) -> Result<()> {
        let map = self.ebpf.take_map(VLAN_REDIRECT_MAP).ok_or_else(|| {
            VlanRedirError::attach_failed(&self.interface, format!("map {} not found", VLAN_REDIRECT_MAP))
        })?;
        self.redirects = Some(BpfHashMap::try_from(map).map_err(|e| {
            VlanRedirError::attach_failed(&self.interface, format!("{}: {}", VLAN_REDIRECT_MAP, e))
        })?);

        let map = self.ebpf.take_map(VLAN_STATS_MAP).ok_or_else(|| {
            VlanRedirError::attach_failed(&self.interface, format!("map {} not found", VLAN_STATS_MAP))
        })?;
        self.counters = Some(BpfHashMap::try_from(map).map_err(|e| {
            VlanRedirError::attach_failed(&self.interface, format!("{}: {}", VLAN_STATS_MAP, e))
        })?);
        Ok(())
    }

    fn redirect_map(&self, vlan: VlanId) -> Result<&BpfHashMap<MapData, u32, u32>> {
        self.redirects.as_ref().ok_or_else(|| {
            VlanRedirError::map_program_failed(&self.interface, vlan.as_u16(), "redirect map not open")
        })
    }
}

impl RedirectMaps for XdpAttachment {
    fn interface(&self) -> &str {
        &self.interface
    }

    fn set_redirect(&mut self, vlan: VlanId, ifindex: u32) -> Result<()> {
        let interface = self.interface.clone();
        let map = self.redirects.as_mut().ok_or_else(|| {
            VlanRedirError::map_program_failed(&interface, vlan.as_u16(), "redirect map not open")
        })?;
        map.insert(vlan.map_key(), ifindex, 0)
            .map_err(|e| VlanRedirError::map_program_failed(&interface, vlan.as_u16(), e.to_string()))?;
        debug!(interface = %interface, vlan = %vlan, ifindex, "Programmed redirect entry");
        Ok(())
    }

    fn redirect(&self, vlan: VlanId) -> Result<Option<u32>> {
        match self.redirect_map(vlan)?.get(&vlan.map_key(), 0) {
            Ok(ifindex) => Ok(Some(ifindex)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(VlanRedirError::map_program_failed(
                &self.interface,
                vlan.as_u16(),
                e.to_string(),
            )),
        }
    }

    fn vlan_counters(&self) -> Result<Vec<(u32, VlanCounters)>> {
        let map = self.counters.as_ref().ok_or_else(|| {
            VlanRedirError::sampling_failed(&self.interface, "counters map not open")
        })?;
        map.iter()
            .map(|item| {
                item.map_err(|e| {
                    VlanRedirError::sampling_failed(
                        &self.interface,
                        format!("{}: {}", VLAN_STATS_MAP, e),
                    )
                })
            })
            .collect()
    }

    fn detach(&mut self) -> Result<()> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        let program: &mut Xdp = self
            .ebpf
            .program_mut(XDP_PROGRAM)
            .ok_or_else(|| {
                VlanRedirError::attach_failed(
                    &self.interface,
                    format!("program {} not found", XDP_PROGRAM),
                )
            })?
            .try_into()
            .map_err(|e| {
                VlanRedirError::attach_failed(&self.interface, format!("wrong program type: {}", e))
            })?;
        program
            .detach(link)
            .map_err(|e| VlanRedirError::attach_failed(&self.interface, format!("detach: {}", e)))?;
        info!(interface = %self.interface, "Detached redirect program");
        Ok(())
    }
}

/// Attached program instances keyed by input ifindex.
#[derive(Default)]
pub struct Attachments {
    engines: BTreeMap<u32, Box<dyn RedirectMaps>>,
}

impl fmt::Debug for Attachments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.engines.iter().map(|(ifindex, e)| (ifindex, e.interface())))
            .finish()
    }
}

impl Attachments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the handle for `ifindex` unless one is already there, and
    /// returns the stored handle.
    pub fn insert(&mut self, ifindex: u32, engine: Box<dyn RedirectMaps>) -> &mut dyn RedirectMaps {
        let slot = self.engines.entry(ifindex).or_insert(engine);
        slot.as_mut()
    }

    pub fn get(&self, ifindex: u32) -> Option<&dyn RedirectMaps> {
        match self.engines.get(&ifindex) {
            Some(engine) => Some(engine.as_ref()),
            None => None,
        }
    }

    pub fn get_mut(&mut self, ifindex: u32) -> Option<&mut dyn RedirectMaps> {
        match self.engines.get_mut(&ifindex) {
            Some(engine) => Some(engine.as_mut()),
            None => None,
        }
    }

    pub fn contains(&self, ifindex: u32) -> bool {
        self.engines.contains_key(&ifindex)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Detaches and drops every handle. A failing detach is logged and the
    /// rest still run. Returns how many detached cleanly.
    pub fn detach_all(&mut self) -> usize {
        let mut detached = 0;
        while let Some((ifindex, mut engine)) = self.engines.pop_first() {
            match engine.detach() {
                Ok(()) => detached += 1,
                Err(e) => error!(ifindex, interface = %engine.interface(), error = %e, "Detach failed"),
            }
        }
        detached
    }
}
