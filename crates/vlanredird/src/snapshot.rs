//! Per-tick view of the topology handed to the display side.

use serde::Serialize;
use std::fmt::Write;

use crate::selector::Selector;
use crate::stats::{format_size, Sample};
use crate::topology::{EntityRef, Topology};
use crate::types::{DisplayMode, XdpMode};

/// Everything the display needs about one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityView {
    pub entity: EntityRef,
    pub label: String,
    pub is_up: bool,
    /// Attach mode, inputs only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xdp_mode: Option<XdpMode>,
    pub latest: Option<Sample>,
    pub diff: Sample,
    pub diff_max: Sample,
    pub diff_sma: Option<Sample>,
    pub count: usize,
    /// Chart shift per [`DisplayMode`], indexed by [`DisplayMode::index`].
    pub shifts: [u32; 3],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub tick: u64,
    pub entities: Vec<EntityView>,
    pub selector: Option<Selector>,
    /// Entities whose chart scale changed this tick and need a full redraw.
    pub rescaled: Vec<EntityRef>,
}

impl Snapshot {
    /// Copies the displayed state out of `topology`, in traversal order.
    pub fn capture(
        tick: u64,
        topology: &Topology,
        selector: Option<Selector>,
        rescaled: Vec<EntityRef>,
    ) -> Self {
        let entities = topology
            .entities()
            .into_iter()
            .filter_map(|entity| {
                let item = topology.entity(entity)?;
                let history = item.history();
                let xdp_mode = match entity {
                    EntityRef::Input { ifindex } => topology.input(ifindex).and_then(|i| i.xdp_mode),
                    _ => None,
                };
                Some(EntityView {
                    entity,
                    label: item.label(),
                    is_up: item.is_up(),
                    xdp_mode,
                    latest: history.latest(),
                    diff: history.diff(),
                    diff_max: history.diff_max(),
                    diff_sma: history.diff_sma(),
                    count: history.count(),
                    shifts: DisplayMode::ALL.map(|mode| history.scale(mode).shift()),
                })
            })
            .collect();
        Snapshot {
            tick,
            entities,
            selector,
            rescaled,
        }
    }

    pub fn entity(&self, entity: EntityRef) -> Option<&EntityView> {
        self.entities.iter().find(|view| view.entity == entity)
    }

    /// One line with the per-tick byte deltas of every entity, e.g.
    /// `eth0 up rx 1.5 KiB tx 0, eth0.10 up rx 1.5 KiB tx 0`.
    pub fn summary(&self) -> String {
        let mut line = String::new();
        for (i, view) in self.entities.iter().enumerate() {
            if i > 0 {
                line.push_str(", ");
            }
            let _ = write!(
                line,
                "{} {} rx {} tx {}",
                view.label,
                if view.is_up { "up" } else { "down" },
                format_size(view.diff.rx_bytes),
                format_size(view.diff.tx_bytes)
            );
        }
        line
    }
}
