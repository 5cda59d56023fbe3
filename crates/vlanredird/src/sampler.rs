//! One sampling pass over the whole topology.
//!
//! A pass has two phases. The fetch phase reads the counters map of every
//! input and link flags and counters of every interface; any failure aborts
//! the pass with [`VlanRedirError::SamplingFailed`] before a single history
//! is touched. The commit phase then appends one sample to every entity,
//! refreshes the cached up/down state and rescales the charts.

use std::collections::BTreeMap;
use tracing::{debug, instrument};
use vlanredir_common::VlanCounters;

use crate::dataplane::Attachments;
use crate::error::{Result, VlanRedirError};
use crate::link::{LinkControl, LinkStatus};
use crate::stats::Sample;
use crate::state::AppState;
use crate::topology::{EntityRef, InputInterface, Topology};
use crate::types::VlanId;

/// Whether counter map `key` belongs to a VLAN entry of `input`.
fn is_configured(input: &InputInterface, key: u32) -> bool {
    u16::try_from(key)
        .ok()
        .and_then(|id| VlanId::new(id).ok())
        .is_some_and(|vlan| input.vlan(vlan).is_some())
}

/// Link state read during the fetch phase.
#[derive(Debug, Clone, Copy)]
struct LinkReading {
    status: LinkStatus,
    counters: Sample,
}

fn sampling_error(entity: &str, err: VlanRedirError) -> VlanRedirError {
    match err {
        VlanRedirError::SamplingFailed { .. } => err,
        other => VlanRedirError::sampling_failed(entity, other.to_string()),
    }
}

async fn read_link(link: &dyn LinkControl, ifindex: u32, name: &str) -> Result<LinkReading> {
    let status = link
        .get_flags(ifindex)
        .await
        .map_err(|e| sampling_error(name, e))?;
    let counters = link
        .get_counters(ifindex)
        .await
        .map_err(|e| sampling_error(name, e))?;
    Ok(LinkReading { status, counters })
}

/// Reads the counters map of every input, in input order.
fn read_vlan_counters(
    topology: &Topology,
    attachments: &Attachments,
) -> Result<Vec<BTreeMap<u32, VlanCounters>>> {
    topology
        .inputs()
        .iter()
        .map(|input| -> Result<BTreeMap<u32, VlanCounters>> {
            let engine = attachments.get(input.ifindex).ok_or_else(|| {
                VlanRedirError::sampling_failed(&input.name, "no program attached")
            })?;
            Ok(engine
                .vlan_counters()
                .map_err(|e| sampling_error(&input.name, e))?
                .into_iter()
                .collect())
        })
        .collect()
}

/// Folds raw counters into the per-entity histories.
#[derive(Debug, Clone, Copy)]
pub struct StatisticsEngine {
    chart_range_bits: u32,
}

impl StatisticsEngine {
    pub fn new(chart_range_bits: u32) -> Self {
        Self { chart_range_bits }
    }

    pub fn chart_range_bits(&self) -> u32 {
        self.chart_range_bits
    }

    /// Samples every entity once. Returns the entities whose chart scale
    /// changed.
    #[instrument(skip_all)]
    pub async fn sample(
        &self,
        state: &mut AppState,
        link: &dyn LinkControl,
    ) -> Result<Vec<EntityRef>> {
        let vlan_readings = read_vlan_counters(&state.topology, &state.attachments)?;
        let topology = &mut state.topology;

        let mut input_readings = Vec::with_capacity(topology.inputs().len());
        for input in topology.inputs() {
            input_readings.push(read_link(link, input.ifindex, &input.name).await?);
        }
        let mut output_readings = Vec::with_capacity(topology.outputs().len());
        for output in topology.outputs() {
            output_readings.push(read_link(link, output.ifindex, &output.name).await?);
        }

        let mut rescaled = Vec::new();
        let range_bits = self.chart_range_bits;

        for (output, reading) in topology.outputs_mut().iter_mut().zip(output_readings) {
            output.is_up = reading.status.is_operational();
            output.promiscuous = reading.status.promiscuous;
            output.history.record(reading.counters);
            if !output.history.rescale(range_bits).is_empty() {
                rescaled.push(EntityRef::Output {
                    ifindex: output.ifindex,
                });
            }
        }
        let outputs_up: BTreeMap<u32, bool> = topology
            .outputs()
            .iter()
            .map(|o| (o.ifindex, o.is_up))
            .collect();

        let readings = input_readings.into_iter().zip(vlan_readings);
        for (input, (reading, counters)) in topology.inputs_mut().iter_mut().zip(readings) {
            input.is_up = reading.status.is_operational();
            input.promiscuous = reading.status.promiscuous;
            input.history.record(reading.counters);
            if !input.history.rescale(range_bits).is_empty() {
                rescaled.push(EntityRef::Input {
                    ifindex: input.ifindex,
                });
            }

            let parent_up = input.is_up;
            for key in counters.keys().filter(|key| !is_configured(input, **key)) {
                debug!(interface = %input.name, vlan = key, "Counters for unconfigured VLAN");
            }

            for entry in input.vlans_mut() {
                let sample = match counters.get(&entry.vlan_id.map_key()) {
                    Some(c) => Sample::from_vlan_counters(c),
                    None => entry.history.latest().unwrap_or_default(),
                };
                entry.is_up = parent_up
                    && entry
                        .redirect
                        .and_then(|target| outputs_up.get(&target).copied())
                        .unwrap_or(false);
                entry.history.record(sample);
                if !entry.history.rescale(range_bits).is_empty() {
                    rescaled.push(EntityRef::Vlan {
                        parent: entry.parent,
                        vlan: entry.vlan_id,
                    });
                }
            }
        }

        debug!(
            inputs = topology.inputs().len(),
            outputs = topology.outputs().len(),
            rescaled = rescaled.len(),
            "Sampled topology"
        );
        Ok(rescaled)
    }
}

/// Label of an entity for log lines, `?` if it no longer resolves.
pub fn entity_label(topology: &Topology, entity: EntityRef) -> String {
    topology
        .entity(entity)
        .map(|e| e.label())
        .unwrap_or_else(|| "?".to_string())
}
