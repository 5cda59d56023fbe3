//! Turns a validated [`TopologyDescription`] into prepared interfaces,
//! attached programs and programmed redirect entries.

use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};
use vlanredir_common::NO_REDIRECT;

use crate::config::TopologyDescription;
use crate::dataplane::{Attachments, EngineLoader};
use crate::error::{Result, VlanRedirError};
use crate::link::LinkControl;
use crate::topology::Topology;

/// Builds `topology` from `desc`.
///
/// Every interface name is resolved before anything is touched. Inputs are
/// then prepared (rx VLAN offload off, promiscuous, up) and get their own
/// program instance; outputs are prepared (tx VLAN offload off, up) the first
/// time a redirect names them.
///
/// On error, whatever was attached so far stays in `attachments`; the caller
/// owns cleanup.
#[instrument(skip_all, fields(inputs = desc.inputs.len()))]
pub async fn load_topology(
    desc: &TopologyDescription,
    link: &dyn LinkControl,
    engines: &mut dyn EngineLoader,
    topology: &mut Topology,
    attachments: &mut Attachments,
) -> Result<()> {
    let mut ifindexes = BTreeMap::new();
    for name in desc.interface_names() {
        let ifindex = link.resolve(name)?;
        debug!(interface = name, ifindex, "Resolved interface");
        ifindexes.insert(name, ifindex);
    }
    let ifindex_of = |name: &str| {
        ifindexes
            .get(name)
            .copied()
            .ok_or_else(|| VlanRedirError::interface_not_found(name))
    };

    for input in &desc.inputs {
        let ifindex = ifindex_of(&input.name)?;
        prepare_input(link, &input.name).await?;

        let engine = engines.attach(ifindex, &input.name)?;
        let engine = attachments.insert(ifindex, engine);
        let entry = topology.insert_input(ifindex, &input.name);
        entry.xdp_mode = Some(engines.mode());
        info!(interface = %input.name, ifindex, mode = %engines.mode(), "Input attached");

        for redirect in &input.redirects {
            let output = ifindex_of(&redirect.output)?;
            if topology.output(output).is_none() {
                prepare_output(link, &redirect.output).await?;
                topology.insert_output(output, &redirect.output);
            }

            engine.set_redirect(redirect.vlan, output)?;
            let written = engine
                .redirect(redirect.vlan)?
                .filter(|target| *target != NO_REDIRECT);
            if written != Some(output) {
                warn!(
                    interface = %input.name,
                    vlan = %redirect.vlan,
                    expected = output,
                    read_back = ?written,
                    "Redirect entry read back differs"
                );
            }
            topology.insert_vlan(ifindex, redirect.vlan, written);
            debug!(
                interface = %input.name,
                vlan = %redirect.vlan,
                output = %redirect.output,
                "Programmed redirect"
            );
        }
    }

    let inputs = topology.inputs().len();
    let outputs = topology.outputs().len();
    if inputs == 0 || outputs == 0 {
        return Err(VlanRedirError::TopologyIncomplete { inputs, outputs });
    }
    info!(inputs, outputs, "Topology loaded");
    Ok(())
}

async fn prepare_input(link: &dyn LinkControl, name: &str) -> Result<()> {
    link.disable_rx_vlan_offload(name).await?;
    link.set_promiscuous(name).await?;
    link.set_up(name).await
}

async fn prepare_output(link: &dyn LinkControl, name: &str) -> Result<()> {
    link.disable_tx_vlan_offload(name).await?;
    link.set_up(name).await
}
