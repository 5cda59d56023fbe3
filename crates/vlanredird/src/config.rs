//! Topology file and runtime settings.
//!
//! The topology file is JSON:
//!
//! ```json
//! { "interfaces": { "eth0": { "redirect_map": { "none": "eth2", "10": "eth3", "any": "eth4" } } } }
//! ```
//!
//! It is parsed into a [`TopologyFile`] and then validated into a
//! [`TopologyDescription`], the only form the loader accepts.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, VlanRedirError};
use crate::types::{VlanId, XdpMode};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vlanredir/config.json";

/// Deltas kept per entity.
pub const DEFAULT_HISTORY_DEPTH: usize = 60;

/// Upper bound on the history depth, one day of one-second samples.
pub const MAX_HISTORY_DEPTH: usize = 86_400;

pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Bits of vertical resolution of a chart.
pub const DEFAULT_CHART_RANGE_BITS: u32 = 7;

/// IFNAMSIZ including the terminating NUL.
const IFNAMSIZ: usize = 16;

/// Raw topology file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyFile {
    /// Input interface name to its redirect section.
    #[serde(deserialize_with = "unique_keys")]
    pub interfaces: BTreeMap<String, InputSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputSection {
    /// VLAN label (`none`, `any` or `1`-`4094`) to output interface name.
    #[serde(default, deserialize_with = "unique_keys")]
    pub redirect_map: BTreeMap<String, String>,
}

/// Deserializes a JSON object into a map, rejecting a key that appears twice
/// instead of keeping the last value.
fn unique_keys<'de, D, V>(deserializer: D) -> std::result::Result<BTreeMap<String, V>, D::Error>
where
    D: serde::Deserializer<'de>,
    V: Deserialize<'de>,
{
    use serde::de::{self, MapAccess, Visitor};
    use std::fmt;
    use std::marker::PhantomData;

    struct UniqueKeysVisitor<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for UniqueKeysVisitor<V> {
        type Value = BTreeMap<String, V>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an object with unique keys")
        }

        fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut map = BTreeMap::new();
            while let Some((key, value)) = access.next_entry::<String, V>()? {
                if map.contains_key(&key) {
                    return Err(de::Error::custom(format!("duplicate key '{}'", key)));
                }
                map.insert(key, value);
            }
            Ok(map)
        }
    }

    deserializer.deserialize_map(UniqueKeysVisitor(PhantomData))
}

/// One `vlan -> output` pair of an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub vlan: VlanId,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDescription {
    pub name: String,
    /// Sorted by VLAN id.
    pub redirects: Vec<Redirect>,
}

/// Validated topology, ready for the loader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyDescription {
    pub inputs: Vec<InputDescription>,
}

impl TopologyDescription {
    /// Every distinct interface name, inputs first.
    pub fn interface_names(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let inputs = self.inputs.iter().map(|i| i.name.as_str());
        let outputs = self
            .inputs
            .iter()
            .flat_map(|i| i.redirects.iter().map(|r| r.output.as_str()));
        inputs.chain(outputs).filter(|name| seen.insert(*name)).collect()
    }
}

fn validate_ifname(field: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VlanRedirError::config_invalid(field, "empty interface name"));
    }
    if name.len() >= IFNAMSIZ {
        return Err(VlanRedirError::config_invalid(
            field,
            format!("interface name '{}' longer than {} bytes", name, IFNAMSIZ - 1),
        ));
    }
    if name.contains(|c: char| c == '/' || c.is_whitespace()) {
        return Err(VlanRedirError::config_invalid(
            field,
            format!("invalid interface name '{}'", name),
        ));
    }
    Ok(())
}

impl TopologyFile {
    /// Reads and parses the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading topology file");
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text).map_err(|e| match e {
            VlanRedirError::ConfigInvalid { message, .. } => {
                VlanRedirError::config_invalid(path.display().to_string(), message)
            }
            other => other,
        })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| VlanRedirError::config_invalid("topology", e.to_string()))
    }

    /// Checks names and labels and normalises labels to [`VlanId`]s.
    ///
    /// # Errors
    ///
    /// [`VlanRedirError::ConfigInvalid`] for an empty or oversized interface
    /// name, an unknown label, a decimal label outside 1-4094, an empty output
    /// name or two labels naming the same VLAN on one input.
    pub fn validate(&self) -> Result<TopologyDescription> {
        let mut inputs = Vec::with_capacity(self.interfaces.len());
        for (name, section) in &self.interfaces {
            validate_ifname("interfaces", name)?;
            let field = format!("interfaces.{}.redirect_map", name);

            let mut redirects: BTreeMap<VlanId, Redirect> = BTreeMap::new();
            for (label, output) in &section.redirect_map {
                let vlan = VlanId::from_label(label)
                    .map_err(|_| VlanRedirError::config_invalid(&field, format!("invalid VLAN label '{}'", label)))?;
                validate_ifname(&field, output)?;
                if redirects.contains_key(&vlan) {
                    return Err(VlanRedirError::config_invalid(
                        &field,
                        format!("duplicate VLAN {} (label '{}')", vlan.as_u16(), label),
                    ));
                }
                redirects.insert(
                    vlan,
                    Redirect {
                        vlan,
                        output: output.clone(),
                    },
                );
            }

            inputs.push(InputDescription {
                name: name.clone(),
                redirects: redirects.into_values().collect(),
            });
        }
        Ok(TopologyDescription { inputs })
    }
}

/// Runtime knobs, filled from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub history_depth: usize,
    pub interval: Duration,
    pub chart_range_bits: u32,
    pub xdp_mode: XdpMode,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            history_depth: DEFAULT_HISTORY_DEPTH,
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            chart_range_bits: DEFAULT_CHART_RANGE_BITS,
            xdp_mode: XdpMode::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.history_depth == 0 {
            return Err(VlanRedirError::config_invalid("history", "must be at least 1"));
        }
        if self.history_depth > MAX_HISTORY_DEPTH {
            return Err(VlanRedirError::config_invalid(
                "history",
                format!("{} exceeds {}", self.history_depth, MAX_HISTORY_DEPTH),
            ));
        }
        if self.interval.is_zero() {
            return Err(VlanRedirError::config_invalid("interval-ms", "must be positive"));
        }
        if !(1..u64::BITS).contains(&self.chart_range_bits) {
            return Err(VlanRedirError::config_invalid(
                "chart-range-bits",
                format!("{} not in 1-63", self.chart_range_bits),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn vlan(id: u16) -> VlanId {
        VlanId::new(id).unwrap()
    }

    #[test]
    fn test_parse_and_validate() {
        let file = TopologyFile::from_json(
            r#"{ "interfaces": { "eth0": { "redirect_map": { "none": "eth2", "10": "eth3", "any": "eth4" } } } }"#,
        )
        .unwrap();
        let desc = file.validate().unwrap();

        assert_eq!(desc.inputs.len(), 1);
        assert_eq!(desc.inputs[0].name, "eth0");
        let pairs: Vec<(u16, &str)> = desc.inputs[0]
            .redirects
            .iter()
            .map(|r| (r.vlan.as_u16(), r.output.as_str()))
            .collect();
        assert_eq!(pairs, vec![(0, "eth2"), (10, "eth3"), (4095, "eth4")]);
    }

    #[test]
    fn test_interface_names_deduplicated() {
        let file = TopologyFile::from_json(
            r#"{ "interfaces": {
                "eth0": { "redirect_map": { "10": "eth2" } },
                "eth1": { "redirect_map": { "10": "eth2", "20": "eth0" } } } }"#,
        )
        .unwrap();
        let desc = file.validate().unwrap();
        assert_eq!(desc.interface_names(), vec!["eth0", "eth1", "eth2"]);
    }

    #[test]
    fn test_input_without_redirects() {
        let file = TopologyFile::from_json(r#"{ "interfaces": { "eth0": {} } }"#).unwrap();
        let desc = file.validate().unwrap();
        assert!(desc.inputs[0].redirects.is_empty());
    }

    #[test]
    fn test_rejects_bad_labels() {
        for label in ["0", "4095", "4096", "-1", "ten", "ANY"] {
            let text = format!(
                r#"{{ "interfaces": {{ "eth0": {{ "redirect_map": {{ "{}": "eth2" }} }} }} }}"#,
                label
            );
            let err = TopologyFile::from_json(&text).unwrap().validate().unwrap_err();
            assert!(err.is_config_error(), "label {} accepted", label);
        }
    }

    #[test]
    fn test_duplicate_after_normalisation() {
        let text = r#"{ "interfaces": { "eth0": { "redirect_map": { "10": "eth2", "010": "eth3" } } } }"#;
        let err = TopologyFile::from_json(text).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("duplicate VLAN 10"));
    }

    #[test]
    fn test_rejects_bad_names() {
        let empty_output = r#"{ "interfaces": { "eth0": { "redirect_map": { "10": "" } } } }"#;
        assert!(TopologyFile::from_json(empty_output).unwrap().validate().is_err());

        let empty_input = r#"{ "interfaces": { "": { "redirect_map": { "10": "eth2" } } } }"#;
        assert!(TopologyFile::from_json(empty_input).unwrap().validate().is_err());

        let long = r#"{ "interfaces": { "averyveryverylongname": {} } }"#;
        assert!(TopologyFile::from_json(long).unwrap().validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(TopologyFile::from_json("{").unwrap_err().is_config_error());
        assert!(TopologyFile::from_json(r#"{ "inputs": {} }"#).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "interfaces": {{ "eth1": {{ "redirect_map": {{ "any": "eth9" }} }} }} }}"#)
            .unwrap();
        let desc = TopologyFile::load(file.path()).unwrap().validate().unwrap();
        assert_eq!(
            desc.inputs[0].redirects,
            vec![Redirect {
                vlan: VlanId::GLOBAL_OVERRIDE,
                output: "eth9".to_string()
            }]
        );
        assert_eq!(desc.inputs[0].redirects[0].vlan, vlan(4095));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            TopologyFile::load("/nonexistent/vlanredir.json"),
            Err(VlanRedirError::Io(_))
        ));
    }

    #[test]
    fn test_settings_validation() {
        assert!(Settings::default().validate().is_ok());
        let settings = Settings {
            history_depth: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        let settings = Settings {
            chart_range_bits: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let inputs = TopologyFile::from_json(
            r#"{ "interfaces": {
                "eth0": { "redirect_map": { "10": "eth2" } },
                "eth0": { "redirect_map": { "20": "eth3" } } } }"#,
        );
        assert!(matches!(inputs, Err(VlanRedirError::ConfigInvalid { .. })));

        let labels = TopologyFile::from_json(
            r#"{ "interfaces": { "eth0": { "redirect_map": { "10": "eth2", "10": "eth3" } } } }"#,
        );
        let err = labels.unwrap_err().to_string();
        assert!(err.contains("duplicate key '10'"), "{}", err);
    }

    #[test]
    fn test_inputs_ordered_by_name() {
        let desc = TopologyFile::from_json(
            r#"{ "interfaces": {
                "eth1": { "redirect_map": { "10": "eth2" } },
                "eth0": { "redirect_map": { "10": "eth2" } } } }"#,
        )
        .unwrap()
        .validate()
        .unwrap();
        let names: Vec<_> = desc.inputs.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["eth0", "eth1"]);
    }

    #[test]
    fn test_history_depth_is_bounded() {
        let at_cap = Settings {
            history_depth: MAX_HISTORY_DEPTH,
            ..Default::default()
        };
        assert!(at_cap.validate().is_ok());

        for history_depth in [MAX_HISTORY_DEPTH + 1, usize::MAX] {
            let settings = Settings {
                history_depth,
                ..Default::default()
            };
            assert!(matches!(
                settings.validate(),
                Err(VlanRedirError::ConfigInvalid { .. })
            ));
        }
    }
}
