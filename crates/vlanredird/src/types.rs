//! Value types shared across the control plane.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use vlanredir_common::{GLOBAL_OVERRIDE_KEY, UNTAGGED_KEY};

use crate::error::{Result, VlanRedirError};

/// VLAN key of the redirect and counter maps (0-4095).
///
/// Besides the IEEE 802.1Q range 1-4094, two keys are reserved:
/// [`VlanId::UNTAGGED`] (0) for frames without a tag and
/// [`VlanId::GLOBAL_OVERRIDE`] (4095) for the entry that captures every frame.
///
/// # Examples
///
/// ```
/// use vlanredird::VlanId;
///
/// assert_eq!(VlanId::from_label("none").unwrap(), VlanId::UNTAGGED);
/// assert_eq!(VlanId::from_label("any").unwrap(), VlanId::GLOBAL_OVERRIDE);
/// assert_eq!(VlanId::from_label("10").unwrap().as_u16(), 10);
/// assert!(VlanId::from_label("0").is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanId(u16);

impl VlanId {
    /// Minimum tagged VLAN ID.
    pub const MIN_TAGGED: u16 = 1;

    /// Maximum tagged VLAN ID.
    pub const MAX_TAGGED: u16 = 4094;

    /// Key of untagged frames.
    pub const UNTAGGED: VlanId = VlanId(UNTAGGED_KEY as u16);

    /// Key of the global override entry.
    pub const GLOBAL_OVERRIDE: VlanId = VlanId(GLOBAL_OVERRIDE_KEY as u16);

    /// Label of [`VlanId::UNTAGGED`] in the topology file.
    pub const UNTAGGED_LABEL: &'static str = "none";

    /// Label of [`VlanId::GLOBAL_OVERRIDE`] in the topology file.
    pub const GLOBAL_OVERRIDE_LABEL: &'static str = "any";

    /// Creates a map key, accepting the reserved keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is above 4095.
    pub fn new(id: u16) -> Result<Self> {
        if id <= GLOBAL_OVERRIDE_KEY as u16 {
            Ok(VlanId(id))
        } else {
            Err(VlanRedirError::config_invalid(
                "vlan",
                format!("VLAN key {} out of range 0-4095", id),
            ))
        }
    }

    /// Parses a topology file label: `none`, `any` or a decimal tagged id.
    ///
    /// Decimal labels must be in 1-4094; `0` and `4095` are only reachable
    /// through their names.
    pub fn from_label(label: &str) -> Result<Self> {
        match label {
            Self::UNTAGGED_LABEL => Ok(Self::UNTAGGED),
            Self::GLOBAL_OVERRIDE_LABEL => Ok(Self::GLOBAL_OVERRIDE),
            _ => {
                let id: u16 = label.parse().map_err(|_| {
                    VlanRedirError::config_invalid(
                        "redirect_map",
                        format!("unknown VLAN label '{}'", label),
                    )
                })?;
                if (Self::MIN_TAGGED..=Self::MAX_TAGGED).contains(&id) {
                    Ok(VlanId(id))
                } else {
                    Err(VlanRedirError::config_invalid(
                        "redirect_map",
                        format!(
                            "VLAN {} out of range {}-{}",
                            id,
                            Self::MIN_TAGGED,
                            Self::MAX_TAGGED
                        ),
                    ))
                }
            }
        }
    }

    /// Returns the VLAN ID as a u16.
    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns the key as used by the kernel maps.
    pub const fn map_key(&self) -> u32 {
        self.0 as u32
    }

    pub const fn is_untagged(&self) -> bool {
        self.0 as u32 == UNTAGGED_KEY
    }

    pub const fn is_global_override(&self) -> bool {
        self.0 as u32 == GLOBAL_OVERRIDE_KEY
    }

    /// Label as written in the topology file.
    pub fn label(&self) -> String {
        if self.is_untagged() {
            Self::UNTAGGED_LABEL.to_string()
        } else if self.is_global_override() {
            Self::GLOBAL_OVERRIDE_LABEL.to_string()
        } else {
            self.0.to_string()
        }
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for VlanId {
    type Err = VlanRedirError;

    fn from_str(s: &str) -> Result<Self> {
        VlanId::from_label(s)
    }
}

impl TryFrom<u16> for VlanId {
    type Error = VlanRedirError;

    fn try_from(id: u16) -> Result<Self> {
        VlanId::new(id)
    }
}

impl TryFrom<u32> for VlanId {
    type Error = VlanRedirError;

    fn try_from(key: u32) -> Result<Self> {
        u16::try_from(key)
            .map_err(|_| {
                VlanRedirError::config_invalid("vlan", format!("VLAN key {} out of range", key))
            })
            .and_then(VlanId::new)
    }
}

impl From<VlanId> for u16 {
    fn from(vlan: VlanId) -> u16 {
        vlan.0
    }
}

/// XDP attach mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XdpMode {
    /// Generic XDP in the network stack. Works on every driver.
    #[default]
    Skb,
    /// Native driver mode.
    Driver,
    /// Offloaded to the NIC.
    Hw,
}

impl XdpMode {
    /// Short name shown next to an attached input.
    pub const fn short_name(&self) -> &'static str {
        match self {
            XdpMode::Skb => "SKB",
            XdpMode::Driver => "DRV",
            XdpMode::Hw => "HW",
        }
    }
}

impl fmt::Display for XdpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Which counter family the display charts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Bytes,
    Packets,
    Dropped,
}

impl DisplayMode {
    pub const ALL: [DisplayMode; 3] = [DisplayMode::Bytes, DisplayMode::Packets, DisplayMode::Dropped];

    /// Position in per-mode arrays.
    pub const fn index(&self) -> usize {
        match self {
            DisplayMode::Bytes => 0,
            DisplayMode::Packets => 1,
            DisplayMode::Dropped => 2,
        }
    }
}
