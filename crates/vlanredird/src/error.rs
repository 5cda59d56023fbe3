//! Error types for vlanredird.
//!
//! Every fallible operation of the control plane returns [`VlanRedirError`].
//! Nothing is retried: startup errors abort after cleanup and a sampling
//! error ends the process.

use std::io;
use thiserror::Error;

/// Result type alias for vlanredird operations.
pub type Result<T> = std::result::Result<T, VlanRedirError>;

/// Errors that can occur in the control plane.
#[derive(Debug, Error)]
pub enum VlanRedirError {
    /// Topology file or command line value rejected.
    #[error("Invalid configuration for {field}: {message}")]
    ConfigInvalid {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Interface name does not resolve to an ifindex.
    #[error("Interface '{name}' not found")]
    InterfaceNotFound {
        /// The interface name.
        name: String,
    },

    /// Kernel reported that the link is gone.
    #[error("Link {ifindex} not found")]
    LinkNotFound {
        /// The interface index.
        ifindex: u32,
    },

    /// Kernel or tool refused the operation (usually missing CAP_NET_ADMIN).
    #[error("Operation denied: {operation}: {message}")]
    OperationDenied {
        /// The operation that was refused.
        operation: String,
        /// Error message.
        message: String,
    },

    /// Loading or attaching the XDP program failed.
    #[error("Failed to attach redirect program to '{interface}': {message}")]
    AttachFailed {
        /// The input interface.
        interface: String,
        /// Error message.
        message: String,
    },

    /// Loaded topology has no input or no output.
    #[error("Topology incomplete: {inputs} input(s), {outputs} output(s)")]
    TopologyIncomplete {
        /// Number of inputs loaded.
        inputs: usize,
        /// Number of outputs loaded.
        outputs: usize,
    },

    /// A counter fetch failed during a sampling tick.
    #[error("Sampling failed for {entity}: {message}")]
    SamplingFailed {
        /// The entity being sampled.
        entity: String,
        /// Error message.
        message: String,
    },

    /// Writing or reading back a redirect map entry failed.
    #[error("Failed to program redirect for VLAN {vlan} on '{interface}': {message}")]
    MapProgramFailed {
        /// The input interface owning the map.
        interface: String,
        /// The VLAN key.
        vlan: u16,
        /// Error message.
        message: String,
    },

    /// Netlink socket operation failed.
    #[error("Netlink operation failed: {operation}: {message}")]
    Netlink {
        /// The operation that failed.
        operation: String,
        /// Error message.
        message: String,
    },

    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl VlanRedirError {
    /// Creates an invalid configuration error.
    pub fn config_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an interface not found error.
    pub fn interface_not_found(name: impl Into<String>) -> Self {
        Self::InterfaceNotFound { name: name.into() }
    }

    /// Creates a link not found error.
    pub fn link_not_found(ifindex: u32) -> Self {
        Self::LinkNotFound { ifindex }
    }

    /// Creates an operation denied error.
    pub fn operation_denied(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OperationDenied {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an attach failure.
    pub fn attach_failed(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AttachFailed {
            interface: interface.into(),
            message: message.into(),
        }
    }

    /// Creates a sampling failure.
    pub fn sampling_failed(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SamplingFailed {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Creates a map programming failure.
    pub fn map_program_failed(
        interface: impl Into<String>,
        vlan: u16,
        message: impl Into<String>,
    ) -> Self {
        Self::MapProgramFailed {
            interface: interface.into(),
            vlan,
            message: message.into(),
        }
    }

    /// Creates a netlink error.
    pub fn netlink(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Netlink {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error comes from the operator's configuration
    /// rather than from the kernel.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            VlanRedirError::ConfigInvalid { .. }
                | VlanRedirError::InterfaceNotFound { .. }
                | VlanRedirError::TopologyIncomplete { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VlanRedirError::interface_not_found("eth9");
        assert_eq!(err.to_string(), "Interface 'eth9' not found");

        let err = VlanRedirError::TopologyIncomplete {
            inputs: 1,
            outputs: 0,
        };
        assert_eq!(
            err.to_string(),
            "Topology incomplete: 1 input(s), 0 output(s)"
        );
    }

    #[test]
    fn test_map_program_failed() {
        let err = VlanRedirError::map_program_failed("eth0", 10, "map full");
        assert!(err.to_string().contains("VLAN 10"));
        assert!(err.to_string().contains("'eth0'"));
    }

    #[test]
    fn test_shell_command_failed() {
        let err = VlanRedirError::ShellCommandFailed {
            command: "/sbin/ethtool -K \"eth0\" rxvlan off".to_string(),
            exit_code: 76,
            output: "Operation not supported".to_string(),
        };
        assert!(err.to_string().contains("ethtool"));
        assert!(err.to_string().contains("exit code 76"));
    }

    #[test]
    fn test_is_config_error() {
        assert!(VlanRedirError::config_invalid("history", "must be positive").is_config_error());
        assert!(VlanRedirError::interface_not_found("eth9").is_config_error());
        assert!(!VlanRedirError::link_not_found(3).is_config_error());
        assert!(!VlanRedirError::sampling_failed("eth0", "ENODEV").is_config_error());
    }
}
