//! Common error types for the Keel networking stack.
//!
//! Every public lifecycle operation returns a [`KeelError`]. Callers that only
//! need to branch on the broad category use [`KeelError::kind`]; callers that
//! need to know whether a retry is safe use [`KeelError::disposition`].

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KeelError`].
pub type KeelResult<T> = Result<T, KeelError>;

/// Errors across the Keel networking stack.
#[derive(Error, Diagnostic, Debug)]
pub enum KeelError {
    /// Malformed request or configuration.
    #[error("Bad request: {message}")]
    #[diagnostic(code(keel::bad_request))]
    BadRequest {
        /// What was wrong with the request.
        message: String,
    },

    /// A single option key could not be decoded.
    #[error("Invalid value for option '{key}': {message}")]
    #[diagnostic(
        code(keel::options::invalid),
        help("Booleans and integers may be passed natively or as strings")
    )]
    InvalidOption {
        /// The offending option key.
        key: String,
        /// The decoder's complaint.
        message: String,
    },

    /// The operation would violate a policy invariant.
    #[error("Forbidden: {message}")]
    #[diagnostic(code(keel::forbidden))]
    Forbidden {
        /// Which invariant was violated.
        message: String,
    },

    /// A referenced object does not exist.
    #[error("Not found: {message}")]
    #[diagnostic(code(keel::not_found))]
    NotFound {
        /// What was missing.
        message: String,
    },

    /// A referenced object does not exist, and callers iterating over many
    /// objects may ignore it.
    #[error("{message}")]
    #[diagnostic(code(keel::maskable))]
    InternalMaskable {
        /// What was missing.
        message: String,
    },

    /// Endpoint id already registered on the network.
    #[error("Endpoint already exists: {id}")]
    #[diagnostic(code(keel::endpoint::exists))]
    EndpointExists {
        /// The endpoint id.
        id: String,
    },

    /// Endpoint id unknown on the network.
    #[error("Endpoint not found: {id}")]
    #[diagnostic(code(keel::endpoint::not_found))]
    EndpointNotFound {
        /// The endpoint id.
        id: String,
    },

    /// The network still has endpoints attached.
    #[error("Network {network} has active endpoints")]
    #[diagnostic(
        code(keel::network::active_endpoints),
        help("Delete every endpoint on the network first")
    )]
    ActiveEndpoints {
        /// The network id.
        network: String,
    },

    /// Driver configuration was already applied.
    #[error("Configuration already exists, bridge configuration can be applied only once")]
    #[diagnostic(code(keel::config::exists))]
    ConfigExists,

    /// Driver configuration could not be decoded.
    #[error("Invalid driver configuration: {message}")]
    #[diagnostic(code(keel::config::driver))]
    InvalidDriverConfig {
        /// The decoder's complaint.
        message: String,
    },

    /// Endpoint configuration could not be decoded.
    #[error("Invalid endpoint configuration: {message}")]
    #[diagnostic(code(keel::config::endpoint))]
    InvalidEndpointConfig {
        /// The decoder's complaint.
        message: String,
    },

    /// Negative MTU.
    #[error("Invalid MTU number: {mtu}")]
    #[diagnostic(code(keel::config::mtu))]
    InvalidMtu {
        /// The rejected value.
        mtu: i32,
    },

    /// Default gateway outside the subnet it must belong to.
    #[error("Default gateway {gateway} is not within {subnet}")]
    #[diagnostic(code(keel::config::gateway))]
    InvalidGateway {
        /// The requested gateway.
        gateway: String,
        /// The subnet it should belong to.
        subnet: String,
    },

    /// Container subnet not contained in the bridge network.
    #[error("Container subnet {subnet} must be a subset of bridge network {network}")]
    #[diagnostic(code(keel::config::container_subnet))]
    InvalidContainerSubnet {
        /// The requested container subnet.
        subnet: String,
        /// The bridge network.
        network: String,
    },

    /// Refusing to create a bridge with a non-default name.
    #[error("Bridge device with non default name {name} must be created manually")]
    #[diagnostic(
        code(keel::bridge::non_default),
        help("Create the device beforehand or set AllowNonDefaultBridge")
    )]
    NonDefaultBridge {
        /// The requested bridge name.
        name: String,
    },

    /// Invalid network identifier.
    #[error("Invalid network id: '{id}'")]
    #[diagnostic(
        code(keel::network::invalid_id),
        help("Network IDs must be 1-64 characters of alphanumerics, '-', '_' or '.'")
    )]
    InvalidNetworkId {
        /// The rejected id.
        id: String,
    },

    /// Invalid endpoint identifier.
    #[error("Invalid endpoint id: '{id}'")]
    #[diagnostic(
        code(keel::endpoint::invalid_id),
        help("Endpoint IDs must be 1-64 characters of alphanumerics, '-', '_' or '.'")
    )]
    InvalidEndpointId {
        /// The rejected id.
        id: String,
    },

    /// A specific address cannot be handed out.
    #[error("Address {address} is not available in {network}: {reason}")]
    #[diagnostic(code(keel::ipam::unavailable))]
    AddressUnavailable {
        /// The requested address.
        address: String,
        /// The network the request was scoped to.
        network: String,
        /// Why it is unavailable.
        reason: String,
    },

    /// No free address left.
    #[error("No available addresses in {network}")]
    #[diagnostic(code(keel::ipam::exhausted))]
    AddressSpaceExhausted {
        /// The exhausted network.
        network: String,
    },

    /// Host port already bound.
    #[error("Bind for {host_ip}:{port}/{proto} failed: port is already allocated")]
    #[diagnostic(code(keel::ports::allocated))]
    PortAlreadyAllocated {
        /// Protocol name.
        proto: String,
        /// Host address.
        host_ip: String,
        /// Host port.
        port: u16,
    },

    /// Dynamic port range exhausted.
    #[error("All ports are allocated for {proto} on {host_ip}")]
    #[diagnostic(code(keel::ports::exhausted))]
    NoAvailablePorts {
        /// Protocol name.
        proto: String,
        /// Host address.
        host_ip: String,
    },

    /// Unmapping a port that was never mapped.
    #[error("Port {host_ip}:{port}/{proto} is not mapped")]
    #[diagnostic(code(keel::ports::not_mapped))]
    PortNotMapped {
        /// Protocol name.
        proto: String,
        /// Host address.
        host_ip: String,
        /// Host port.
        port: u16,
    },

    /// Network interface missing on the host.
    #[error("Link not found: {name}")]
    #[diagnostic(code(keel::link::not_found))]
    LinkNotFound {
        /// Interface name.
        name: String,
    },

    /// Network interface already present on the host.
    #[error("Link already exists: {name}")]
    #[diagnostic(code(keel::link::exists))]
    LinkExists {
        /// Interface name.
        name: String,
    },

    /// Bridge device addresses differ from the configuration.
    #[error("Bridge {bridge} address mismatch: expected {expected}, found {found}")]
    #[diagnostic(code(keel::bridge::address_mismatch))]
    BridgeAddressMismatch {
        /// Bridge name.
        bridge: String,
        /// Address the configuration asked for.
        expected: String,
        /// What the device carries.
        found: String,
    },

    /// External command failed.
    #[error("Command '{command}' failed: {message}")]
    #[diagnostic(code(keel::command))]
    CommandFailed {
        /// The command line.
        command: String,
        /// Captured stderr or status.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(keel::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(keel::serialization))]
    Serialization(String),

    /// A multi-step operation failed and its partial effects were undone.
    #[error("{operation} failed and was rolled back: {source}")]
    #[diagnostic(code(keel::rolled_back))]
    RolledBack {
        /// The lifecycle operation.
        operation: String,
        /// The failure that triggered the rollback.
        #[source]
        source: Box<KeelError>,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(keel::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

/// Broad error category, independent of the concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input or configuration.
    BadRequest,
    /// Policy violation.
    Forbidden,
    /// Referenced object absent.
    NotFound,
    /// Referenced object absent, safe to skip when iterating.
    Maskable,
    /// Object already present.
    Exists,
    /// Delete blocked by live endpoints.
    ActiveEndpoints,
    /// Scarce resource (address, port) unavailable.
    Unavailable,
    /// Host or internal failure.
    System,
}

/// What a failed operation left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing was changed; the call may be retried as is.
    Unchanged,
    /// Host or registry state was partially changed and then undone.
    RolledBack,
}

impl KeelError {
    /// Shorthand for [`KeelError::BadRequest`].
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Shorthand for [`KeelError::Forbidden`].
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Shorthand for [`KeelError::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Shorthand for [`KeelError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap `source` to record that `operation` undid its partial effects.
    ///
    /// Wrapping an already rolled back error keeps the innermost operation.
    pub fn rolled_back(operation: impl Into<String>, source: Self) -> Self {
        match source {
            rolled @ Self::RolledBack { .. } => rolled,
            source => Self::RolledBack {
                operation: operation.into(),
                source: Box::new(source),
            },
        }
    }

    /// The broad category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest { .. }
            | Self::InvalidOption { .. }
            | Self::InvalidDriverConfig { .. }
            | Self::InvalidEndpointConfig { .. }
            | Self::InvalidMtu { .. }
            | Self::InvalidGateway { .. }
            | Self::InvalidContainerSubnet { .. }
            | Self::InvalidNetworkId { .. }
            | Self::InvalidEndpointId { .. }
            | Self::Serialization(_) => ErrorKind::BadRequest,
            Self::Forbidden { .. } | Self::NonDefaultBridge { .. } => ErrorKind::Forbidden,
            Self::NotFound { .. } | Self::EndpointNotFound { .. } | Self::PortNotMapped { .. } => {
                ErrorKind::NotFound
            }
            Self::InternalMaskable { .. } => ErrorKind::Maskable,
            Self::EndpointExists { .. } | Self::ConfigExists | Self::LinkExists { .. } => {
                ErrorKind::Exists
            }
            Self::ActiveEndpoints { .. } => ErrorKind::ActiveEndpoints,
            Self::AddressUnavailable { .. }
            | Self::AddressSpaceExhausted { .. }
            | Self::PortAlreadyAllocated { .. }
            | Self::NoAvailablePorts { .. } => ErrorKind::Unavailable,
            Self::LinkNotFound { .. }
            | Self::BridgeAddressMismatch { .. }
            | Self::CommandFailed { .. }
            | Self::Io(_)
            | Self::Internal { .. } => ErrorKind::System,
            Self::RolledBack { source, .. } => source.kind(),
        }
    }

    /// Whether the failed call left partial, undone changes behind.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::RolledBack { .. } => Disposition::RolledBack,
            _ => Disposition::Unchanged,
        }
    }

    /// The error that caused a rollback, or `self` otherwise.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::RolledBack { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for "no such interface" failures reported by the host.
    #[must_use]
    pub fn is_link_not_found(&self) -> bool {
        matches!(self.root(), Self::LinkNotFound { .. })
    }

    /// True for errors a caller iterating many networks may skip.
    #[must_use]
    pub fn is_maskable(&self) -> bool {
        self.kind() == ErrorKind::Maskable
    }
}

impl From<serde_json::Error> for KeelError {
    fn from(err: serde_json::Error) -> Self {
        KeelError::Serialization(err.to_string())
    }
}
