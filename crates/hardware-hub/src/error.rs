use crate::events::FailureHint;
use crate::types::AggregatorState;
use device_registry::{DeviceKind, RegistryError};
use servo_transport::TransportError;
use thiserror::Error;

pub type Result<T, E = HubError> = core::result::Result<T, E>;

/// Failure of a single device during one operation. Never fatal for its bus.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{name}: {source}")]
    Transport {
        name: String,
        #[source]
        source: TransportError,
    },
    #[error("{name}: no reply")]
    NoReply { name: String },
    #[error("{name}: malformed reply ({reason})")]
    Malformed { name: String, reason: &'static str },
}

impl DeviceError {
    pub(crate) fn transport(name: &str, source: TransportError) -> Self {
        if source.is_timeout() {
            DeviceError::NoReply {
                name: name.to_string(),
            }
        } else {
            DeviceError::Transport {
                name: name.to_string(),
                source,
            }
        }
    }

    pub(crate) fn no_reply(name: &str) -> Self {
        DeviceError::NoReply {
            name: name.to_string(),
        }
    }

    pub(crate) fn malformed(name: &str, reason: &'static str) -> Self {
        DeviceError::Malformed {
            name: name.to_string(),
            reason,
        }
    }

    pub fn device(&self) -> &str {
        match self {
            DeviceError::Transport { name, .. }
            | DeviceError::NoReply { name }
            | DeviceError::Malformed { name, .. } => name,
        }
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("cannot open port {port}: {source}")]
    PortOpen {
        port: String,
        #[source]
        source: TransportError,
    },
    #[error("no open port for declared bus {0}")]
    MissingPort(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("discovery incomplete: {responded}/{declared} devices answered ({hint})")]
    DiscoveryIncomplete {
        responded: usize,
        declared: usize,
        hint: FailureHint,
        missing: Vec<String>,
    },
    #[error("discovery gave up after {attempts} attempts: {last}")]
    DiscoveryExhausted { attempts: u32, last: Box<HubError> },
    #[error("{op} is not allowed in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: AggregatorState,
    },
    #[error("init failed on bus {bus}: {reason}")]
    BusInit { bus: String, reason: String },
    #[error("unknown joints: {}", .0.join(", "))]
    UnknownJoints(Vec<String>),
    #[error("no bound {kind} device named {name}")]
    UnknownDevice { name: String, kind: DeviceKind },
    #[error("invalid command for {name}: {reason}")]
    InvalidCommand { name: String, reason: String },
    #[error("{misses} consecutive cycles missed the deadline")]
    DeadlineExceeded { misses: u32 },
    #[error("bus worker failed: {0}")]
    Worker(String),
}
