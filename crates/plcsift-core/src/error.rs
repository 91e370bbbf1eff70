use thiserror::Error;

use crate::models::{FlowKey, Transport};

/// Errors caused by how the engine is called, never by what the traffic contains.
/// Malformed protocol bytes are resynchronized or degraded, not reported here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no reassembly state for flow {0}")]
    UnknownFlow(FlowKey),

    #[error("{got:?} segment handed to a {expected:?} reassembler")]
    TransportMismatch { expected: Transport, got: Transport },

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
