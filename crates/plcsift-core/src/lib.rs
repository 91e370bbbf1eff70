pub mod models;
pub mod config;
pub mod error;
pub mod ingest;
pub mod demux;
pub mod reassembly;
pub mod protocols;
pub mod timeline;
pub mod midstream;
pub mod engine;

pub use config::EngineConfig;
pub use engine::{Analysis, Analyzer};
pub use error::{EngineError, Result};
pub use models::{CapturedSegment, FlowKey, Protocol, ProtocolMessage, Transport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
