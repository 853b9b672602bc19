//! loom-core — wire frames, line codec, job model, and configuration.
//! Every other Loom crate depends on this one.

pub mod codec;
pub mod config;
pub mod error;
pub mod job;
pub mod rolling;
pub mod wire;

pub use codec::{decode_line, encode, LineCodec};
pub use error::ProtocolError;
pub use job::{
    IterationRecord, JobId, JobRecord, JobSpec, JobStatus, PhaseName, PhaseRecord, PhaseStatus,
    RuntimeSpec, TransformSpec,
};
pub use rolling::RollingAverage;
pub use wire::{Message, Request};
