//! The mesh engine's public, programmatic API: a single orchestrator
//! actor built on `summit-core` and `summit-services`.

pub mod engine;

pub use engine::{ChannelId, EngineError, MeshEngine, MeshEvent, MessageId};
