//! Top-level error type. Layer-specific errors (`CryptoError`, `WireError`,
//! `ConfigError`) are defined next to the code that produces them and
//! converted here via `#[from]` wherever a call crosses a layer boundary.

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
