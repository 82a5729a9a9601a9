//! CLI command implementations.

pub mod common;
pub mod metrics;
pub mod p2p;
pub mod rollback;
pub mod status;
pub mod update;
