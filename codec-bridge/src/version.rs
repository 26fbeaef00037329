//! Version information for codec-bridge.

/// codec-bridge version from Cargo.toml
pub const CODEC_BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Revision of the bridge-worker message protocol, sent in `init`.
///
/// Workers refuse to load when this does not match their own.
pub const PROTOCOL_VERSION: u32 = 1;
