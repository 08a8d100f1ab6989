pub mod v1;

use anyhow::{bail, Result};

/// Core handshake protocol version. Must match exactly.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Wire protocol versions this build can speak, in preference order.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[u32] = &[1];

/// Handshake parsed from the provider's first stdout line.
///
/// The format is pipe-delimited: `CORE-VERSION|PROTO-VERSION|TRANSPORT`,
/// e.g. `1|1|stdio`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub core_protocol_version: u32,
    pub protocol_version: u32,
    pub transport: String,
}

/// The handshake line a provider must print first.
pub fn handshake_line() -> String {
    format!("{}|{}|stdio", CORE_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS[0])
}

pub fn parse_handshake(line: &str) -> Result<HandshakeInfo> {
    let parts: Vec<&str> = line.trim().split('|').collect();
    if parts.len() != 3 {
        bail!(
            "invalid handshake: expected 3 pipe-delimited fields, got {}",
            parts.len()
        );
    }
    Ok(HandshakeInfo {
        core_protocol_version: parts[0]
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid core protocol version {:?}", parts[0]))?,
        protocol_version: parts[1]
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid protocol version {:?}", parts[1]))?,
        transport: parts[2].to_string(),
    })
}

pub fn validate_handshake(handshake: &HandshakeInfo) -> Result<()> {
    if handshake.core_protocol_version != CORE_PROTOCOL_VERSION {
        bail!(
            "unsupported core protocol version {} (want {})",
            handshake.core_protocol_version,
            CORE_PROTOCOL_VERSION
        );
    }
    if !SUPPORTED_PROTOCOL_VERSIONS.contains(&handshake.protocol_version) {
        bail!(
            "provider speaks protocol version {}, this engine supports {:?}",
            handshake.protocol_version,
            SUPPORTED_PROTOCOL_VERSIONS
        );
    }
    if handshake.transport != "stdio" {
        bail!("unsupported transport {:?}", handshake.transport);
    }
    Ok(())
}
