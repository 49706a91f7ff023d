//! Protocol descriptors and lookup.
//!
//! Each supported wire protocol is a single `ProtocolDescriptor` value built
//! once and shared for the life of the process.

pub mod cctalk;
pub mod ccnet;
pub mod id003;
pub mod shtrih;
pub mod ssp;

use super::protocol::ProtocolDescriptor;
use crate::error::ConfigError;
use std::sync::OnceLock;

static REGISTRY: OnceLock<Vec<ProtocolDescriptor>> = OnceLock::new();

fn registry() -> &'static [ProtocolDescriptor] {
    REGISTRY.get_or_init(|| {
        vec![
            ccnet::descriptor(),
            id003::descriptor(),
            ssp::descriptor(),
            cctalk::descriptor(),
            shtrih::descriptor(),
        ]
    })
}

/// Map vendor and family names onto the protocol they speak.
fn canonical(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    match name.as_str() {
        "cashcode" | "cash_code" => "ccnet".into(),
        "jcm" => "id003".into(),
        "itl" | "nv" | "innovative" => "ssp".into(),
        "cc_talk" => "cctalk".into(),
        "shtrih-m" | "shtrih_m" | "shtrihm" => "shtrih".into(),
        _ => name,
    }
}

/// Look up a descriptor by protocol name or alias.
pub fn find(name: &str) -> Result<&'static ProtocolDescriptor, ConfigError> {
    let wanted = canonical(name);
    registry()
        .iter()
        .find(|d| d.name == wanted)
        .ok_or_else(|| ConfigError::UnknownProtocol(name.to_string()))
}

/// Canonical names of every supported protocol.
pub fn names() -> Vec<&'static str> {
    registry().iter().map(|d| d.name).collect()
}
