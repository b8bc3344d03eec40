// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

//! Serialized forms of port reservations.
//!
//! Port maps and port blocks are stored as JSON strings by the storage layer. They may have been
//! written by older versions or by hand, so parsing never fails: anything that can't be understood
//! is treated as "no ports claimed".

use serde_json::Value;
use std::collections::BTreeMap;

/// Maps container ports to host ports
pub type PortMap = BTreeMap<u16, u16>;

/// Parses a serialized port map such as `{"80": 30001, "22/tcp": "30002"}`.
pub fn parse_port_map(raw: &str) -> PortMap {
    let raw = raw.trim();
    if raw.is_empty() {
        return PortMap::new();
    }
    let Ok(Value::Object(entries)) = serde_json::from_str::<Value>(raw) else {
        return PortMap::new();
    };

    entries
        .iter()
        .filter_map(|(container_port, host_port)| {
            let container_port = parse_port_key(container_port)?;
            let host_port = parse_port_value(host_port)?;
            Some((container_port, host_port))
        })
        .collect()
}

pub fn encode_port_map(map: &PortMap) -> String {
    let entries: serde_json::Map<String, Value> = map
        .iter()
        .map(|(container_port, host_port)| (container_port.to_string(), Value::from(*host_port)))
        .collect();
    Value::Object(entries).to_string()
}

/// Parses a serialized port block such as `[30000, 30001]`. A comma separated list is accepted
/// as well.
pub fn parse_port_block(raw: &str) -> Vec<u16> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(values)) => values.iter().filter_map(parse_port_value).collect(),
        Ok(_) => Vec::new(),
        Err(_) => raw
            .split(',')
            .filter_map(|part| part.trim().parse::<u16>().ok())
            .filter(|port| *port != 0)
            .collect(),
    }
}

pub fn encode_port_block(ports: &[u16]) -> String {
    Value::from(ports.to_vec()).to_string()
}

fn parse_port_key(key: &str) -> Option<u16> {
    // Docker style keys carry the protocol, e.g. "80/tcp"
    let port = key.split('/').next()?.trim();
    port.parse::<u16>().ok().filter(|port| *port != 0)
}

fn parse_port_value(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(number) => u16::try_from(number.as_u64()?).ok()?,
        Value::String(string) => string.trim().parse::<u16>().ok()?,
        _ => return None,
    };
    (port != 0).then_some(port)
}
