//! Port forwarding wire types for the guest agent.
//!
//! This library defines the messages the agent exchanges with the host
//! tunnel peer:
//! - Published port maps in the container engine's shape
//! - Guest interface addresses the host should dial back to
//! - The add/remove envelope sent over the tunnel
//!
//! Field casing on the wire follows the container engine's JSON API, which
//! the host peer already parses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single published port binding.
///
/// Both fields are strings on the wire (the engine reports them that way,
/// and `host_port` can be empty for unbound ports).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    /// Host address the port is bound to (e.g. "0.0.0.0").
    pub host_ip: String,

    /// Host port number as a decimal string.
    pub host_port: String,
}

/// Published ports keyed by port spec (e.g. "80/tcp").
///
/// A BTreeMap keeps wire output stable across runs.
pub type PortMap = BTreeMap<String, Vec<PortBinding>>;

/// An address bound to the guest's forwarding interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectAddr {
    /// Address family tag: "ip+net" for CIDR-form addresses, "ip" for
    /// bare ones.
    pub network: String,

    /// The address itself, CIDR-form when the prefix is known.
    pub addr: String,
}

/// One forwarding update sent to the host peer.
///
/// The same shape announces and retracts a set of ports; `remove`
/// distinguishes the two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortMapping {
    /// True when the ports should stop being forwarded.
    pub remove: bool,

    /// The ports this update covers.
    pub ports: PortMap,

    /// Guest addresses the host can dial to reach the ports.
    pub connect_addrs: Vec<ConnectAddr>,
}

impl PortMapping {
    /// Build an announcement for a set of ports.
    pub fn publish(ports: PortMap, connect_addrs: Vec<ConnectAddr>) -> Self {
        Self {
            remove: false,
            ports,
            connect_addrs,
        }
    }

    /// Build a retraction for a previously announced set of ports.
    pub fn retract(ports: PortMap, connect_addrs: Vec<ConnectAddr>) -> Self {
        Self {
            remove: true,
            ports,
            connect_addrs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ports() -> PortMap {
        let mut ports = PortMap::new();
        ports.insert(
            "80/tcp".to_string(),
            vec![PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: "8080".to_string(),
            }],
        );
        ports
    }

    #[test]
    fn test_port_mapping_wire_names() {
        let mapping = PortMapping::publish(
            sample_ports(),
            vec![ConnectAddr {
                network: "ip+net".to_string(),
                addr: "192.168.127.2/24".to_string(),
            }],
        );

        let value = serde_json::to_value(&mapping).unwrap();
        assert_eq!(value["Remove"], false);
        assert_eq!(value["Ports"]["80/tcp"][0]["HostIp"], "0.0.0.0");
        assert_eq!(value["Ports"]["80/tcp"][0]["HostPort"], "8080");
        assert_eq!(value["ConnectAddrs"][0]["Network"], "ip+net");
        assert_eq!(value["ConnectAddrs"][0]["Addr"], "192.168.127.2/24");
    }

    #[test]
    fn test_port_mapping_round_trip() {
        let mapping = PortMapping::retract(sample_ports(), Vec::new());
        let json = serde_json::to_string(&mapping).unwrap();
        let back: PortMapping = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mapping);
    }

    #[test]
    fn test_engine_shaped_payload_deserializes() {
        let json = r#"{
            "Remove": false,
            "Ports": {
                "443/tcp": [
                    {"HostIp": "0.0.0.0", "HostPort": "443"},
                    {"HostIp": "::", "HostPort": "443"}
                ]
            },
            "ConnectAddrs": [
                {"Network": "ip+net", "Addr": "172.16.0.5/16"}
            ]
        }"#;

        let mapping: PortMapping = serde_json::from_str(json).unwrap();
        assert!(!mapping.remove);
        assert_eq!(mapping.ports["443/tcp"].len(), 2);
        assert_eq!(mapping.ports["443/tcp"][1].host_ip, "::");
        assert_eq!(mapping.connect_addrs.len(), 1);
    }
}
