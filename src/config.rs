// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Daemon configuration
//!
//! The daemon reads a TOML file describing the IPCPs to bring up on this
//! node, plus an optional text file of persisted `(ipcp-name, dif)`
//! registration tuples restored across restarts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// One IPCP to create at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcpDecl {
    /// Application process name, e.g. "a.IPCP/1".
    pub name: String,
    /// Engine type: "normal", "shim-loopback" or "shim-udp4".
    #[serde(rename = "type")]
    pub ipcp_type: String,
    /// DIF the IPCP belongs to.
    pub dif: String,
    /// Configuration parameters applied after creation, in key order.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Lower DIFs a normal IPCP registers its name in.
    #[serde(default)]
    pub lower_difs: Vec<String>,
    /// Neighbor to enroll with at startup, if any.
    #[serde(default)]
    pub enroll_neighbor: Option<String>,
    /// Supporting DIF for the startup enrollment.
    #[serde(default)]
    pub enroll_supp_dif: Option<String>,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Text file of persisted registrations.
    #[serde(default)]
    pub registrations_file: Option<PathBuf>,
    #[serde(default, rename = "ipcp")]
    pub ipcps: Vec<IpcpDecl>,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&contents)
            .map_err(|e| Error::InvalidArgument(format!("bad configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for decl in &self.ipcps {
            if decl.name.is_empty() {
                return Err(Error::InvalidArgument("ipcp with empty name".to_string()));
            }
            match decl.ipcp_type.as_str() {
                "normal" | "shim-loopback" | "shim-udp4" => {}
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "ipcp '{}' has unknown type '{}'",
                        decl.name, other
                    )));
                }
            }
            if decl.enroll_neighbor.is_some() != decl.enroll_supp_dif.is_some() {
                return Err(Error::InvalidArgument(format!(
                    "ipcp '{}': enroll_neighbor and enroll_supp_dif go together",
                    decl.name
                )));
            }
        }
        Ok(())
    }
}

/// A persisted application registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub appl_name: String,
    pub dif: String,
}

/// Loads `(appl-name, dif)` tuples, one per whitespace-separated line.
/// A missing file is an empty set.
pub fn load_registrations(path: &Path) -> Result<Vec<Registration>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut regs = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut it = line.split_whitespace();
        match (it.next(), it.next(), it.next()) {
            (Some(appl), Some(dif), None) => regs.push(Registration {
                appl_name: appl.to_string(),
                dif: dif.to_string(),
            }),
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "{}:{}: expected '<appl-name> <dif>'",
                    path.display(),
                    lineno + 1
                )));
            }
        }
    }
    Ok(regs)
}

/// Rewrites the registration file.
pub fn save_registrations(path: &Path, regs: &[Registration]) -> Result<()> {
    let mut out = String::new();
    for reg in regs {
        out.push_str(&reg.appl_name);
        out.push(' ');
        out.push_str(&reg.dif);
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
            registrations_file = "/tmp/regs.txt"

            [[ipcp]]
            name = "lo.IPCP/1"
            type = "shim-loopback"
            dif = "lo.DIF"

            [[ipcp]]
            name = "n.IPCP/1"
            type = "normal"
            dif = "n.DIF"
            lower_difs = ["lo.DIF"]
            [ipcp.params]
            address = "1"
        "#;
        let config: DaemonConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.ipcps.len(), 2);
        assert_eq!(config.ipcps[1].params.get("address").unwrap(), "1");
        assert_eq!(config.ipcps[1].lower_difs, vec!["lo.DIF"]);
    }

    #[test]
    fn test_bad_type_rejected() {
        let toml = r#"
            [[ipcp]]
            name = "x"
            type = "shim-morse"
            dif = "d"
        "#;
        let config: DaemonConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_registrations_round_trip() {
        let dir = std::env::temp_dir().join("rinode-config-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("regs.txt");

        let regs = vec![
            Registration {
                appl_name: "server/1".to_string(),
                dif: "n.DIF".to_string(),
            },
            Registration {
                appl_name: "printer".to_string(),
                dif: "n.DIF".to_string(),
            },
        ];
        save_registrations(&path, &regs).unwrap();
        assert_eq!(load_registrations(&path).unwrap(), regs);
        fs::remove_file(&path).unwrap();

        // A missing file reads back empty.
        assert!(load_registrations(&path).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_registration_line() {
        let dir = std::env::temp_dir().join("rinode-config-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("regs-bad.txt");
        fs::write(&path, "only-one-field\n").unwrap();
        assert!(load_registrations(&path).is_err());
        fs::remove_file(&path).unwrap();
    }
}
