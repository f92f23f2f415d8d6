//! On-disk host directory layout (spec §6 "On-disk layout"), grounded on
//! `zerotier-system-service::datadir::DataDir` for the open/load/save shape
//! — a base directory holding `tinc.conf`, `hosts/<Name>` peer files, and
//! the two private identity keys, loaded lazily rather than watched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use mesh_core::config::{apply_conf, parse_conf_text, Config};
use mesh_crypto::{EcdsaIdentity, RsaIdentity};

use crate::error::{Error, Result};

const RSA_KEY_FILE: &str = "rsa_key.priv";
const ECDSA_KEY_FILE: &str = "ecdsa_key.priv";
const HOSTS_DIR: &str = "hosts";
const CONF_FILE: &str = "tinc.conf";

pub struct DataDir {
    pub base_path: PathBuf,
}

/// One parsed `hosts/<Name>` file: the generic key/value options plus the
/// two ways spec §6 allows a public key to be carried (inline PEM block, or
/// a path to one via `PublicKeyFile`/`ECDSAPublicKeyFile`).
pub struct HostFile {
    pub name: String,
    pub rsa_public_key_pem: Option<Vec<u8>>,
    pub ecdsa_public_key_pem: Option<Vec<u8>>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub subnets: Vec<String>,
    pub raw: HashMap<String, Vec<String>>,
}

impl DataDir {
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        std::fs::create_dir_all(base_path.join(HOSTS_DIR))?;
        Ok(Self { base_path })
    }

    pub fn load_conf(&self) -> Result<Config> {
        let mut config = Config::default();
        let path = self.base_path.join(CONF_FILE);
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let parsed = parse_conf_text(&text);
            apply_conf(&mut config, &parsed);
        }
        if config.name.is_empty() {
            return Err(Error::Config(format!("{} is missing a Name setting", path.display())));
        }
        Ok(config)
    }

    pub fn host_names(&self) -> Result<Vec<String>> {
        let dir = self.base_path.join(HOSTS_DIR);
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    if !name.ends_with("-up") && !name.ends_with("-down") {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn load_host_file(&self, name: &str) -> Result<HostFile> {
        let path = self.base_path.join(HOSTS_DIR).join(name);
        let text = std::fs::read_to_string(&path)?;
        let raw = parse_conf_text(&text);
        let first = |k: &str| raw.get(k).and_then(|v| v.first()).cloned();

        let mut rsa_public_key_pem = None;
        let mut ecdsa_public_key_pem = None;
        for block in extract_pem_blocks(&text) {
            if String::from_utf8_lossy(&block).contains("RSA") {
                rsa_public_key_pem = Some(block);
            } else {
                ecdsa_public_key_pem = Some(block);
            }
        }
        if rsa_public_key_pem.is_none() {
            if let Some(file) = first("PublicKeyFile") {
                rsa_public_key_pem = Some(std::fs::read(self.resolve(&file))?);
            }
        }
        if ecdsa_public_key_pem.is_none() {
            if let Some(file) = first("ECDSAPublicKeyFile") {
                ecdsa_public_key_pem = Some(std::fs::read(self.resolve(&file))?);
            }
        }

        let subnets = raw.get("Subnet").cloned().unwrap_or_default();
        let address = first("Address");
        let port = first("Port").and_then(|v| v.parse().ok());

        Ok(HostFile { name: name.to_string(), rsa_public_key_pem, ecdsa_public_key_pem, address, port, subnets, raw })
    }

    /// Write a self-describing `hosts/<name>` file: `Port`/`Address` lines
    /// followed by the trailing inline PEM block(s), symmetric with
    /// `extract_pem_blocks` on load.
    pub fn write_self_host_file(&self, name: &str, rsa_public_pem: &[u8], ecdsa_public_pem: Option<&[u8]>, port: u16, address: Option<&str>) -> Result<()> {
        let mut text = String::new();
        if let Some(addr) = address {
            text.push_str(&format!("Address = {}\n", addr));
        }
        text.push_str(&format!("Port = {}\n", port));
        text.push('\n');
        text.push_str(std::str::from_utf8(rsa_public_pem).map_err(|e| Error::Config(e.to_string()))?);
        if let Some(ecdsa) = ecdsa_public_pem {
            text.push('\n');
            text.push_str(std::str::from_utf8(ecdsa).map_err(|e| Error::Config(e.to_string()))?);
        }
        std::fs::write(self.base_path.join(HOSTS_DIR).join(name), text)?;
        Ok(())
    }

    pub fn load_rsa_identity(&self) -> Result<Option<RsaIdentity>> {
        let path = self.base_path.join(RSA_KEY_FILE);
        if !path.exists() {
            return Ok(None);
        }
        check_private_key_permissions(&path)?;
        let pem = std::fs::read(&path)?;
        Ok(Some(RsaIdentity::from_private_pem(&pem)?))
    }

    pub fn save_rsa_identity(&self, id: &RsaIdentity) -> Result<()> {
        let path = self.base_path.join(RSA_KEY_FILE);
        std::fs::write(&path, id.to_private_pem()?)?;
        restrict_permissions(&path)?;
        Ok(())
    }

    pub fn load_ecdsa_identity(&self) -> Result<Option<EcdsaIdentity>> {
        let path = self.base_path.join(ECDSA_KEY_FILE);
        if !path.exists() {
            return Ok(None);
        }
        check_private_key_permissions(&path)?;
        let pem = std::fs::read(&path)?;
        Ok(Some(EcdsaIdentity::from_private_pem(&pem)?))
    }

    pub fn save_ecdsa_identity(&self, id: &EcdsaIdentity) -> Result<()> {
        let path = self.base_path.join(ECDSA_KEY_FILE);
        std::fs::write(&path, id.to_private_pem()?)?;
        restrict_permissions(&path)?;
        Ok(())
    }

    fn resolve(&self, maybe_relative: &str) -> PathBuf {
        let p = Path::new(maybe_relative);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_path.join(p)
        }
    }
}

/// Scan `text` for `-----BEGIN ... -----`/`-----END ... -----` blocks and
/// return each one's bytes (including the markers), in order. Supports
/// spec §6's "either `PublicKey`/`ECDSAPublicKey` inline ... or a path"
/// convention for the inline case.
fn extract_pem_blocks(text: &str) -> Vec<Vec<u8>> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<String>> = None;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("-----BEGIN") {
            current = Some(vec![line.to_string()]);
        } else if trimmed.starts_with("-----END") {
            if let Some(mut lines) = current.take() {
                lines.push(line.to_string());
                blocks.push(lines.join("\n").into_bytes());
            }
        } else if let Some(lines) = current.as_mut() {
            lines.push(line.to_string());
        }
    }
    blocks
}

#[cfg(unix)]
fn check_private_key_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(Error::Config(format!("{} is group/world accessible; refusing to load (spec: permissions must not exceed 0700)", path.display())));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_private_key_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mesh-service-datadir-test-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn open_creates_hosts_subdir() {
        let dir = temp_dir("open");
        let dd = DataDir::open(&dir).unwrap();
        assert!(dd.base_path.join(HOSTS_DIR).is_dir());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_conf_requires_a_name() {
        let dir = temp_dir("noname");
        let dd = DataDir::open(&dir).unwrap();
        std::fs::write(dir.join(CONF_FILE), "Port = 655\n").unwrap();
        assert!(dd.load_conf().is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_conf_reads_name_and_connect_to() {
        let dir = temp_dir("name");
        let dd = DataDir::open(&dir).unwrap();
        std::fs::write(dir.join(CONF_FILE), "Name = alice\nConnectTo = bob\n").unwrap();
        let config = dd.load_conf().unwrap();
        assert_eq!(config.name, "alice");
        assert_eq!(config.connect_to, vec!["bob".to_string()]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn extract_pem_blocks_finds_embedded_key() {
        let text = "Port = 655\nAddress = 1.2.3.4\n\n-----BEGIN RSA PUBLIC KEY-----\nabcd\n-----END RSA PUBLIC KEY-----\n";
        let blocks = extract_pem_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert!(String::from_utf8(blocks[0].clone()).unwrap().contains("RSA PUBLIC KEY"));
    }

    #[test]
    fn load_host_file_classifies_inline_rsa_key() {
        let dir = temp_dir("hostfile");
        let dd = DataDir::open(&dir).unwrap();
        let text = "Address = 10.0.0.1\nPort = 655\nSubnet = 10.1.0.0/24\n\n-----BEGIN RSA PUBLIC KEY-----\nabcd\n-----END RSA PUBLIC KEY-----\n";
        std::fs::write(dir.join(HOSTS_DIR).join("bob"), text).unwrap();
        let host = dd.load_host_file("bob").unwrap();
        assert_eq!(host.address.as_deref(), Some("10.0.0.1"));
        assert_eq!(host.port, Some(655));
        assert_eq!(host.subnets, vec!["10.1.0.0/24".to_string()]);
        assert!(host.rsa_public_key_pem.is_some());
        assert!(host.ecdsa_public_key_pem.is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
