//! Locates the broker executable the way a browser resolves
//! `connectNative(<host>)`: through a `<host>.json` manifest in one of the
//! native messaging host directories.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{BridgeError, BridgeResult};

const USER_HOST_DIRS: &[&str] = &[
    ".mozilla/native-messaging-hosts",
    ".config/google-chrome/NativeMessagingHosts",
    ".config/chromium/NativeMessagingHosts",
];

const SYSTEM_HOST_DIRS: &[&str] = &[
    "/usr/lib/mozilla/native-messaging-hosts",
    "/usr/lib64/mozilla/native-messaging-hosts",
    "/etc/opt/chrome/native-messaging-hosts",
    "/etc/chromium/native-messaging-hosts",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub transport: String,
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl HostManifest {
    /// Whether an extension id may talk to this host. Manifests that list
    /// nobody allow everybody.
    pub fn allows(&self, extension_id: &str) -> bool {
        if self.allowed_extensions.is_empty() && self.allowed_origins.is_empty() {
            return true;
        }
        self.allowed_extensions.iter().any(|id| id == extension_id)
            || self
                .allowed_origins
                .iter()
                .any(|origin| origin.trim_end_matches('/').ends_with(extension_id))
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedHost {
    pub manifest: HostManifest,
    pub manifest_path: PathBuf,
    /// Absolute path of the broker executable.
    pub executable: PathBuf,
}

/// Directories searched in order: caller-supplied, per-user, then system.
pub fn search_dirs(extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs_out: Vec<PathBuf> = extra.to_vec();
    if let Some(home) = dirs::home_dir() {
        dirs_out.extend(USER_HOST_DIRS.iter().map(|rel| home.join(rel)));
    }
    dirs_out.extend(SYSTEM_HOST_DIRS.iter().map(PathBuf::from));
    dirs_out
}

pub fn resolve(host_name: &str, search: &[PathBuf]) -> BridgeResult<ResolvedHost> {
    let file_name = format!("{host_name}.json");
    let manifest_path = search
        .iter()
        .map(|dir| dir.join(&file_name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            BridgeError::Manifest(format!(
                "no {file_name} in any of {} search directories",
                search.len()
            ))
        })?;
    load(host_name, &manifest_path)
}

pub fn load(host_name: &str, manifest_path: &Path) -> BridgeResult<ResolvedHost> {
    let raw = std::fs::read_to_string(manifest_path)?;
    let manifest: HostManifest = serde_json::from_str(&raw).map_err(|error| {
        BridgeError::Manifest(format!("{}: {error}", manifest_path.display()))
    })?;

    if manifest.name != host_name {
        return Err(BridgeError::Manifest(format!(
            "{} declares host {:?}, expected {host_name:?}",
            manifest_path.display(),
            manifest.name
        )));
    }
    if manifest.transport != "stdio" {
        return Err(BridgeError::Manifest(format!(
            "unsupported host type {:?}",
            manifest.transport
        )));
    }

    let executable = if manifest.path.is_absolute() {
        manifest.path.clone()
    } else {
        manifest_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&manifest.path)
    };

    Ok(ResolvedHost {
        manifest,
        manifest_path: manifest_path.to_path_buf(),
        executable,
    })
}
