//! Service configuration.
//!
//! Configuration comes from the environment (this service is deployed as a
//! container with env-injected settings). External tools are probed once at
//! startup; a tool that cannot run `--version` successfully is treated as
//! absent, which disables the corresponding repository flavor.

use std::env;
use std::path::PathBuf;

use serde::Serialize;
use tracing::warn;

use crate::exec;

/// Filesystem roots and external tool locations.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Root of the intake area (`tmp/`, `staging/`, `process/`).
    pub incoming_dir: PathBuf,
    /// Root of the per-distro indexer state (conf and db directories).
    pub repo_state_dir: PathBuf,
    /// Root of the published repositories.
    pub repo_dir: PathBuf,
    /// Signing script handed to the indexers, when repository signing is
    /// configured.
    pub sign_script: Option<PathBuf>,
    /// RPM indexer script; `None` disables RPM support.
    pub createrepo_script: Option<PathBuf>,
    /// Debian indexer binary; `None` disables Debian support.
    pub reprepro_bin: Option<PathBuf>,
}

impl Paths {
    pub fn tmp_dir(&self) -> PathBuf {
        self.incoming_dir.join("tmp")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.incoming_dir.join("staging")
    }

    pub fn process_dir(&self) -> PathBuf {
        self.incoming_dir.join("process")
    }
}

/// Which upload APIs are available.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EnabledApis {
    pub deb: bool,
    pub rpm: bool,
}

impl EnabledApis {
    pub fn any(&self) -> bool {
        self.deb || self.rpm
    }
}

/// Upload handling options.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Per-request upload size limit in bytes; `None` means unlimited.
    pub size_limit: Option<u64>,
    /// Multipart field name for batch uploads.
    pub post_field: String,
    /// Available upload APIs (derived from the probed tools).
    pub enabled: EnabledApis,
}

/// GPG key material locations.
#[derive(Debug, Clone)]
pub struct GpgConfig {
    /// gpg binary; `None` disables key handling entirely.
    pub gpg_bin: Option<PathBuf>,
    /// Private key whose public half is planted at the repository roots.
    pub repo_private_key_file: Option<PathBuf>,
    /// Extra public keys to import for upload verification.
    pub public_keys_file: Option<PathBuf>,
    /// Directory of extra public keys to import.
    pub public_keys_dir: Option<PathBuf>,
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub paths: Paths,
    pub upload: UploadOptions,
    pub gpg: GpgConfig,
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var(name).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// A tool setting: unset means the default, set-but-empty means disabled.
fn env_tool(name: &str, default: &str) -> Option<PathBuf> {
    match env::var(name) {
        Ok(value) if value.is_empty() => None,
        Ok(value) => Some(PathBuf::from(value)),
        Err(_) => Some(PathBuf::from(default)),
    }
}

impl Config {
    /// Read configuration from the environment. No filesystem access and no
    /// tool probing happens here; see [`Config::probe_tools`].
    pub fn from_env() -> Self {
        let incoming_dir = env_path("INCOMING_DIR").unwrap_or_else(|| PathBuf::from("data/incoming"));
        let repo_state_dir =
            env_path("REPO_STATE_DIR").unwrap_or_else(|| PathBuf::from("data/repo-state"));
        let repo_dir = env_path("REPO_DIR").unwrap_or_else(|| PathBuf::from("data/repo"));

        let repo_private_key_file = env_path("GPG_REPO_PRIVATE_KEY_FILE");
        // Signing only makes sense with a repository key to sign with.
        let sign_script = match &repo_private_key_file {
            Some(key) if key.exists() => Some(
                env_path("SIGN_SCRIPT").unwrap_or_else(|| PathBuf::from("scripts/sign.sh")),
            ),
            _ => None,
        };

        let createrepo_script = env_tool("CREATEREPO_SCRIPT", "scripts/createrepo.sh");
        let reprepro_bin = env_tool("REPREPRO_BIN", "reprepro");
        let gpg_bin = env_tool("GPG_BIN", "gpg");

        let size_limit = env::var("UPLOAD_SIZE_LIMIT")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|limit| *limit > 0);
        let post_field = env::var("UPLOAD_POST_FIELD")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "package".to_string());

        let enabled = EnabledApis {
            deb: reprepro_bin.is_some(),
            rpm: createrepo_script.is_some(),
        };

        Config {
            paths: Paths {
                incoming_dir,
                repo_state_dir,
                repo_dir,
                sign_script,
                createrepo_script,
                reprepro_bin,
            },
            upload: UploadOptions {
                size_limit,
                post_field,
                enabled,
            },
            gpg: GpgConfig {
                gpg_bin,
                repo_private_key_file,
                public_keys_file: env_path("GPG_PUBLIC_KEYS_FILE"),
                public_keys_dir: env_path("GPG_PUBLIC_KEYS_DIR"),
            },
        }
    }

    /// Probe the configured external tools, dropping any that cannot run
    /// `--version`, and recompute the enabled APIs accordingly.
    pub async fn probe_tools(&mut self) {
        if let Some(script) = self.paths.createrepo_script.clone() {
            if !exec::run(&script, ["--version"]).await.ok() {
                warn!("no usable createrepo tool found at {}", script.display());
                self.paths.createrepo_script = None;
            }
        }
        if let Some(bin) = self.paths.reprepro_bin.clone() {
            if !exec::run(&bin, ["--version"]).await.ok() {
                warn!("no usable reprepro tool found at {}", bin.display());
                self.paths.reprepro_bin = None;
            }
        }
        if let Some(bin) = self.gpg.gpg_bin.clone() {
            if !exec::run(&bin, ["--version"]).await.ok() {
                warn!("no usable gpg tool found at {}", bin.display());
                self.gpg.gpg_bin = None;
            }
        }
        self.upload.enabled = EnabledApis {
            deb: self.paths.reprepro_bin.is_some(),
            rpm: self.paths.createrepo_script.is_some(),
        };
    }
}
