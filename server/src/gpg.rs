//! Repository signing-key provisioning.
//!
//! A thin boundary around the external `gpg` binary: the armored public half
//! of the configured repository signing key is planted at each repository
//! root so clients can fetch it, and any configured upload-verification keys
//! are imported for the Debian indexer. Nothing here is fatal; a missing key
//! or tool simply means an unsigned repository.

use std::ffi::OsString;
use std::path::Path;

use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::exec;
use crate::fsops;

/// Public-key artifact name at the Debian repository root.
pub const DEB_KEYRING: &str = "archive-keyring.asc";
/// Public-key artifact name at the RPM repository root.
pub const RPM_KEYRING: &str = "RPM-GPG-KEY.asc";

/// Startup pass: provision keyrings for repository roots that already exist.
pub async fn init(config: &Config) {
    if config.upload.enabled.deb {
        init_deb_keyring(config).await;
    }
    if config.upload.enabled.rpm {
        init_rpm_keyring(config).await;
    }
}

/// Plant the public-key artifact at the Debian repository root and import
/// upload-verification keys. Called when `<repo>/deb` comes into existence
/// and once at startup.
pub async fn init_deb_keyring(config: &Config) {
    let deb_root = config.paths.repo_dir.join("deb");
    if !fsops::path_exists(&deb_root).await {
        return;
    }
    if let Some(armored) = export_public_key(config).await {
        let keyring = deb_root.join(DEB_KEYRING);
        if write_keyring(&keyring, &armored).await {
            // reprepro needs the repository key in its own keyring too.
            import_key_file(config, &keyring).await;
        }
    }
    import_public_keys(config).await;
}

/// Plant the public-key artifact at the RPM repository root. Called when
/// `<repo>/rpm` comes into existence and once at startup.
pub async fn init_rpm_keyring(config: &Config) {
    let rpm_root = config.paths.repo_dir.join("rpm");
    if !fsops::path_exists(&rpm_root).await {
        return;
    }
    if let Some(armored) = export_public_key(config).await {
        write_keyring(&rpm_root.join(RPM_KEYRING), &armored).await;
    }
}

/// Extract the armored public key of the configured repository private key
/// by importing it into a scratch gpg home and exporting it back out.
async fn export_public_key(config: &Config) -> Option<String> {
    let gpg_bin = config.gpg.gpg_bin.as_ref()?;
    let key_file = config.gpg.repo_private_key_file.as_ref()?;
    if !fsops::path_exists(key_file).await {
        warn!(
            "repository private key file {} does not exist",
            key_file.display()
        );
        return None;
    }
    let home = match tempfile::tempdir() {
        Ok(home) => home,
        Err(err) => {
            warn!("failed to create a scratch gpg home: {err}");
            return None;
        }
    };

    let import = exec::run(
        gpg_bin,
        gpg_args(home.path(), ["--import"], Some(key_file.as_path())),
    )
    .await;
    if !import.ok() {
        warn!(
            "failed to read repository private key {}",
            key_file.display()
        );
        return None;
    }

    let export = exec::run(
        gpg_bin,
        gpg_args(home.path(), ["--armor", "--export"], None),
    )
    .await;
    if export.ok() && !export.stdout.trim().is_empty() {
        Some(export.stdout)
    } else {
        warn!("failed to export the repository public key");
        None
    }
}

fn gpg_args<const N: usize>(
    home: &Path,
    operation: [&str; N],
    file: Option<&Path>,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--batch".into(),
        "--quiet".into(),
        "--homedir".into(),
        home.as_os_str().to_os_string(),
    ];
    args.extend(operation.iter().map(OsString::from));
    if let Some(file) = file {
        args.push(file.as_os_str().to_os_string());
    }
    args
}

/// Write the keyring artifact unless it is already present. Returns whether
/// the artifact exists afterwards.
async fn write_keyring(path: &Path, armored: &str) -> bool {
    if fsops::path_exists(path).await {
        debug!("repository key file {} already present", path.display());
        return true;
    }
    match fs::write(path, armored).await {
        Ok(()) => {
            info!("wrote repository public key to {}", path.display());
            true
        }
        Err(err) => {
            warn!("failed to write {}: {err}", path.display());
            false
        }
    }
}

/// Import the configured upload-verification public keys into the default
/// gpg keyring.
async fn import_public_keys(config: &Config) {
    if config.gpg.gpg_bin.is_none() {
        return;
    }
    if let Some(file) = &config.gpg.public_keys_file {
        import_key_file(config, file).await;
    }
    if let Some(dir) = &config.gpg.public_keys_dir {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                import_key_file(config, &entry.path()).await;
            }
        }
    }
}

async fn import_key_file(config: &Config, path: &Path) {
    let Some(gpg_bin) = config.gpg.gpg_bin.as_ref() else {
        return;
    };
    if !fsops::path_exists(path).await {
        warn!("GPG key file {} does not exist", path.display());
        return;
    }
    let mut args: Vec<OsString> = vec!["--batch".into(), "--quiet".into(), "--import".into()];
    args.push(path.as_os_str().to_os_string());
    let result = exec::run(gpg_bin, args).await;
    if !result.ok() {
        warn!("failed to import GPG public keys from {}", path.display());
    }
}
