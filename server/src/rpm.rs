//! RPM repository build orchestrator.
//!
//! Relocates snapshotted RPM files into the bucketed package tree and runs
//! the createrepo wrapper once per `(distro, release)` directory. Directories
//! left un-indexed by an earlier failed or partial run are retried
//! opportunistically on the next build.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::config::Config;
use crate::error::{ServerError, ServerResult};
use crate::exec::{self, ExecResult};
use crate::fsops;
use crate::gpg;

/// Fold newly snapshotted RPM files into the repository tree and index every
/// touched (or previously missed) release directory.
pub async fn process_incoming(config: &Config) -> ServerResult<BTreeMap<String, ExecResult>> {
    let script = config
        .paths
        .createrepo_script
        .clone()
        .ok_or_else(|| ServerError::Configuration("createrepo script is not available".into()))?;

    let incoming_root = config.paths.process_dir().join("rpm");
    let rpm_repo_dir = config.paths.repo_dir.join("rpm");

    // <distro>/<release>/<file>.rpm, grouped by directory.
    let mut rpm_map: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for rel in fsops::collect_files(&incoming_root).await? {
        if rel.extension().and_then(|e| e.to_str()) != Some("rpm") {
            continue;
        }
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.len() != 3 {
            continue;
        }
        rpm_map
            .entry(format!("{}/{}", parts[0], parts[1]))
            .or_default()
            .push(rel);
    }

    let mut results = BTreeMap::new();

    if !rpm_map.is_empty() {
        if !fsops::path_exists(&rpm_repo_dir).await {
            fs::create_dir_all(&rpm_repo_dir).await?;
            gpg::init_rpm_keyring(config).await;
        }
        for (directory, files) in &rpm_map {
            let target_base = rpm_repo_dir.join(directory);
            let packages_root = target_base.join("Packages");
            for rel in files {
                let filename = match rel.file_name() {
                    Some(name) => name.to_string_lossy().into_owned(),
                    None => continue,
                };
                // Bucket by the filename's first character to keep
                // directories from growing without bound.
                let bucket: String = filename.chars().take(1).collect();
                let target_dir = packages_root.join(&bucket);
                fsops::move_file(
                    &incoming_root.join(rel),
                    &target_dir,
                    &target_dir.join(&filename),
                )
                .await?;
            }
            results.insert(
                format!("rpm/{directory}"),
                index_directory(&script, &target_base, config).await,
            );
        }
    }

    // Re-scan the published tree: retry any non-empty release directory not
    // already indexed this round.
    for distro in fsops::list_subdirs(&rpm_repo_dir).await? {
        for release in fsops::list_subdirs(&rpm_repo_dir.join(&distro)).await? {
            let directory = format!("{distro}/{release}");
            let key = format!("rpm/{directory}");
            if results.contains_key(&key) {
                continue;
            }
            let target_base = rpm_repo_dir.join(&directory);
            if fsops::dir_nonempty(&target_base).await {
                results.insert(key, index_directory(&script, &target_base, config).await);
            }
        }
    }

    Ok(results)
}

async fn index_directory(script: &Path, target_base: &Path, config: &Config) -> ExecResult {
    let sign_script = config
        .paths
        .sign_script
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_default();
    exec::run(script, [target_base.display().to_string(), sign_script]).await
}
