//! Filesystem plumbing for the intake pipeline: the move primitive, the
//! staging-tree walk, and the private temp-name scheme.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{ServerError, ServerResult};

/// Move a single file into a target directory, creating the directory as
/// needed and overwriting any existing target.
pub async fn move_file(temp_path: &Path, target_dir: &Path, target_path: &Path) -> ServerResult<()> {
    let mv = async {
        fs::create_dir_all(target_dir).await?;
        rename_or_copy(temp_path, target_path).await
    };
    match mv.await {
        Ok(()) => {
            debug!("moved {} to {}", temp_path.display(), target_path.display());
            Ok(())
        }
        Err(source) => Err(ServerError::Move {
            from: temp_path.to_path_buf(),
            to: target_path.to_path_buf(),
            source,
        }),
    }
}

/// Move every file under `src` into `dest`, preserving relative paths and
/// overwriting existing targets. Destination directories are created lazily,
/// only when the destination directory changes from the previous file's.
pub async fn move_tree(src: &Path, dest: &Path) -> ServerResult<()> {
    let mut ensured: Option<PathBuf> = None;
    for rel in collect_files(src).await? {
        let source = src.join(&rel);
        let target = dest.join(&rel);
        let target_dir = match target.parent() {
            Some(parent) => parent.to_path_buf(),
            None => dest.to_path_buf(),
        };
        if ensured.as_deref() != Some(target_dir.as_path()) {
            fs::create_dir_all(&target_dir).await?;
            ensured = Some(target_dir);
        }
        rename_or_copy(&source, &target)
            .await
            .map_err(|source_err| ServerError::Move {
                from: source,
                to: target,
                source: source_err,
            })?;
    }
    Ok(())
}

/// Rename, falling back to copy-and-delete for cross-device targets.
async fn rename_or_copy(src: &Path, dest: &Path) -> std::io::Result<()> {
    if fs::rename(src, dest).await.is_ok() {
        return Ok(());
    }
    fs::copy(src, dest).await?;
    fs::remove_file(src).await
}

/// Relative paths of every regular file under `root`, lexicographically
/// sorted. A missing root yields an empty list.
pub async fn collect_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !path_exists(root).await {
        return Ok(files);
    }
    let mut pending = vec![PathBuf::new()];
    while let Some(rel) = pending.pop() {
        let mut entries = fs::read_dir(root.join(&rel)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let child = rel.join(entry.file_name());
            if file_type.is_dir() {
                pending.push(child);
            } else if file_type.is_file() {
                files.push(child);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Names of the immediate subdirectories of `path`, sorted. A missing
/// directory yields an empty list.
pub async fn list_subdirs(path: &Path) -> std::io::Result<Vec<String>> {
    let mut dirs = Vec::new();
    let mut entries = match fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(err) => return Err(err),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// True when the directory exists and contains at least one entry.
pub async fn dir_nonempty(path: &Path) -> bool {
    match fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

pub async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Private temp-file name for one upload: timestamp, peer hash (or a random
/// identifier when the peer address is unknown), and the filename.
pub fn temp_name(peer: Option<SocketAddr>, filename: &str) -> String {
    let identifier = match peer {
        Some(addr) => {
            let mut hasher = Sha1::new();
            hasher.update(format!("{}:{}", addr.ip(), addr.port()));
            hex::encode(hasher.finalize())
        }
        None => {
            warn!("could not determine the remote address for a temp name");
            uuid::Uuid::new_v4().simple().to_string()
        }
    };
    format!(
        "{}-{}-{}",
        chrono::Utc::now().timestamp_millis(),
        identifier,
        filename
    )
}

/// The name portion of an uploaded filename, without any directory part.
pub fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Sanitize an uploaded filename to `[a-zA-Z0-9_.-]` for use in temp names.
pub fn sanitize_filename(name: &str) -> String {
    base_name(name)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect()
}
