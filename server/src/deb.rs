//! Debian repository build orchestrator.
//!
//! Reconciles the persisted per-distribution state with the upload batches
//! found in the processing tree, regenerates the reprepro configuration, and
//! drives reprepro: one `processincoming` run per batch directory, then an
//! `export` + `clearvanished` pass over every known distribution.
//!
//! Distribution state is persisted as the generated `conf/distributions`
//! descriptor itself: it is parsed back at build time, merged (union only —
//! components and architectures never shrink here; only `clearvanished` may
//! prune references inside reprepro's own database), and rewritten only when
//! the rendered text differs byte-for-byte, so an unchanged build leaves the
//! descriptor untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ServerError, ServerResult};
use crate::exec::{self, ExecResult};
use crate::fsops;
use crate::gpg;

/// Per-release repository state, persisted in `conf/distributions`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseState {
    pub components: BTreeSet<String>,
    pub ddeb_components: BTreeSet<String>,
    pub architectures: BTreeSet<String>,
}

/// Release name to release state, for one distro. Ordered, so descriptor
/// generation is deterministic.
pub type DistroState = BTreeMap<String, ReleaseState>;

/// Batch directories (relative to the processing deb root, `/`-separated)
/// and their `.changes` files, grouped by distro.
type ChangesMap = BTreeMap<String, BTreeMap<String, Vec<PathBuf>>>;

/// What one batch's `.changes` files declare.
#[derive(Debug, Default)]
struct ChangesScan {
    architectures: BTreeSet<String>,
    has_ddeb: bool,
}

/// Fold newly snapshotted Debian upload batches into the per-distro
/// repositories, then re-export and clean up every known distribution.
pub async fn process_incoming(config: &Config) -> ServerResult<BTreeMap<String, ExecResult>> {
    let reprepro = config
        .paths
        .reprepro_bin
        .clone()
        .ok_or_else(|| ServerError::Configuration("reprepro binary is not available".into()))?;

    let incoming_root = config.paths.process_dir().join("deb");
    let deb_repo_dir = config.paths.repo_dir.join("deb");

    let changes_map = collect_changes_batches(&incoming_root).await?;

    // Every distro we know about: already published, persisted state only,
    // or arriving now.
    let mut known: BTreeSet<String> = fsops::list_subdirs(&deb_repo_dir).await?.into_iter().collect();
    for name in fsops::list_subdirs(&config.paths.repo_state_dir).await? {
        if let Some(distro) = name.strip_prefix("deb-") {
            known.insert(distro.to_string());
        }
    }
    known.extend(changes_map.keys().cloned());

    let mut states: BTreeMap<String, DistroState> = BTreeMap::new();
    for distro in &known {
        states.insert(distro.clone(), load_state(config, distro).await);
    }

    let mut results = BTreeMap::new();

    if !changes_map.is_empty() {
        if !fsops::path_exists(&deb_repo_dir).await {
            fs::create_dir_all(&deb_repo_dir).await?;
            gpg::init_deb_keyring(config).await;
        }

        for (distro, batches) in &changes_map {
            let state = states.entry(distro.clone()).or_default();
            for (directory, changes_files) in batches {
                let Some((release, component)) = split_batch_dir(directory) else {
                    continue;
                };
                let scan = scan_changes_files(&incoming_root, changes_files).await?;
                let release_state = state.entry(release).or_default();
                release_state.components.insert(component.clone());
                release_state.architectures.extend(scan.architectures);
                if scan.has_ddeb {
                    release_state.ddeb_components.insert(component);
                }
            }
        }

        for (distro, batches) in &changes_map {
            let state = states.entry(distro.clone()).or_default();
            let imported =
                import_distro(config, &reprepro, distro, state, batches, &incoming_root).await?;
            results.extend(imported);
        }
    }

    // Re-export and clean up, also when nothing new arrived: Origin or
    // Description may have changed independently of package arrivals.
    if fsops::path_exists(&deb_repo_dir).await {
        for distro in &known {
            let state = states.get(distro).cloned().unwrap_or_default();
            let (key, result) = export_distro(config, &reprepro, distro, &state).await?;
            results.insert(key, result);
        }
    }

    Ok(results)
}

/// Find every `.changes` file under the processing deb root and group it by
/// `(distro, batch directory)`.
async fn collect_changes_batches(incoming_root: &Path) -> ServerResult<ChangesMap> {
    let mut map = ChangesMap::new();
    for rel in fsops::collect_files(incoming_root).await? {
        if rel.extension().and_then(|e| e.to_str()) != Some("changes") {
            continue;
        }
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        // distro / release / component [/ subcomponent] / file.changes
        if parts.len() < 4 {
            warn!("ignoring stray changes file {}", rel.display());
            continue;
        }
        let distro = parts[0].clone();
        let directory = parts[..parts.len() - 1].join("/");
        map.entry(distro)
            .or_default()
            .entry(directory)
            .or_default()
            .push(rel);
    }
    Ok(map)
}

/// Split a batch directory into its release and component path.
fn split_batch_dir(directory: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = directory.split('/').collect();
    if parts.len() < 3 {
        return None;
    }
    Some((parts[1].to_string(), parts[2..].join("/")))
}

async fn scan_changes_files(
    incoming_root: &Path,
    changes_files: &[PathBuf],
) -> ServerResult<ChangesScan> {
    let mut scan = ChangesScan::default();
    for rel in changes_files {
        let content = fs::read_to_string(incoming_root.join(rel)).await?;
        let file_scan = parse_changes(&content);
        scan.architectures.extend(file_scan.architectures);
        scan.has_ddeb |= file_scan.has_ddeb;
    }
    Ok(scan)
}

/// Pull the architecture list and debug-package presence out of one
/// change-control file.
fn parse_changes(content: &str) -> ChangesScan {
    let mut scan = ChangesScan::default();
    let mut in_files = false;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("Architecture:") {
            scan.architectures
                .extend(rest.split_whitespace().map(str::to_string));
            in_files = false;
        } else if line.starts_with("Files:") {
            in_files = true;
        } else if !line.starts_with(' ') && !line.starts_with('\t') {
            in_files = false;
        } else if in_files {
            // Last token of a Files entry is the filename.
            if let Some(name) = line.split_whitespace().last() {
                if name.ends_with(".ddeb") {
                    scan.has_ddeb = true;
                }
            }
        }
    }
    scan
}

/// Load a distro's persisted state from its descriptor, if any.
async fn load_state(config: &Config, distro: &str) -> DistroState {
    let path = conf_dir(config, distro).join("distributions");
    match fs::read_to_string(&path).await {
        Ok(text) => parse_distributions(&text, &path),
        Err(_) => DistroState::new(),
    }
}

fn state_dir(config: &Config, distro: &str) -> PathBuf {
    config.paths.repo_state_dir.join(format!("deb-{distro}"))
}

fn conf_dir(config: &Config, distro: &str) -> PathBuf {
    state_dir(config, distro).join("conf")
}

/// Parse a persisted `conf/distributions` descriptor back into state.
fn parse_distributions(text: &str, origin_path: &Path) -> DistroState {
    let mut state = DistroState::new();
    for paragraph in text.split("\n\n") {
        let mut codename = None;
        let mut release_state = ReleaseState::default();
        for line in paragraph.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key {
                "Codename" => codename = Some(value.to_string()),
                "Components" => {
                    release_state.components =
                        value.split_whitespace().map(str::to_string).collect();
                }
                "DDebComponents" => {
                    release_state.ddeb_components =
                        value.split_whitespace().map(str::to_string).collect();
                }
                "Architectures" => {
                    release_state.architectures =
                        value.split_whitespace().map(str::to_string).collect();
                }
                _ => {}
            }
        }
        let Some(codename) = codename else {
            continue;
        };
        if release_state.components.is_empty() {
            warn!("no components found in {}", origin_path.display());
            continue;
        }
        if release_state.architectures.is_empty() {
            warn!("no architectures found in {}", origin_path.display());
            continue;
        }
        state.insert(codename, release_state);
    }
    state
}

/// Render the `conf/distributions` descriptor for one distro.
///
/// The output is fully determined by the state and the environment, so a
/// byte-for-byte comparison against the persisted descriptor detects real
/// changes and nothing else.
fn render_distributions(distro: &str, state: &DistroState, sign_script: Option<&Path>) -> String {
    let mut blocks = Vec::new();
    for (release, release_state) in state {
        if release_state.components.is_empty() {
            continue;
        }
        let mut lines = vec![
            format!("Codename: {release}"),
            format!("Suite: {release}"),
            format!("Components: {}", join(&release_state.components)),
        ];
        if !release_state.ddeb_components.is_empty() {
            lines.push(format!(
                "DDebComponents: {}",
                join(&release_state.ddeb_components)
            ));
        }
        lines.push(format!(
            "Architectures: {}",
            join(&release_state.architectures)
        ));
        if let Some(origin) = env_lookup("DEB_ORIGIN", distro, release) {
            lines.push(format!("Origin: {origin}"));
        }
        if let Some(description) = env_lookup("DEB_DESCRIPTION", distro, release) {
            lines.push(format!("Description: {description}"));
        }
        lines.push("DebOverride: +c/override".to_string());
        lines.push("UDebOverride: +c/override".to_string());
        lines.push("DscOverride: +c/override".to_string());
        lines.push("Tracking: minimal".to_string());
        lines.push("Contents:".to_string());
        if let Some(script) = sign_script {
            lines.push(format!("SignWith: !{}", base_relative(script)));
        }
        blocks.push(lines.join("\n"));
    }
    if blocks.is_empty() {
        String::new()
    } else {
        format!("{}\n", blocks.join("\n\n"))
    }
}

fn join(values: &BTreeSet<String>) -> String {
    values.iter().cloned().collect::<Vec<_>>().join(" ")
}

/// Resolve a per-distribution setting through the environment fallback
/// chain: `<P>_<DISTRO>_<RELEASE>`, `<P>_<RELEASE>`, `<P>_<DISTRO>`, `<P>`.
/// An empty value stops the chain and suppresses the field.
fn env_lookup(prefix: &str, distro: &str, release: &str) -> Option<String> {
    let distro = env_component(distro);
    let release = env_component(release);
    [
        format!("{prefix}_{distro}_{release}"),
        format!("{prefix}_{release}"),
        format!("{prefix}_{distro}"),
        prefix.to_string(),
    ]
    .iter()
    .find_map(|name| std::env::var(name).ok())
    .filter(|value| !value.is_empty())
}

fn env_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// reprepro resolves relative paths against its base directory when they
/// carry the `+b/` marker; absolute paths pass through unmodified.
fn base_relative(path: &Path) -> String {
    if path.is_absolute() {
        path.display().to_string()
    } else {
        format!("+b/{}", path.display())
    }
}

fn render_incoming(distro: &str, release: &str, incoming_dir: &Path, tmp_dir: &Path) -> String {
    format!(
        "Name: {distro}\nIncomingDir: {}\nTempDir: {}\nAllow: {release}\nCleanup: unused_buildinfo_files\n",
        incoming_dir.display(),
        tmp_dir.display(),
    )
}

fn render_options(out_dir: &Path, db_dir: &Path) -> String {
    format!(
        "verbose\noutdir {}\ndbdir {}\n",
        base_relative(out_dir),
        base_relative(db_dir),
    )
}

fn render_override(component: &str) -> String {
    format!("* $Component {component}\n")
}

/// Write `content` to `path` only when it differs from what is on disk.
async fn write_if_changed(path: &Path, content: &str) -> std::io::Result<bool> {
    if let Ok(existing) = fs::read_to_string(path).await {
        if existing == content {
            return Ok(false);
        }
    }
    fs::write(path, content).await?;
    Ok(true)
}

/// Import every batch directory of one distro, strictly sequentially: later
/// invocations overwrite the scoped incoming and override files.
async fn import_distro(
    config: &Config,
    reprepro: &Path,
    distro: &str,
    state: &DistroState,
    batches: &BTreeMap<String, Vec<PathBuf>>,
    incoming_root: &Path,
) -> ServerResult<BTreeMap<String, ExecResult>> {
    let state_dir = state_dir(config, distro);
    let conf_dir = conf_dir(config, distro);
    let out_dir = config.paths.repo_dir.join("deb").join(distro);
    let db_dir = state_dir.join("db");

    fs::create_dir_all(&out_dir).await?;
    fs::create_dir_all(&db_dir).await?;
    fs::create_dir_all(&conf_dir).await?;

    let descriptor = render_distributions(distro, state, config.paths.sign_script.as_deref());
    debug!("writing conf/distributions for {distro}:\n{descriptor}");
    write_if_changed(&conf_dir.join("distributions"), &descriptor).await?;

    let mut results = BTreeMap::new();
    for directory in batches.keys() {
        let Some((release, component)) = split_batch_dir(directory) else {
            continue;
        };
        let incoming_dir = incoming_root.join(directory);
        let tmp_dir = state_dir.join(format!("tmp-{release}"));
        fs::create_dir_all(&tmp_dir).await?;

        fs::write(
            conf_dir.join("incoming"),
            render_incoming(distro, &release, &incoming_dir, &tmp_dir),
        )
        .await?;
        fs::write(conf_dir.join("options"), render_options(&out_dir, &db_dir)).await?;
        fs::write(conf_dir.join("override"), render_override(&component)).await?;

        let result = reprepro_exec(
            reprepro,
            &conf_dir,
            &[
                "--ignore=undefinedtarget",
                "--export=silent-never",
                "processincoming",
                distro,
            ],
        )
        .await;
        results.insert(format!("deb/{directory}"), result);
    }
    Ok(results)
}

/// Re-export one distro and, when the export succeeds, clear references to
/// vanished files from reprepro's database.
async fn export_distro(
    config: &Config,
    reprepro: &Path,
    distro: &str,
    state: &DistroState,
) -> ServerResult<(String, ExecResult)> {
    let conf_dir = conf_dir(config, distro);
    if !state.is_empty() {
        let out_dir = config.paths.repo_dir.join("deb").join(distro);
        let db_dir = state_dir(config, distro).join("db");
        fs::create_dir_all(&out_dir).await?;
        fs::create_dir_all(&db_dir).await?;
        fs::create_dir_all(&conf_dir).await?;
        fs::write(conf_dir.join("options"), render_options(&out_dir, &db_dir)).await?;
        let descriptor = render_distributions(distro, state, config.paths.sign_script.as_deref());
        write_if_changed(&conf_dir.join("distributions"), &descriptor).await?;
    }

    let export = reprepro_exec(reprepro, &conf_dir, &["export"]).await;
    let result = if export.ok() {
        reprepro_exec(reprepro, &conf_dir, &["clearvanished"]).await
    } else {
        export
    };
    Ok((format!("deb/{distro}"), result))
}

async fn reprepro_exec(reprepro: &Path, conf_dir: &Path, args: &[&str]) -> ExecResult {
    let mut argv = vec!["--confdir".to_string(), base_relative(conf_dir)];
    argv.extend(args.iter().map(|s| s.to_string()));
    exec::run(reprepro, argv).await
}
