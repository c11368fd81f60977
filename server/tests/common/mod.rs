//! Shared fixtures for the end-to-end tests.

// Each test binary uses its own slice of these fixtures.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use axum_test::TestServer;
use depot_server::config::{Config, EnabledApis, GpgConfig, Paths, UploadOptions};
use depot_server::web::{self, AppState};

pub struct TestService {
    pub server: TestServer,
    pub config: Config,
    _root: tempfile::TempDir,
}

/// Configuration rooted under one temp directory, with no tools and both
/// APIs disabled; tests flip on what they need.
pub fn base_config(root: &Path) -> Config {
    Config {
        paths: Paths {
            incoming_dir: root.join("incoming"),
            repo_state_dir: root.join("repo-state"),
            repo_dir: root.join("repo"),
            sign_script: None,
            createrepo_script: None,
            reprepro_bin: None,
        },
        upload: UploadOptions {
            size_limit: None,
            post_field: "package".to_string(),
            enabled: EnabledApis {
                deb: false,
                rpm: false,
            },
        },
        gpg: GpgConfig {
            gpg_bin: None,
            repo_private_key_file: None,
            public_keys_file: None,
            public_keys_dir: None,
        },
    }
}

/// Spin up an in-process service over a fresh temp tree.
pub async fn service(configure: impl FnOnce(&mut Config, &Path)) -> TestService {
    let root = tempfile::tempdir().expect("create test root");
    let mut config = base_config(root.path());
    configure(&mut config, root.path());
    web::prepare_layout(&config).await.expect("prepare layout");
    let server =
        TestServer::new(web::router(AppState::new(config.clone()))).expect("start test server");
    TestService {
        server,
        config,
        _root: root,
    }
}

/// Write an executable stub that appends `$1|$2|...` for each invocation to
/// `<name>.log` next to itself and exits with `exit_code`.
#[cfg(unix)]
pub fn write_stub(dir: &Path, name: &str, exit_code: i32) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    let log = stub_log(dir, name);
    let script = format!(
        "#!/bin/sh\nout=\"\"\nfirst=1\nfor arg in \"$@\"; do\n  if [ \"$first\" = 1 ]; then out=\"$arg\"; first=0; else out=\"$out|$arg\"; fi\ndone\nprintf '%s\\n' \"$out\" >> \"{}\"\nexit {exit_code}\n",
        log.display()
    );
    std::fs::write(&path, script).expect("write stub script");
    let mut perms = std::fs::metadata(&path).expect("stub metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("mark stub executable");
    path
}

/// Stub standing in for reprepro: logs its argv like [`write_stub`] and
/// mimics ingestion by deleting the batch files named in the scoped
/// incoming descriptor on `processincoming` runs.
#[cfg(unix)]
pub fn write_reprepro_stub(dir: &Path, exit_code: i32) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("reprepro");
    let log = stub_log(dir, "reprepro");
    let script = format!(
        "#!/bin/sh\n\
         out=\"\"\nfirst=1\nconfdir=\"\"\nprev=\"\"\n\
         for arg in \"$@\"; do\n\
         \x20 if [ \"$first\" = 1 ]; then out=\"$arg\"; first=0; else out=\"$out|$arg\"; fi\n\
         \x20 if [ \"$prev\" = --confdir ]; then confdir=\"$arg\"; fi\n\
         \x20 prev=\"$arg\"\n\
         done\n\
         printf '%s\\n' \"$out\" >> \"{log}\"\n\
         case \"$out\" in\n\
         \x20 *processincoming*)\n\
         \x20   incoming=$(sed -n 's/^IncomingDir: //p' \"$confdir/incoming\")\n\
         \x20   if [ -n \"$incoming\" ]; then rm -f \"$incoming\"/*; fi\n\
         \x20   ;;\n\
         esac\n\
         exit {exit_code}\n",
        log = log.display()
    );
    std::fs::write(&path, script).expect("write reprepro stub");
    let mut perms = std::fs::metadata(&path).expect("stub metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("mark stub executable");
    path
}

pub fn stub_log(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.log"))
}

/// Lines recorded by a stub so far (empty when it never ran).
pub fn stub_calls(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .map(|text| text.lines().map(str::to_string).collect())
        .unwrap_or_default()
}
