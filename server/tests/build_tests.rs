//! End-to-end repository build tests with stub indexer tools.

#![cfg(unix)]

mod common;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum_test::multipart::{MultipartForm, Part};
use serde_json::Value;

use common::{service, stub_calls, stub_log, write_reprepro_stub, write_stub, TestService};
use depot_server::fsops;

const CHANGES: &str = "\
Format: 1.8
Source: hello
Architecture: amd64 all
Version: 1.0-1
Files:
 0123456789abcdef0123456789abcdef 1234 misc optional hello_1.0-1_amd64.deb
";

const CHANGES_DDEB: &str = "\
Format: 1.8
Source: hello
Architecture: arm64
Files:
 0123456789abcdef0123456789abcdef 1234 misc optional hello_1.0-1_arm64.deb
 00112233445566770011223344556677 999 debug optional hello-dbgsym_1.0-1_arm64.ddeb
";

fn part(name: &str, payload: &[u8]) -> Part {
    Part::bytes(payload.to_vec()).file_name(name.to_string())
}

async fn deb_service(exit_code: i32) -> TestService {
    service(|config, root| {
        config.paths.reprepro_bin = Some(write_reprepro_stub(root, exit_code));
        config.upload.enabled.deb = true;
    })
    .await
}

async fn upload_deb_batch(svc: &TestService, path: &str, files: &[(&str, &[u8])]) {
    let mut form = MultipartForm::new();
    for (name, payload) in files {
        form = form.add_part("package", part(name, payload));
    }
    let response = svc.server.post(path).multipart(form).await;
    response.assert_status(StatusCode::CREATED);
}

#[tokio::test]
async fn deb_build_generates_descriptor_and_drives_reprepro() {
    let svc = deb_service(0).await;
    upload_deb_batch(
        &svc,
        "/api/v1/upload/deb/debian/bookworm/main",
        &[
            ("hello_1.0-1_amd64.deb", b"deb"),
            ("hello_1.0-1_amd64.changes", CHANGES.as_bytes()),
        ],
    )
    .await;

    let response = svc.server.post("/api/v1/upload/build-repo").await;
    response.assert_status(StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["message"], "Repository build script executed successfully");

    // Staging was snapshotted into the processing tree.
    assert!(fsops::collect_files(&svc.config.paths.staging_dir())
        .await
        .unwrap()
        .is_empty());

    // The persisted descriptor reflects the batch, sorted.
    let conf_dir = svc.config.paths.repo_state_dir.join("deb-debian/conf");
    let descriptor = tokio::fs::read_to_string(conf_dir.join("distributions"))
        .await
        .unwrap();
    assert!(descriptor.contains("Codename: bookworm"));
    assert!(descriptor.contains("Suite: bookworm"));
    assert!(descriptor.contains("Components: main"));
    assert!(descriptor.contains("Architectures: all amd64"));
    assert!(!descriptor.contains("DDebComponents"));

    // Scoped incoming and override files point at exactly this batch.
    let incoming = tokio::fs::read_to_string(conf_dir.join("incoming"))
        .await
        .unwrap();
    assert!(incoming.contains("Name: debian"));
    assert!(incoming.contains("Allow: bookworm"));
    assert!(incoming.contains("Cleanup: unused_buildinfo_files"));
    let incoming_dir = svc
        .config
        .paths
        .process_dir()
        .join("deb/debian/bookworm/main");
    assert!(incoming.contains(&format!("IncomingDir: {}", incoming_dir.display())));
    assert_eq!(
        tokio::fs::read_to_string(conf_dir.join("override"))
            .await
            .unwrap(),
        "* $Component main\n"
    );

    // The invocation contract: import, then export, then cleanup.
    let calls = stub_calls(&stub_log(svc.config.paths.reprepro_bin.as_ref().unwrap().parent().unwrap(), "reprepro"));
    let confdir = conf_dir.display().to_string();
    assert_eq!(
        calls,
        vec![
            format!(
                "--confdir|{confdir}|--ignore=undefinedtarget|--export=silent-never|processincoming|debian"
            ),
            format!("--confdir|{confdir}|export"),
            format!("--confdir|{confdir}|clearvanished"),
        ]
    );

    // The repository root and its public-key location were prepared.
    assert!(fsops::path_exists(&svc.config.paths.repo_dir.join("deb/debian")).await);
}

#[tokio::test]
async fn second_build_without_uploads_keeps_descriptor_byte_identical() {
    let svc = deb_service(0).await;
    upload_deb_batch(
        &svc,
        "/api/v1/upload/deb/debian/bookworm/main",
        &[("hello_1.0-1_amd64.changes", CHANGES.as_bytes())],
    )
    .await;

    svc.server
        .post("/api/v1/upload/build-repo")
        .await
        .assert_status(StatusCode::OK);

    let descriptor_path = svc
        .config
        .paths
        .repo_state_dir
        .join("deb-debian/conf/distributions");
    let first = tokio::fs::read_to_string(&descriptor_path).await.unwrap();

    // No new uploads: export and cleanup still run, the descriptor does not
    // change.
    let response = svc.server.post("/api/v1/upload/build-repo").await;
    response.assert_status(StatusCode::OK);
    let second = tokio::fs::read_to_string(&descriptor_path).await.unwrap();
    assert_eq!(first, second);

    let log = stub_log(
        svc.config
            .paths
            .reprepro_bin
            .as_ref()
            .unwrap()
            .parent()
            .unwrap(),
        "reprepro",
    );
    let calls = stub_calls(&log);
    let second_build: Vec<_> = calls[3..].to_vec();
    assert_eq!(second_build.len(), 2, "export + clearvanished only");
    assert!(second_build.iter().all(|call| !call.contains("processincoming")));
}

#[tokio::test]
async fn ddeb_entries_mark_the_component() {
    let svc = deb_service(0).await;
    upload_deb_batch(
        &svc,
        "/api/v1/upload/deb/debian/bookworm/main",
        &[("hello_1.0-1_arm64.changes", CHANGES_DDEB.as_bytes())],
    )
    .await;

    svc.server
        .post("/api/v1/upload/build-repo")
        .await
        .assert_status(StatusCode::OK);

    let descriptor = tokio::fs::read_to_string(
        svc.config
            .paths
            .repo_state_dir
            .join("deb-debian/conf/distributions"),
    )
    .await
    .unwrap();
    assert!(descriptor.contains("DDebComponents: main"));
    assert!(descriptor.contains("Architectures: arm64"));
}

#[tokio::test]
async fn state_is_unioned_across_builds() {
    let svc = deb_service(0).await;

    upload_deb_batch(
        &svc,
        "/api/v1/upload/deb/debian/bookworm/main",
        &[("hello_1.0-1_amd64.changes", CHANGES.as_bytes())],
    )
    .await;
    svc.server
        .post("/api/v1/upload/build-repo")
        .await
        .assert_status(StatusCode::OK);

    upload_deb_batch(
        &svc,
        "/api/v1/upload/deb/debian/bookworm/contrib",
        &[("hello_1.0-1_arm64.changes", CHANGES_DDEB.as_bytes())],
    )
    .await;
    svc.server
        .post("/api/v1/upload/build-repo")
        .await
        .assert_status(StatusCode::OK);

    let descriptor = tokio::fs::read_to_string(
        svc.config
            .paths
            .repo_state_dir
            .join("deb-debian/conf/distributions"),
    )
    .await
    .unwrap();
    // Union of both batches, never shrinking, emitted sorted.
    assert!(descriptor.contains("Components: contrib main"));
    assert!(descriptor.contains("Architectures: all amd64 arm64"));
    assert!(descriptor.contains("DDebComponents: contrib"));
}

#[tokio::test]
async fn failing_indexer_turns_the_build_into_a_500() {
    let svc = deb_service(2).await;
    upload_deb_batch(
        &svc,
        "/api/v1/upload/deb/debian/bookworm/main",
        &[("hello_1.0-1_amd64.changes", CHANGES.as_bytes())],
    )
    .await;

    let response = svc.server.post("/api/v1/upload/build-repo").await;
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json();
    assert_eq!(
        body["message"],
        "Repository build script execution failed. See server logs for details"
    );
}

#[tokio::test]
async fn build_with_nothing_staged_reports_no_files() {
    let svc = deb_service(0).await;
    let response = svc.server.post("/api/v1/upload/build-repo").await;
    response.assert_status(StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["message"], "No files to process");
}

#[tokio::test]
async fn repo_import_route_triggers_the_same_build() {
    let svc = deb_service(0).await;
    let response = svc.server.post("/api/v1/repo/import").await;
    response.assert_status(StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["message"], "No files to process");
}

#[tokio::test]
async fn rpm_build_buckets_packages_and_invokes_the_script() {
    let svc = service(|config, root| {
        config.paths.createrepo_script = Some(write_stub(root, "createrepo", 0));
        config.upload.enabled.rpm = true;
    })
    .await;

    svc.server
        .put("/api/v1/upload/rpm/fedora/41/zsh-5.9-1.x86_64.rpm")
        .bytes(Bytes::from_static(b"z"))
        .await
        .assert_status(StatusCode::CREATED);
    svc.server
        .put("/api/v1/upload/rpm/fedora/41/bash-5.2-1.x86_64.rpm")
        .bytes(Bytes::from_static(b"b"))
        .await
        .assert_status(StatusCode::CREATED);

    let response = svc.server.post("/api/v1/upload/build-repo").await;
    response.assert_status(StatusCode::OK);

    let packages = svc.config.paths.repo_dir.join("rpm/fedora/41/Packages");
    assert!(fsops::path_exists(&packages.join("z/zsh-5.9-1.x86_64.rpm")).await);
    assert!(fsops::path_exists(&packages.join("b/bash-5.2-1.x86_64.rpm")).await);

    // One invocation per release directory: target dir plus an empty sign
    // script argument.
    let log = stub_log(
        svc.config
            .paths
            .createrepo_script
            .as_ref()
            .unwrap()
            .parent()
            .unwrap(),
        "createrepo",
    );
    let target = svc.config.paths.repo_dir.join("rpm/fedora/41");
    assert_eq!(stub_calls(&log), vec![format!("{}|", target.display())]);
}

#[tokio::test]
async fn rpm_rescan_retries_directories_missed_by_an_earlier_run() {
    let svc = service(|config, root| {
        config.paths.createrepo_script = Some(write_stub(root, "createrepo", 0));
        config.upload.enabled.rpm = true;
    })
    .await;

    // Simulate a directory a previous (failed) run left un-indexed.
    let leftover = svc.config.paths.repo_dir.join("rpm/fedora/40/Packages/x");
    tokio::fs::create_dir_all(&leftover).await.unwrap();
    tokio::fs::write(leftover.join("xz-5.4-1.x86_64.rpm"), b"x")
        .await
        .unwrap();

    let response = svc.server.post("/api/v1/upload/build-repo").await;
    response.assert_status(StatusCode::OK);

    let log = stub_log(
        svc.config
            .paths
            .createrepo_script
            .as_ref()
            .unwrap()
            .parent()
            .unwrap(),
        "createrepo",
    );
    let target = svc.config.paths.repo_dir.join("rpm/fedora/40");
    assert_eq!(stub_calls(&log), vec![format!("{}|", target.display())]);
}
