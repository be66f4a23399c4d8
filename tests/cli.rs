//! CLI smoke tests for the `fleetd` binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn fleetd() -> Command {
    Command::cargo_bin("fleetd").unwrap()
}

#[test]
fn help_lists_subcommands() {
    fleetd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("create-admin"));
}

#[test]
fn version_prints() {
    fleetd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("fleetd"));
}

#[test]
fn create_admin_writes_to_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fleet.db");

    fleetd()
        .args([
            "create-admin",
            "--username",
            "ops",
            "--password",
            "ops-pass",
            "--display-name",
            "Operations",
            "--db",
        ])
        .arg(&db_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Created admin 'ops'"));

    // The account is usable for login.
    let db = fleetd::db::FleetDb::new(&db_path).unwrap();
    let (admin, hash) = db.get_admin_credentials("ops").unwrap().unwrap();
    assert_eq!(admin.display_name, "Operations");
    assert!(fleetd::auth::verify_password("ops-pass", &hash));
}

#[test]
fn create_admin_with_duplicate_username_fails() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fleet.db");

    let args = [
        "create-admin",
        "--username",
        "ops",
        "--password",
        "ops-pass",
        "--db",
    ];
    fleetd().args(args).arg(&db_path).assert().success();
    fleetd().args(args).arg(&db_path).assert().failure();
}

#[test]
fn unknown_subcommand_fails() {
    fleetd()
        .arg("frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized"));
}
