use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

fn vmdrive() -> assert_cmd::Command {
    cargo_bin_cmd!("vmdrive").into()
}

/// Config pointing at an empty VM dir with the REST session disabled.
fn write_test_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let vms = dir.path().join("vms");
    std::fs::create_dir_all(&vms).unwrap();
    let config_path = dir.path().join("vmdrive.toml");
    let mut f = std::fs::File::create(&config_path).unwrap();
    write!(
        f,
        r#"
vm_dir = "{}"

[vmrun]
path = "/nonexistent/vmrun"

[run]
num_tries = 2
sleep_s = 0
"#,
        vms.display()
    )
    .unwrap();
    config_path
}

#[test]
fn help_works() {
    vmdrive()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Run programs and packages"))
        .stdout(predicate::str::contains("run-package"));
}

#[test]
fn missing_explicit_config_fails() {
    vmdrive()
        .args(["--config", "/nonexistent/vmdrive.toml", "vms"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn validation_rejects_zero_tries() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("vmdrive.toml");
    std::fs::write(&config_path, "[run]\nnum_tries = 0\n").unwrap();

    vmdrive()
        .args(["--config", config_path.to_str().unwrap(), "vms"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("num_tries"));
}

#[test]
fn unknown_routing_backend_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("vmdrive.toml");
    std::fs::write(&config_path, "[routing]\npower = \"carrier-pigeon\"\n").unwrap();

    vmdrive()
        .args(["--config", config_path.to_str().unwrap(), "vms"])
        .assert()
        .failure();
}

#[test]
fn vms_lists_local_inventory() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);
    let bundle = dir.path().join("vms/alpha");
    std::fs::create_dir_all(&bundle).unwrap();
    std::fs::write(bundle.join("alpha.vmx"), "displayName = \"Alpha\"\n").unwrap();

    vmdrive()
        .args(["--config", config_path.to_str().unwrap(), "vms"])
        .assert()
        .success()
        .stdout(predicate::str::contains("alpha"));
}

#[test]
fn run_package_with_missing_dir_is_invalid_argument() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    vmdrive()
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "run-package",
            "alpha",
            "/nonexistent/workload",
            "run.sh",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid argument"));
}

#[test]
fn unknown_guest_falls_through_to_vmrun() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    vmdrive()
        .args(["--config", config_path.to_str().unwrap(), "mac", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("/nonexistent/vmrun"));
}
