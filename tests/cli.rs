use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use std::{fs, path::Path};
use tempfile::tempdir;

const PRG: &str = "varcollector";

// --------------------------------------------------
fn make_run_dir(dir: &Path) -> Result<()> {
    let tvc_dir = dir.join("plugin_out").join("variantCaller_out.1");
    let sample_a = tvc_dir.join("IonXpress_001");
    let sample_b = tvc_dir.join("IonXpress_002");
    fs::create_dir_all(&sample_a)?;
    fs::create_dir_all(&sample_b)?;
    fs::write(sample_a.join("alleles.txt"), "a1\na2\na3\n")?;
    fs::write(sample_b.join("alleles.txt"), "b1\nb2\n")?;
    Ok(())
}

// --------------------------------------------------
fn write_script(dir: &Path, name: &str, body: &str) -> Result<String> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path.to_string_lossy().to_string())
}

// --------------------------------------------------
#[test]
fn usage() -> Result<()> {
    for flag in &["-h", "--help"] {
        Command::cargo_bin(PRG)?
            .arg(flag)
            .assert()
            .stdout(predicate::str::contains("Usage"));
    }
    Ok(())
}

// --------------------------------------------------
#[test]
fn dies_without_plugin_dir() -> Result<()> {
    let dir = tempdir()?;
    let run_dir = dir.path().to_string_lossy().to_string();
    Command::cargo_bin(PRG)?
        .args(["--run-dir", &run_dir])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("TVC plugin"));
    Ok(())
}

// --------------------------------------------------
#[test]
fn dies_without_variant_files() -> Result<()> {
    let dir = tempdir()?;
    fs::create_dir_all(dir.path().join("plugin_out").join("variantCaller_out.1"))?;

    let run_dir = dir.path().to_string_lossy().to_string();
    Command::cargo_bin(PRG)?
        .args(["--run-dir", &run_dir])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("no variant files"));
    Ok(())
}

// --------------------------------------------------
#[test]
fn collects_with_r_and_d() -> Result<()> {
    let dir = tempdir()?;
    make_run_dir(dir.path())?;

    let run_dir_name = dir.path().to_string_lossy().to_string();
    Command::cargo_bin(PRG)?
        .args(["--run-dir", &run_dir_name, "-r"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Collected 2 sample file(s)"));

    let run_dir = fs::canonicalize(dir.path())?;
    let run_id = run_dir.file_name().unwrap().to_string_lossy();
    let aggregate = run_dir.join(format!("{run_id}_collected_variants.txt"));
    assert!(aggregate.exists());
    assert_eq!(fs::read_to_string(aggregate)?, "a1\na2\na3\nb1\nb2\n");
    Ok(())
}

// --------------------------------------------------
#[test]
fn runs_checker() -> Result<()> {
    let dir = tempdir()?;
    make_run_dir(dir.path())?;
    let checker = write_script(dir.path(), "checker.sh", "exit 0")?;
    let run_dir = dir.path().to_string_lossy().to_string();

    Command::cargo_bin(PRG)?
        .args([
            "--run-dir",
            &run_dir,
            "--checker",
            &checker,
            "-s",
            "key1",
        ])
        .assert()
        .success();
    Ok(())
}

// --------------------------------------------------
#[test]
fn surfaces_checker_failure() -> Result<()> {
    let dir = tempdir()?;
    make_run_dir(dir.path())?;
    let checker =
        write_script(dir.path(), "checker.sh", "echo bad key >&2\nexit 2")?;
    let run_dir = dir.path().to_string_lossy().to_string();

    Command::cargo_bin(PRG)?
        .args([
            "--run-dir",
            &run_dir,
            "--checker",
            &checker,
        ])
        .assert()
        .failure()
        .code(5)
        .stderr(
            predicate::str::contains("exit code 2")
                .and(predicate::str::contains("bad key")),
        );
    Ok(())
}
