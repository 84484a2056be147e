// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 The spb-curate Authors.

use assert_cmd::Command;
use predicates::prelude::*;

/// A command isolated from the caller's credentials and ~/.spb/config.
fn spb_curate(home: &tempfile::TempDir) -> Result<Command, Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("spb-curate")?;
    cmd.env("HOME", home.path())
        .env("RUST_LOG", "error")
        .env_remove("SPB_ACCESS_KEY")
        .env_remove("SPB_TEAM_NAME")
        .env_remove("SPB_PROFILE")
        .env_remove("SPB_API_BASE");
    Ok(cmd)
}

#[test]
fn test_version() -> Result<(), Box<dyn std::error::Error>> {
    let home = tempfile::tempdir()?;
    spb_curate(&home)?
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    Ok(())
}

#[test]
fn test_help_lists_commands() -> Result<(), Box<dyn std::error::Error>> {
    let home = tempfile::tempdir()?;
    spb_curate(&home)?
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("upload-images")
                .and(predicate::str::contains("wait-job"))
                .and(predicate::str::contains("create-slice"))
                .and(predicate::str::contains("slice-images"))
                .and(predicate::str::contains("--access-key")),
        );
    Ok(())
}

#[test]
fn test_missing_credentials() -> Result<(), Box<dyn std::error::Error>> {
    let home = tempfile::tempdir()?;
    spb_curate(&home)?
        .args(["job", "job-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("MissingCredentials"));
    Ok(())
}

#[test]
fn test_upload_empty_directory() -> Result<(), Box<dyn std::error::Error>> {
    let home = tempfile::tempdir()?;
    let images = tempfile::tempdir()?;
    std::fs::write(images.path().join("notes.txt"), "not an image")?;

    spb_curate(&home)?
        .args(["--access-key", "key", "--team-name", "team"])
        .arg("upload-images")
        .arg("b1a1d7c0-0000-4000-8000-000000000001")
        .arg(images.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("no image files"));
    Ok(())
}

#[test]
fn test_invalid_from_date() -> Result<(), Box<dyn std::error::Error>> {
    let home = tempfile::tempdir()?;
    spb_curate(&home)?
        .args(["jobs", "--from-date", "yesterday"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--from-date"));
    Ok(())
}

#[test]
fn test_slice_images_needs_selection() -> Result<(), Box<dyn std::error::Error>> {
    let home = tempfile::tempdir()?;
    spb_curate(&home)?
        .args(["slice-images", "ds-1", "slice-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--keys"));
    Ok(())
}
