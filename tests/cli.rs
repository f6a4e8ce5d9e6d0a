//! Integration tests for the lembed CLI, run against the mock backend

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};

/// Data directory holding a placeholder model file under `models/`
fn setup() -> TempDir {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("models")).unwrap();
    fs::write(dir.path().join("models/mini.gguf"), b"not really a gguf").unwrap();
    dir
}

fn lembed(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("lembed").unwrap();
    cmd.env_remove("RUST_LOG")
        .arg("--backend")
        .arg("mock")
        .arg("--data-dir")
        .arg(dir);
    cmd
}

fn with_default_model(dir: &Path) -> Command {
    let mut cmd = lembed(dir);
    cmd.arg("--model")
        .arg(format!("default={}", dir.join("models/mini.gguf").display()));
    cmd
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("lembed").unwrap();
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("lembed"));
}

#[test]
fn test_embed_prints_unit_vector() {
    let dir = setup();
    let output = with_default_model(dir.path())
        .arg("embed")
        .arg("hello world")
        .output()
        .unwrap();
    assert!(output.status.success());

    let values: Vec<f32> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(values.len(), 384);
    let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-4);
}

#[test]
fn test_model_resolved_from_data_dir() {
    let dir = setup();
    lembed(dir.path())
        .arg("--model")
        .arg("mini=mini.gguf")
        .arg("embed")
        .arg("--model")
        .arg("mini")
        .arg("hi")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("["));
}

#[test]
fn test_tokenize() {
    let dir = setup();
    with_default_model(dir.path())
        .arg("tokenize")
        .arg("hello world")
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^\[\d+(,\d+)*\]\n$").unwrap());
}

#[test]
fn test_chunks() {
    let dir = setup();
    with_default_model(dir.path())
        .arg("chunks")
        .arg("hello world")
        .arg("--chunk-size")
        .arg("2")
        .assert()
        .success()
        .stdout(predicate::str::contains("0\t"))
        .stdout(predicate::str::contains("\"hello\""))
        .stdout(predicate::str::contains("\" world\""));
}

#[test]
fn test_chunks_rejects_zero_size() {
    let dir = setup();
    with_default_model(dir.path())
        .arg("chunks")
        .arg("hello world")
        .arg("--chunk-size")
        .arg("0")
        .assert()
        .failure()
        .stderr(predicate::str::contains("chunk_size"));
}

#[test]
fn test_models_listing() {
    let dir = setup();
    with_default_model(dir.path())
        .arg("models")
        .assert()
        .success()
        .stdout(predicate::str::contains("default"))
        .stdout(predicate::str::contains("384"));
}

#[test]
fn test_models_empty() {
    let dir = setup();
    lembed(dir.path())
        .arg("models")
        .assert()
        .success()
        .stdout(predicate::str::contains("No models registered"));
}

#[test]
fn test_query() {
    let dir = setup();
    lembed(dir.path())
        .arg("query")
        .arg("SELECT lembed_version()")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("v"));
}

#[test]
fn test_query_sees_registered_models() {
    let dir = setup();
    with_default_model(dir.path())
        .arg("query")
        .arg("SELECT name, length(lembed(name, 'hi')) FROM lembed_models")
        .assert()
        .success()
        .stdout("default\t1536\n");
}

#[test]
fn test_query_persists_to_database_file() {
    let dir = setup();
    let db = dir.path().join("vectors.db");

    with_default_model(dir.path())
        .arg("--db")
        .arg(&db)
        .arg("query")
        .arg("CREATE TABLE docs AS SELECT 'hello' AS body, lembed('hello') AS embedding")
        .assert()
        .success();

    lembed(dir.path())
        .arg("--db")
        .arg(&db)
        .arg("query")
        .arg("SELECT body, length(embedding) FROM docs")
        .assert()
        .success()
        .stdout("hello\t1536\n");
}

#[test]
fn test_bad_model_argument() {
    let dir = setup();
    lembed(dir.path())
        .arg("--model")
        .arg("no-separator")
        .arg("models")
        .assert()
        .failure()
        .stderr(predicate::str::contains("NAME=PATH"));
}

#[test]
fn test_unknown_model() {
    let dir = setup();
    with_default_model(dir.path())
        .arg("embed")
        .arg("--model")
        .arg("missing")
        .arg("hi")
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing"));
}

#[test]
fn test_missing_model_file() {
    let dir = setup();
    lembed(dir.path())
        .arg("--model")
        .arg("default=does-not-exist.gguf")
        .arg("models")
        .assert()
        .failure()
        .stderr(predicate::str::contains("does-not-exist.gguf"));
}
