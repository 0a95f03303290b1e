use assert_cmd::cargo::cargo_bin_cmd;
use pdf_engine::fixtures::{OutlineNode, PdfFixture};
use predicates::prelude::*;
use serde_json::Value;
use std::path::{Path, PathBuf};

fn write_fixture(dir: &Path, name: &str, fixture: PdfFixture) -> PathBuf {
    let path = dir.join(name);
    fixture.write_to(&path).expect("fixture should be written");
    path
}

fn report() -> PdfFixture {
    PdfFixture::new()
        .page(200.0, 100.0)
        .page(300.0, 150.0)
        .page(400.0, 200.0)
        .info("Title", "Quarterly Report")
        .info("Author", "Finance")
        .outline(OutlineNode::new("Intro").page(0).child(OutlineNode::new("Details").page(1)))
        .outline(OutlineNode::new("Appendix").page(2))
}

#[test]
fn info_emits_stable_json_contract() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let file = write_fixture(temp.path(), "report.pdf", report());

    let output = cargo_bin_cmd!("leafpress")
        .arg("info")
        .arg(&file)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let mut value: Value =
        serde_json::from_slice(&output).expect("stdout should contain valid json");
    value["path"] = Value::String("<FIXTURE>".to_owned());

    insta::assert_json_snapshot!("cli_info_report_pdf", value);
}

#[test]
fn info_fails_for_missing_file() {
    let temp = tempfile::tempdir().expect("temp dir should be created");

    cargo_bin_cmd!("leafpress")
        .arg("info")
        .arg(temp.path().join("missing.pdf"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("file does not exist"));
}

#[test]
fn info_fails_for_invalid_pdf() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let file = temp.path().join("invalid.pdf");
    std::fs::write(&file, b"%PDF-1.4\nthis is not a pdf").expect("write invalid file");

    cargo_bin_cmd!("leafpress")
        .arg("info")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to open PDF"));
}

#[test]
fn failed_command_still_shuts_the_engine_down() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let file = temp.path().join("invalid.pdf");
    std::fs::write(&file, b"%PDF-1.4\nthis is not a pdf").expect("write invalid file");

    cargo_bin_cmd!("leafpress")
        .env("RUST_LOG", "pdf_engine=debug")
        .arg("info")
        .arg(&file)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("shutting down lopdf engine"));
}

#[test]
fn toc_prints_nested_outline() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let file = write_fixture(temp.path(), "report.pdf", report());

    cargo_bin_cmd!("leafpress")
        .arg("toc")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("[+1] Intro -> 1  # XYZ [0, 842, 0]"))
        .stdout(predicate::str::contains("    [*] Details -> 2  # XYZ [0, 842, 0]"))
        .stdout(predicate::str::contains("[*] Appendix -> 3"));

    cargo_bin_cmd!("leafpress")
        .args(["toc", "--max-depth", "1"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("Details").not());
}

#[test]
fn render_writes_one_file_per_page_with_worker_processes() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let file = write_fixture(temp.path(), "report.pdf", report());
    let out = temp.path().join("pages");

    cargo_bin_cmd!("leafpress")
        .arg("render")
        .arg(&file)
        .arg("--output")
        .arg(&out)
        .args(["--format", "png", "--pages", "1,3", "--processes", "2", "--scale", "0.5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("report_1.png"))
        .stdout(predicate::str::contains("report_3.png"));

    let first = image::open(out.join("report_1.png")).expect("page 1 should be readable");
    assert_eq!((first.width(), first.height()), (100, 50));
    let third = image::open(out.join("report_3.png")).expect("page 3 should be readable");
    assert_eq!((third.width(), third.height()), (200, 100));
    assert!(!out.join("report_2.png").exists());
}

#[test]
fn linear_render_accepts_reversed_ranges() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let file = write_fixture(temp.path(), "report.pdf", report());
    let out = temp.path().join("jpg");

    cargo_bin_cmd!("leafpress")
        .arg("render")
        .arg(&file)
        .arg("-o")
        .arg(&out)
        .args(["--pages", "3-1", "--linear", "--prefix", "p", "--rotation", "90"])
        .assert()
        .success();

    for n in 1..=3 {
        assert!(out.join(format!("p{n}.jpg")).exists(), "page {n} should be rendered");
    }
    let rotated = image::open(out.join("p1.jpg")).expect("page 1 should be readable");
    assert_eq!((rotated.width(), rotated.height()), (100, 200));
}

#[test]
fn render_rejects_duplicate_pages() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let file = write_fixture(temp.path(), "report.pdf", report());

    cargo_bin_cmd!("leafpress")
        .arg("render")
        .arg(&file)
        .arg("-o")
        .arg(temp.path())
        .args(["--pages", "1-2,2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("listed more than once"));
}

#[test]
fn render_rejects_out_of_range_pages() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let file = write_fixture(temp.path(), "report.pdf", report());

    cargo_bin_cmd!("leafpress")
        .arg("render")
        .arg(&file)
        .arg("-o")
        .arg(temp.path())
        .args(["--pages", "9"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("out of range"));
}

#[test]
fn version_prints_package_version() {
    cargo_bin_cmd!("leafpress")
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}
