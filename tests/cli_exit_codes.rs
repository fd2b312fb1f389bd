use std::fs;
use std::path::Path;
use std::process::{Command, Output};

const MISSING_SAMTOOLS: &str = "missing_samtools_for_exit_code_test";
const MISSING_LONGSHOT: &str = "missing_longshot_for_exit_code_test";

fn run_binary(cwd: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_strainsep"));
    command.args(args).current_dir(cwd).env("RUST_LOG", "error");
    command
        .output()
        .expect("expected strainsep binary to execute")
}

fn write_inputs(dir: &Path) {
    fs::write(dir.join("ref.fasta"), ">ctg1\nACGTACGTAC\n").expect("expected reference fixture");
    fs::write(dir.join("reads.bam"), b"not inspected before tool checks")
        .expect("expected alignment fixture");
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn missing_required_flag_exits_with_argument_error() {
    let dir = tempfile::tempdir().expect("expected temp dir");
    let output = run_binary(dir.path(), &["-b", "reads.bam", "-o", "out"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("--reference"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn unreadable_reference_exits_with_argument_error() {
    let dir = tempfile::tempdir().expect("expected temp dir");
    write_inputs(dir.path());
    let output = run_binary(
        dir.path(),
        &["-r", "absent.fasta", "-b", "reads.bam", "-o", "out"],
    );

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("absent.fasta"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn invalid_quality_exits_with_argument_error() {
    let dir = tempfile::tempdir().expect("expected temp dir");
    write_inputs(dir.path());
    let output = run_binary(
        dir.path(),
        &["-r", "ref.fasta", "-b", "reads.bam", "-o", "out", "-q", "high"],
    );

    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn missing_samtools_exits_with_pipeline_error() {
    let dir = tempfile::tempdir().expect("expected temp dir");
    write_inputs(dir.path());
    let output = run_binary(
        dir.path(),
        &[
            "-r",
            "ref.fasta",
            "-b",
            "reads.bam",
            "-o",
            "out",
            "-s",
            "3",
            "--samtools",
            MISSING_SAMTOOLS,
        ],
    );

    assert_eq!(output.status.code(), Some(2));
    assert!(stderr_of(&output).contains(MISSING_SAMTOOLS));
    assert!(!dir.path().join("out/10-variants/variants.vcf.gz").exists());
    assert!(!dir.path().join("out/.strainsep.lock").exists());
}

#[test]
fn phased_strategy_requires_longshot() {
    let dir = tempfile::tempdir().expect("expected temp dir");
    write_inputs(dir.path());
    let output = run_binary(
        dir.path(),
        &[
            "-r",
            "ref.fasta",
            "-b",
            "reads.bam",
            "-o",
            "out",
            "-s",
            "2",
            "--samtools",
            "true",
            "--longshot",
            MISSING_LONGSHOT,
        ],
    );

    assert_eq!(output.status.code(), Some(2));
    assert!(stderr_of(&output).contains(MISSING_LONGSHOT));
}
