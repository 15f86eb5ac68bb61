// Each integration test file (`cli_help.rs`, `script_run.rs`, etc.) is compiled
// as its own independent binary crate, each pulling in its own copy of this
// module. Helpers used by some test binaries but not others trigger false
// "dead code" warnings in the binaries that don't call them. Allow dead_code
// to silence these per-binary false positives.
#![allow(dead_code)]

use std::path::PathBuf;
use std::process::{Command, Output};

/// Result of running the bridge-runner binary.
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunResult {
    fn from_output(output: Output) -> Self {
        RunResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        }
    }

    /// Combined stdout + stderr.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Path to the compiled bridge-runner binary (set by Cargo for [[bin]] targets).
pub fn bridge_runner_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_bridge-runner"))
}

/// Path to the testing/echo-service crate's echo.proto, shared by any test
/// that needs a real descriptor source.
pub fn echo_proto() -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("testing")
        .join("echo-service")
        .join("proto")
        .join("echo.proto")
        .to_string_lossy()
        .into_owned()
}

/// Run the bridge-runner binary with the given arguments.
pub fn run(args: &[&str]) -> RunResult {
    let output = Command::new(bridge_runner_bin())
        .args(args)
        .output()
        .expect("failed to execute bridge-runner binary");
    RunResult::from_output(output)
}

// -- Assertion helpers --------------------------------------------------------

/// Assert the exit code matches.
pub fn assert_exit_code(result: &RunResult, expected: i32) {
    assert_eq!(
        result.exit_code, expected,
        "Expected exit code {expected}, got {}.\nstdout: {}\nstderr: {}",
        result.exit_code, result.stdout, result.stderr,
    );
}

/// Assert combined output (stdout+stderr) contains a substring (case-insensitive).
pub fn assert_output_contains(result: &RunResult, needle: &str) {
    let combined = result.combined().to_lowercase();
    assert!(
        combined.contains(&needle.to_lowercase()),
        "Expected output to contain {needle:?} (case-insensitive).\nstdout: {}\nstderr: {}",
        result.stdout,
        result.stderr,
    );
}
