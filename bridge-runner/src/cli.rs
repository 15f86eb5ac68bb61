use std::path::PathBuf;

use clap::Parser;

/// Loads a `.js` script and drives it to completion against an in-process
/// gRPC bridge.
///
/// The script runs with the `grpc` global installed (§6 "JS Surface"):
/// `grpc.createClient`/`grpc.createServer` share one in-process `Transport`,
/// and any message/service types the script names are resolved against the
/// proto sources given via `--proto`/`--protoset`. There is no "address" to
/// dial -- this bridge's transport is in-process only (no cross-host
/// networking, per spec Non-goals); `--proto`/`--protoset` are how a
/// script's message and service types get descriptors.
#[derive(Parser, Debug)]
#[command(name = "bridge-runner", version)]
pub struct Cli {
    /// The JavaScript file to run.
    pub script: PathBuf,

    /// The name of a proto source file. May specify more than one via
    /// multiple --proto flags. It is an error to use both --protoset and
    /// --proto flags.
    #[arg(long, value_name = "FILE")]
    pub proto: Vec<String>,

    /// A directory from which proto sources can be imported. Multiple
    /// import paths can be configured by specifying multiple flags. Only
    /// used alongside --proto.
    #[arg(long, value_name = "DIR")]
    pub import_path: Vec<String>,

    /// The name of a file containing an encoded FileDescriptorSet. May
    /// specify more than one via multiple --protoset flags. It is an error
    /// to use both --protoset and --proto flags.
    #[arg(long, value_name = "FILE")]
    pub protoset: Vec<String>,

    /// Enable verbose (debug-level) logging.
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Enable very verbose (trace-level) logging.
    #[arg(long = "vv")]
    pub very_verbose: bool,

    /// Keep the process running (waiting for Ctrl-C) after the script's
    /// top-level body finishes. Needed for scripts that call
    /// `grpc.createServer().start()` and then return, since their handlers
    /// keep running on the loop thread after `run_file` returns. Scripts
    /// that only invoke calls and exit don't need this.
    #[arg(long)]
    pub serve: bool,
}

impl Cli {
    /// The `tracing_subscriber::EnvFilter` directive implied by `-v`/`--vv`,
    /// overridden by `RUST_LOG` when set (mirroring the teacher's
    /// `verbosity()` but feeding a log level instead of a print threshold).
    pub fn log_directive(&self) -> &'static str {
        if self.very_verbose {
            "trace"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

/// The resolved proto-source configuration, after validation.
#[derive(Debug)]
pub enum ProtoSource {
    /// No --proto/--protoset given: the script gets an empty registry, for
    /// scripts that only exercise `grpc.status`/`grpc.metadata`.
    Empty,
    Protoset(Vec<String>),
    Proto { files: Vec<String>, import_paths: Vec<String> },
}
