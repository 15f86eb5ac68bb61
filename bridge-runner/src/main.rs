mod cli;
mod validate;

use std::path::Path;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use bridge_core::descriptor::{DescriptorPoolRegistry, ProtoRegistry};
use bridge_core::transport::InProcessTransport;
use bridge_quickjs::Engine;

use cli::{Cli, ProtoSource};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let proto_source = match validate::validate(&cli) {
        Ok(source) => source,
        Err(msg) => {
            eprintln!("{msg}");
            eprintln!("Try 'bridge-runner --help' for more details.");
            process::exit(2);
        }
    };

    init_logging(&cli);

    let registry: Arc<dyn ProtoRegistry> = match build_registry(proto_source) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Failed to build descriptor registry: {e}");
            process::exit(1);
        }
    };

    let transport = Arc::new(InProcessTransport::new());

    let engine = match Engine::new(transport, registry) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Failed to start script engine: {e}");
            process::exit(1);
        }
    };

    let script_path = cli.script.to_string_lossy().into_owned();
    tracing::info!(script = %script_path, "running script");

    if let Err(e) = engine.run_file(&script_path) {
        eprintln!("Error running script \"{script_path}\": {e}");
        process::exit(1);
    }

    // The script's top-level body has finished. With --serve, it may have
    // started a server (grpc.createServer().start()) whose handlers keep
    // running on the loop thread; wait for Ctrl-C instead of tearing the
    // loop down immediately. Without --serve, a script that only invokes
    // calls and returns is done.
    if cli.serve {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
        }
    }
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_registry(source: ProtoSource) -> bridge_core::error::Result<Arc<dyn ProtoRegistry>> {
    match source {
        ProtoSource::Empty => {
            let fds = prost_types::FileDescriptorSet { file: vec![] };
            Ok(Arc::new(DescriptorPoolRegistry::from_file_descriptor_set(fds)?))
        }
        ProtoSource::Protoset(paths) => Ok(Arc::new(DescriptorPoolRegistry::from_protoset_files(&paths)?)),
        ProtoSource::Proto { files, import_paths } => {
            let import_paths: Vec<&Path> = if import_paths.is_empty() {
                vec![Path::new(".")]
            } else {
                import_paths.iter().map(Path::new).collect()
            };
            let file_paths: Vec<&Path> = files.iter().map(Path::new).collect();
            let fds = protox::compile(file_paths, import_paths).map_err(|e| {
                bridge_core::error::BridgeError::Other(format!("failed to compile proto sources: {e}").into())
            })?;
            Ok(Arc::new(DescriptorPoolRegistry::from_file_descriptor_set(fds)?))
        }
    }
}
