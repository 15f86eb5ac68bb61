use crate::cli::{Cli, ProtoSource};

/// Validate CLI flags before doing any work, matching the teacher's
/// `validate.rs` pattern: hard errors return `Err(message)`, warnings are
/// printed to stderr but do not prevent execution.
pub fn validate(cli: &Cli) -> Result<ProtoSource, String> {
    // Script must exist and look like a JS file; a typo here should not
    // surface as an opaque engine error later.
    if !cli.script.exists() {
        return Err(format!("script file not found: {}", cli.script.display()));
    }
    if cli.script.extension().and_then(|e| e.to_str()) != Some("js") {
        warn(&format!(
            "script file {} does not have a .js extension",
            cli.script.display()
        ));
    }

    // --protoset and --proto are mutually exclusive.
    if !cli.protoset.is_empty() && !cli.proto.is_empty() {
        return Err("Use either --protoset files or --proto files, but not both.".into());
    }

    // --import-path without --proto is unused.
    if !cli.import_path.is_empty() && cli.proto.is_empty() {
        warn("The --import-path argument is not used unless --proto files are used.");
    }

    if !cli.protoset.is_empty() {
        Ok(ProtoSource::Protoset(cli.protoset.clone()))
    } else if !cli.proto.is_empty() {
        Ok(ProtoSource::Proto { files: cli.proto.clone(), import_paths: cli.import_path.clone() })
    } else {
        Ok(ProtoSource::Empty)
    }
}

fn warn(msg: &str) {
    eprintln!("Warning: {msg}");
}
