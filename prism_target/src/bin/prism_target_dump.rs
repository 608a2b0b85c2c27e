//! Generate the runtime stubs for a platform and print them.
//!
//! ```text
//! prism-target-dump [--verbose] [--bytes] [--trampolines N] [NAME-FILTER]
//! ```
//!
//! Stubs are generated into a non-executable code cache, so any host can
//! inspect AMD64 output.

use std::process::ExitCode;
use std::sync::Arc;

use prism_target::{
    CodegenResult, CompileContext, CompileError, MethodRef, Nature, RuntimeCompiler, TargetConfig,
    TargetRuntime,
};
use tracing_subscriber::EnvFilter;

// =============================================================================
// Arguments
// =============================================================================

#[derive(Debug, Default)]
struct DumpArgs {
    verbose: bool,
    bytes: bool,
    trampolines: usize,
    filter: Option<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<DumpArgs, String> {
    let mut parsed = DumpArgs::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-v" | "--verbose" => parsed.verbose = true,
            "-x" | "--bytes" => parsed.bytes = true,
            "-t" | "--trampolines" => {
                let value = args.next().ok_or("--trampolines needs a count")?;
                parsed.trampolines = value
                    .parse()
                    .map_err(|_| format!("invalid trampoline count: {value}"))?;
            }
            "-h" | "--help" => return Err(String::new()),
            flag if flag.starts_with('-') => return Err(format!("unknown option: {flag}")),
            name => parsed.filter = Some(name.to_string()),
        }
    }
    Ok(parsed)
}

const USAGE: &str = "usage: prism-target-dump [--verbose] [--bytes] [--trampolines N] [NAME-FILTER]";

// =============================================================================
// Main
// =============================================================================

/// Stand-in for a real backend; nothing is compiled while dumping stubs.
struct NoCompiler;

impl RuntimeCompiler for NoCompiler {
    fn name(&self) -> &str {
        "none"
    }

    fn nature(&self) -> Nature {
        Nature::Opt
    }

    fn compile(
        &self,
        _rt: &TargetRuntime,
        method: &MethodRef,
        _for_deopt: bool,
        _ctx: &mut CompileContext,
    ) -> Result<CodegenResult, CompileError> {
        Err(CompileError::new(format!("no compiler available for {}", method.qualified_name())))
    }
}

fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            if !message.is_empty() {
                eprintln!("{message}");
            }
            eprintln!("{USAGE}");
            return if message.is_empty() { ExitCode::SUCCESS } else { ExitCode::FAILURE };
        }
    };

    let default_level = if args.verbose { "prism_target=debug" } else { "prism_target=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let config = TargetConfig {
        executable_code: false,
        ..TargetConfig::for_testing()
    };
    let rt = match TargetRuntime::new(config, Arc::new(NoCompiler), None) {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    for index in 0..args.trampolines {
        if let Err(err) = rt
            .stubs()
            .virtual_trampoline(&rt, index)
            .and_then(|_| rt.stubs().interface_trampoline(&rt, index))
        {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    }

    println!("platform {}", rt.platform());
    let mut methods = rt.code_cache().methods();
    methods.sort_by_key(|tm| tm.code_start());
    for tm in methods {
        if let Some(filter) = &args.filter {
            if !tm.name().contains(filter.as_str()) {
                continue;
            }
        }
        println!(
            "{:#014x} {:>5} bytes  frame {:>4}  {}",
            tm.code_start(),
            tm.code_len(),
            tm.frame_size(),
            tm.name()
        );
        for (pos, cause, attrs) in tm.safepoints().iter() {
            println!("    safepoint {pos:>4} cause {cause:>4} attrs {attrs:#010x}");
        }
        if args.bytes {
            for (i, line) in tm.copy_code().chunks(16).enumerate() {
                let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
                println!("    {:04x}: {}", i * 16, hex.join(" "));
            }
        }
    }
    ExitCode::SUCCESS
}
