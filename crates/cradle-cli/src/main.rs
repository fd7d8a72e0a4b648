mod commands;

use clap::{Parser, Subcommand};
use commands::assemble::AssembleOptions;
use commands::{EXIT_FAILURE, EXIT_SUCCESS};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "cradle",
    version,
    about = "Assembles a container filesystem blending a pinned runtime with host graphics drivers"
)]
struct Cli {
    /// Output the construction plan as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Prepare a container: copy the runtime, capture host drivers, and
    /// emit the construction plan for the sandbox launcher.
    Assemble {
        /// Path to the runtime tree (plain, Flatpak-style, or
        /// manifest-described).
        runtime: PathBuf,
        /// Directory holding mutable runtime copies, shared between
        /// invocations.
        #[arg(long)]
        variable_dir: PathBuf,
        /// Root of the graphics provider in the current namespace.
        #[arg(long, default_value = "/")]
        provider: PathBuf,
        /// Where the provider tree is visible in the host namespace.
        #[arg(long, default_value = "/")]
        provider_in_host_ns: PathBuf,
        /// Mount point of the provider inside the container.
        #[arg(long, default_value = "/run/gfx")]
        graphics_mount: PathBuf,
        /// Directory containing the per-architecture capture tools.
        #[arg(long, default_value = "/usr/libexec/cradle")]
        capture_tool_dir: PathBuf,
        /// ABI manifest describing the runtime's library families.
        #[arg(long)]
        abi_manifest: Option<PathBuf>,
        /// Secondary root prefix for CPU emulation; realizations fan out
        /// into it as well.
        #[arg(long)]
        interpreter_root: Option<PathBuf>,
        /// Run enumeration inline instead of in background tasks.
        #[arg(long, default_value_t = false)]
        single_thread: bool,
        /// Protect the mutable copy from garbage collection.
        #[arg(long, default_value_t = false)]
        keep_copy: bool,
        /// Use the runtime tree in place instead of copying it;
        /// filesystem edits are emitted as launcher operations.
        #[arg(long, default_value_t = false)]
        no_copy: bool,
        /// Write the plan to a file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Delete unused mutable runtime copies from the variable directory.
    Gc {
        /// The variable directory to collect.
        variable_dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CRADLE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    let code = match cli.command {
        Commands::Assemble {
            runtime,
            variable_dir,
            provider,
            provider_in_host_ns,
            graphics_mount,
            capture_tool_dir,
            abi_manifest,
            interpreter_root,
            single_thread,
            keep_copy,
            no_copy,
            output,
        } => {
            let options = AssembleOptions {
                runtime,
                variable_dir,
                provider,
                provider_in_host_ns,
                graphics_mount,
                capture_tool_dir,
                abi_manifest,
                interpreter_root,
                single_thread,
                keep_copy,
                copy_runtime: !no_copy,
            };
            commands::assemble::run(&options, cli.json, output.as_deref())
        }
        Commands::Gc { variable_dir } => commands::gc::run(&variable_dir, cli.json),
    };

    match code {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            eprintln!("cradle: {e}");
            ExitCode::from(commands::exit_code_for(&e).unwrap_or(EXIT_FAILURE))
        }
    }
}
