//! The `aurora` command-line driver.
//!
//! `aurora compile foo.aur -o foo.aurs` emits the MISA manifest;
//! `aurora native foo.aur -o foo` runs the full pipeline down to a
//! native executable. All diagnostics go to stderr and any failure
//! exits nonzero.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};

use aurora_native::{NativeCompiler, Target};

#[derive(Parser)]
#[command(name = "aurora", version, about = "Aurora compiler")]
struct Cli {
    /// Verbosity: 0 errors, 1 info, 2 debug, 3 trace.
    #[arg(long, global = true, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    debug: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a source file to its MISA manifest.
    Compile {
        /// Input `.aur` source file.
        input: PathBuf,
        /// Output manifest path (defaults to the input with `.aurs`).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Compile a source file all the way to a native executable.
    Native {
        /// Input `.aur` source file.
        input: PathBuf,
        /// Output executable path.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Executable format (defaults to the host).
        #[arg(long, value_enum)]
        target: Option<TargetArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TargetArg {
    Windows,
    Linux,
}

impl From<TargetArg> for Target {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Windows => Target::Windows,
            TargetArg::Linux => Target::Linux,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(debug: u8) {
    let filter = match debug {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Compile { input, output } => {
            let manifest = frontend(&input)?;
            let text = manifest
                .serialize()
                .context("serializing the manifest")?;
            let output = output.unwrap_or_else(|| input.with_extension("aurs"));
            std::fs::write(&output, text)
                .with_context(|| format!("writing {}", output.display()))?;
            Ok(())
        }
        Command::Native {
            input,
            output,
            target,
        } => {
            let target = target.map(Target::from).unwrap_or_else(Target::host);
            let manifest = frontend(&input)?;
            // The textual manifest is the canonical artifact; the native
            // driver always consumes the re-parsed form.
            let text = manifest
                .serialize()
                .context("serializing the manifest")?;
            let image = NativeCompiler::new(target)
                .compile_text(&text)
                .context("encoding the executable")?;
            let output =
                output.unwrap_or_else(|| input.with_extension(target.extension()));
            std::fs::write(&output, image)
                .with_context(|| format!("writing {}", output.display()))?;
            mark_executable(&output)?;
            Ok(())
        }
    }
}

fn frontend(input: &Path) -> anyhow::Result<aurora_asm::Manifest> {
    let source = std::fs::read_to_string(input)
        .with_context(|| format!("reading {}", input.display()))?;
    aurora_compiler::compile(&source)
        .with_context(|| format!("compiling {}", input.display()))
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}
