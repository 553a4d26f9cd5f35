#![forbid(unsafe_code)]

use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, NamedSource};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ctu::{CompileOptions, Diagnostic, SourceUnit, config};

#[derive(Parser, Debug)]
#[command(name = "ctu", version, about = "Compile ctu units to portable C")]
struct Cli {
    /// Log pipeline stages (overridden by `RUST_LOG`).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// Read options from this file instead of the nearest `ctu.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Compile each input to a `.c` file.
    Build {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output directory; defaults to next to each input.
        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        /// Precede each function with a `#line` directive.
        #[arg(long, default_value_t = false)]
        line_directives: bool,

        /// Start each file with a generated-by comment.
        #[arg(long, default_value_t = false)]
        banner: bool,
    },
    /// Run the pipeline and report diagnostics without writing output.
    Check {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.cmd {
        Cmd::Build {
            inputs,
            out_dir,
            line_directives,
            banner,
        } => {
            let mut options = resolve_options(cli.config.as_deref(), &inputs[0])?;
            options.emit.line_directives |= line_directives;
            options.emit.banner |= banner;
            run(&inputs, &options, Some(out_dir.as_deref()))
        }
        Cmd::Check { inputs } => {
            let options = resolve_options(cli.config.as_deref(), &inputs[0])?;
            run(&inputs, &options, None)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "ctu=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn resolve_options(explicit: Option<&Path>, first_input: &Path) -> miette::Result<CompileOptions> {
    if let Some(path) = explicit {
        return Ok(config::load_config(path)?);
    }
    let (options, path) = config::resolve_config(first_input)?;
    if let Some(path) = path {
        info!(config = %display_path(&path), "using config");
    }
    Ok(options)
}

/// Compiles every input; `out` is `None` for a check-only run.
fn run(inputs: &[PathBuf], options: &CompileOptions, out: Option<Option<&Path>>) -> miette::Result<()> {
    let mut units = Vec::with_capacity(inputs.len());
    for path in inputs {
        let source = fs::read_to_string(path).into_diagnostic()?;
        units.push(SourceUnit::new(display_path(path), source));
    }

    let results = ctu::compile_units(&units, options);

    let mut failed = 0usize;
    for ((path, unit), (_, result)) in inputs.iter().zip(&units).zip(results) {
        let source = NamedSource::new(display_path(path), unit.source.clone());
        match result {
            Ok(compiled) => {
                report(&compiled.warnings, &source);
                if let Some(out_dir) = out {
                    let target = output_path(path, out_dir);
                    if let Some(dir) = target.parent().filter(|d| !d.as_os_str().is_empty()) {
                        fs::create_dir_all(dir).into_diagnostic()?;
                    }
                    fs::write(&target, compiled.c_source).into_diagnostic()?;
                    info!(output = %display_path(&target), "wrote");
                }
            }
            Err(diagnostics) => {
                report(&diagnostics, &source);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(miette::miette!("{failed} of {} unit(s) failed to compile", inputs.len()));
    }
    Ok(())
}

fn report(diagnostics: &[Diagnostic], source: &NamedSource<String>) {
    for d in diagnostics {
        let report = miette::Report::new(d.clone()).with_source_code(source.clone());
        eprintln!("{report:?}");
    }
}

fn output_path(input: &Path, out_dir: Option<&Path>) -> PathBuf {
    let file = input.with_extension("c");
    match (out_dir, file.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => file,
    }
}

fn display_path(p: &Path) -> String {
    p.to_string_lossy().to_string()
}
