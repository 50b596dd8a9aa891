mod bench;
mod command;
mod document;
mod error;
mod ext;
mod format;
mod logs;
mod mode;
mod report;
mod run;
mod stats;

use std::{
  fs,
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use self::{
  bench::{Bench, Settings},
  command::{Artifact, Backend, CommandTemplate, RunKind},
  document::ResultsDocument,
  logs::{LogKind, RunLogs},
  mode::{ConfigFilter, ConfigMatrix},
  run::ProcessExecutor,
};

/// Builds the server under every configuration of the matrix, runs each one
/// repeatedly and reports startup phase timings against the first one.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
  /// Existing results document to analyze instead of running anything.
  results: Option<PathBuf>,
  /// Runs per configuration that are thrown away.
  #[arg(long, env = "BENCH_WARMUPS", default_value_t = 2)]
  warmups: usize,
  /// Runs per configuration that are measured.
  #[arg(long, env = "BENCH_ITERATIONS", default_value_t = 10)]
  iterations: usize,
  /// Only benchmark the first N selected configurations.
  #[arg(long, env = "BENCH_FIRST_N_CONFIGS")]
  first_n_configs: Option<usize>,
  /// Comma separated patterns; keeps configurations whose name matches any.
  #[arg(long)]
  configs: Option<String>,
  /// Print the build and run commands of the first configuration matching the
  /// pattern, then exit.
  #[arg(long)]
  command_only: Option<String>,
  /// Collect and compare ready-to-run resolution failures instead of timings.
  #[arg(long)]
  resolution_fails: bool,
  /// Add ready-to-run and tiered compilation variants of every configuration.
  #[arg(long)]
  expand_variants: bool,
  #[arg(long, value_enum, default_value_t = Backend::default())]
  backend: Backend,
  /// Build context handed to the build command.
  #[arg(long, default_value = ".")]
  work_dir: PathBuf,
  /// Where documents, reports and logs are written.
  #[arg(long, default_value = ".")]
  output_dir: PathBuf,
  /// Image tag used by `--command-only`.
  #[arg(long, default_value = "testcontainer")]
  image_tag: String,
  #[arg(long, default_value = "SetupJellyfinServer.rb")]
  setup_script: PathBuf,
  /// Kill build and run processes after this many seconds.
  #[arg(long, env = "BENCH_TIMEOUT_SECS")]
  timeout_secs: Option<u64>,
}

impl Args {
  fn run_kind(&self) -> RunKind {
    if self.resolution_fails {
      RunKind::Resolution
    } else {
      RunKind::Benchmark
    }
  }

  /// Resolution runs need the script backend and are ignored otherwise. They
  /// always run once per configuration without warmups.
  fn settings(&self, commands: CommandTemplate) -> Settings {
    let resolution_failures = self.resolution_fails && self.backend == Backend::Script;

    Settings {
      warmups: if resolution_failures { 0 } else { self.warmups },
      iterations: if resolution_failures { 1 } else { self.iterations },
      first_n: self.first_n_configs,
      resolution_failures,
      commands,
    }
  }
}

/// The commands of the first configuration matching `pattern`, in the form a
/// user would paste into a terminal.
fn describe_commands(matrix: &ConfigMatrix, commands: &CommandTemplate, pattern: &str, kind: RunKind) -> Result<String> {
  let mode = matrix.specific(pattern).context("--command-only")?;

  Ok(format!(
    "Configuration Selected:\n{}\n\nBuild Command:\n{}\n\nRun Command:\n{}\n",
    mode.name,
    commands.build(mode, Some(&commands.image_tag)),
    commands.run_in_terminal(mode, &Artifact::Published, kind),
  ))
}

/// `RUST_LOG` style directives, `info` when unset or invalid.
fn log_filter(directives: Option<&str>) -> EnvFilter {
  directives
    .and_then(|directives| EnvFilter::try_new(directives).ok())
    .unwrap_or_else(|| EnvFilter::new("info"))
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref()))
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  if let Some(results) = &args.results {
    if !results.exists() {
      anyhow::bail!("{results:?} does not exist");
    }

    return analyze(results, args.resolution_fails);
  }

  let mut matrix = ConfigMatrix::new(args.expand_variants);
  if let Some(configs) = &args.configs {
    matrix.select_matching(&ConfigFilter::from_csv(configs).context("--configs")?);
  }
  if matrix.is_empty() {
    anyhow::bail!("no configuration selected");
  }
  info!(configs = ?matrix.names().collect::<Vec<_>>(), "selected configurations");

  let commands = CommandTemplate {
    backend: args.backend,
    work_dir: fs::canonicalize(&args.work_dir).with_context(|| format!("canonicalize {:?}", args.work_dir))?,
    image_tag: args.image_tag.clone(),
    setup_script: args.setup_script.clone(),
  };

  if let Some(pattern) = &args.command_only {
    print!("{}", describe_commands(&matrix, &commands, pattern, args.run_kind())?);
    return Ok(());
  }

  if args.resolution_fails && args.backend != Backend::Script {
    warn!("--resolution-fails is only supported by the script backend, ignoring");
  }
  let settings = args.settings(commands);
  let resolution_failures = settings.resolution_failures;

  fs::create_dir_all(&args.output_dir).with_context(|| format!("create {:?}", args.output_dir))?;
  let stamp = chrono::Local::now().format("%m%d-%H%M").to_string();
  let logs = RunLogs::create(&args.output_dir, &stamp).context("RunLogs::create")?;
  info!(
    build = %logs.path(LogKind::Build).display(),
    run = %logs.path(LogKind::Run).display(),
    "logging process output"
  );

  let executor = ProcessExecutor {
    timeout: args.timeout_secs.map(Duration::from_secs),
    echo: true,
  };

  let mut bench = Bench::new(settings, executor, logs);
  let document = bench.bench(&matrix).context("bench")?;
  bench.finish().context("finish")?;

  let prefix = if resolution_failures { "r2rfails" } else { "results" };
  let path = args.output_dir.join(format!("{prefix}-{stamp}.xml"));

  println!("{}", "=".repeat(70));
  println!("{}", document.to_xml()?);
  document.save(&path).context("save results")?;
  info!(path = %path.display(), "wrote results document");

  analyze(&path, resolution_failures)
}

/// Renders the report of a results document, printing it and writing it next
/// to the document.
fn analyze(path: &Path, resolution_failures: bool) -> Result<()> {
  let document = ResultsDocument::load(path)?;

  let report = if resolution_failures {
    format::format_failures(&report::analyze_failures(&document)).context("format")?
  } else {
    let timings = report::analyze_timings(&document).with_context(|| format!("analyze {path:?}"))?;
    format::format_timings(&timings).context("format")?
  };

  print!("{report}");

  let report_path = path.with_extension("txt");
  fs::write(&report_path, &report).with_context(|| format!("write {report_path:?}"))?;

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::BenchError;

  fn parse(args: &[&str]) -> Args {
    Args::try_parse_from(std::iter::once("composite-bench").chain(args.iter().copied())).unwrap()
  }

  fn commands(backend: Backend) -> CommandTemplate {
    CommandTemplate {
      backend,
      work_dir: PathBuf::from("/srv/bench"),
      image_tag: "testcontainer".to_string(),
      setup_script: PathBuf::from("SetupJellyfinServer.rb"),
    }
  }

  #[test]
  fn log_filter_honors_directives() {
    use tracing::level_filters::LevelFilter;

    assert_eq!(log_filter(Some("debug")).max_level_hint(), Some(LevelFilter::DEBUG));
    assert_eq!(log_filter(Some("composite_bench=trace")).max_level_hint(), Some(LevelFilter::TRACE));
    assert_eq!(log_filter(None).max_level_hint(), Some(LevelFilter::INFO));
  }

  #[test]
  fn resolution_runs_are_ignored_with_docker() {
    let args = parse(&["--backend", "docker", "--resolution-fails", "--warmups", "3", "--iterations", "7"]);

    let settings = args.settings(commands(args.backend));

    assert!(!settings.resolution_failures);
    assert_eq!((settings.warmups, settings.iterations), (3, 7));
  }

  #[test]
  fn resolution_runs_with_the_script_run_once() {
    let args = parse(&["--backend", "script", "--resolution-fails", "--warmups", "3", "--iterations", "7"]);

    let settings = args.settings(commands(args.backend));

    assert!(settings.resolution_failures);
    assert_eq!((settings.warmups, settings.iterations), (0, 1));
    assert_eq!(args.run_kind(), RunKind::Resolution);
  }

  #[test]
  fn command_only_prints_terminal_commands() {
    let matrix = ConfigMatrix::new(false);

    let text = describe_commands(&matrix, &commands(Backend::Docker), "^r2r$", RunKind::Benchmark).unwrap();

    assert!(text.starts_with("Configuration Selected:\nr2r\n\nBuild Command:\ndocker build /srv/bench "));
    assert!(text.contains("--build-arg APP_R2R=True"));
    assert!(text.contains(" -t testcontainer\n"));
    assert!(text.ends_with(
      "Run Command:\ndocker run --env COMPlus_ReadyToRun=1 --env COMPlus_TieredCompilation=0 -it testcontainer\n"
    ));
  }

  #[test]
  fn command_only_reports_unknown_configurations() {
    let matrix = ConfigMatrix::new(false);

    let err = describe_commands(&matrix, &commands(Backend::Script), "missing", RunKind::Benchmark).unwrap_err();

    assert!(matches!(
      err.downcast_ref::<BenchError>(),
      Some(BenchError::ConfigNotFound(pattern)) if pattern == "missing"
    ));
  }
}
