use std::{collections::BTreeSet, time::Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::{
  command::{find_image_id, Artifact, Backend, CommandTemplate, RunKind},
  document::{parse_timing_fragment, ResultsDocument, RunRecord, Sample},
  error::BenchError,
  logs::{LogKind, RunLogs},
  mode::{BuildMode, ConfigMatrix},
  run::{capture, execute_logged, Executor, EXPECTED_RUN_EXIT},
};

/// How a benchmark invocation walks the matrix.
#[derive(Clone, Debug)]
pub struct Settings {
  /// Runs per configuration whose output is thrown away.
  pub warmups: usize,
  /// Runs per configuration that are recorded.
  pub iterations: usize,
  /// Only benchmark the first `n` selected configurations.
  pub first_n: Option<usize>,
  /// Collect resolution failures instead of plain timings.
  pub resolution_failures: bool,
  pub commands: CommandTemplate,
}

/// One successful measured run.
struct Measurement {
  samples: Vec<Sample>,
  failures: Vec<String>,
}

/// Builds and runs every configuration of a matrix, one at a time.
pub struct Bench<E> {
  settings: Settings,
  executor: E,
  logs: RunLogs,
}

impl<E: Executor> Bench<E> {
  pub fn new(settings: Settings, executor: E, logs: RunLogs) -> Self {
    Self {
      settings,
      executor,
      logs,
    }
  }

  /// Benchmarks the selected configurations of `matrix`. Configurations that
  /// fail to build are left out of the document.
  pub fn bench(&mut self, matrix: &ConfigMatrix) -> Result<ResultsDocument> {
    let total = matrix.len().min(self.settings.first_n.unwrap_or(usize::MAX));
    let mut document = ResultsDocument::default();

    for (index, mode) in matrix.iter_until(self.settings.first_n) {
      if let Some(record) = self
        .build_and_run(mode, index, total)
        .with_context(|| format!("benchmark {}", mode.name))?
      {
        document.records.push(record);
      }
    }

    Ok(document)
  }

  /// Flushes and closes the logs.
  pub fn finish(self) -> Result<()> {
    self.logs.finish()
  }

  fn build_and_run(&mut self, mode: &BuildMode, index: usize, total: usize) -> Result<Option<RunRecord>> {
    let artifact = match self.build(mode, index, total)? {
      Ok(artifact) => artifact,
      Err(err) => {
        warn!(%err, "skipping configuration");
        return Ok(None);
      }
    };

    let mut record = RunRecord::new(mode.clone());
    if self.settings.resolution_failures {
      record.failures = Some(BTreeSet::new());
    }

    for warmup in 0..self.settings.warmups {
      if let Err(err) = self.run_once(mode, &artifact)? {
        debug!(%err, warmup, "warmup iteration failed");
      }
    }

    for iteration in 0..self.settings.iterations {
      match self.run_once(mode, &artifact)? {
        Ok(measurement) => {
          record.samples.extend(measurement.samples);
          if let Some(failures) = &mut record.failures {
            failures.extend(measurement.failures);
          }
        }
        Err(err) => {
          record.dropped += 1;
          warn!(%err, iteration, "dropping measured iteration");
        }
      }
    }

    info!(
      config = %mode.name,
      samples = record.samples.len(),
      dropped = record.dropped,
      "recorded configuration"
    );

    Ok(Some(record))
  }

  fn build(&mut self, mode: &BuildMode, index: usize, total: usize) -> Result<Result<Artifact, BenchError>> {
    info!("building configuration {} ({} / {total})", mode.name, index + 1);
    let started = Instant::now();

    let invocation = self.settings.commands.build(mode, None);
    let execution = execute_logged(&mut self.executor, &invocation, self.logs.writer(LogKind::Build))?;

    let failed = |reason: String| BenchError::BuildFailed {
      name: mode.name.clone(),
      reason,
    };

    let outcome = match (execution.code, self.settings.commands.backend) {
      (Some(0), Backend::Docker) => find_image_id(&execution.lines)
        .map(Artifact::Image)
        .ok_or_else(|| failed("no image id in build output".to_string())),
      (Some(0), Backend::Script) => Ok(Artifact::Published),
      (Some(code), _) => Err(failed(format!("exit code {code}"))),
      (None, _) => Err(failed("timed out".to_string())),
    };

    info!(
      "done building configuration {} ({} / {total}, {} msecs)",
      mode.name,
      index + 1,
      started.elapsed().as_millis(),
    );

    Ok(outcome)
  }

  fn run_once(&mut self, mode: &BuildMode, artifact: &Artifact) -> Result<Result<Measurement, BenchError>> {
    let kind = if self.settings.resolution_failures {
      RunKind::Resolution
    } else {
      RunKind::Benchmark
    };

    let invocation = self.settings.commands.run(mode, artifact, kind);
    let execution = execute_logged(&mut self.executor, &invocation, self.logs.writer(LogKind::Run))?;

    let dropped = |reason: String| BenchError::RunIterationDropped {
      name: mode.name.clone(),
      reason,
    };

    match execution.code {
      Some(EXPECTED_RUN_EXIT) => {}
      Some(code) => return Ok(Err(dropped(format!("exit code {code}")))),
      None => return Ok(Err(dropped("timed out".to_string()))),
    }

    let captured = capture(&execution.lines);
    let samples = match parse_timing_fragment(&captured.fragment) {
      Ok(samples) if samples.is_empty() => return Ok(Err(dropped("no timing fragment in output".to_string()))),
      Ok(samples) => samples,
      Err(err) => return Ok(Err(dropped(err.to_string()))),
    };

    Ok(Ok(Measurement {
      samples,
      failures: captured.failures,
    }))
  }
}
