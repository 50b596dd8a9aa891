use std::collections::BTreeSet;

use crate::{
  document::{ResultsDocument, RunRecord},
  error::BenchError,
  mode::BuildMode,
  stats::{Phase, PhaseStatistics},
};

/// Phase statistics of one configuration, rebuilt from its samples.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigTimings {
  pub mode: BuildMode,
  /// One entry per phase, in order of first appearance.
  pub phases: Vec<(Phase, PhaseStatistics)>,
  pub dropped: u32,
}

/// Average costs of one configuration. `apphost`, `webhost` and `app` are
/// the increments over the previous phase, not cumulative times.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deltas {
  pub total: i64,
  pub runtime: i64,
  pub apphost: i64,
  pub webhost: i64,
  pub app: i64,
}

impl ConfigTimings {
  pub fn from_record(record: &RunRecord) -> Result<Self, BenchError> {
    let mut phases: Vec<(Phase, PhaseStatistics)> = Vec::new();

    for sample in &record.samples {
      let phase: Phase = sample.phase.parse()?;
      let index = match phases.iter().position(|(seen, _)| *seen == phase) {
        Some(index) => index,
        None => {
          phases.push((phase, PhaseStatistics::default()));
          phases.len() - 1
        }
      };

      phases[index].1.add(
        sample.total_ms.trunc() as i64,
        sample.user_ms.trunc() as i64,
        sample.system_ms.trunc() as i64,
      );
    }

    Ok(Self {
      mode: record.mode.clone(),
      phases,
      dropped: record.dropped,
    })
  }

  /// Statistics of `phase`, empty if it was never reported.
  pub fn phase(&self, phase: Phase) -> PhaseStatistics {
    self
      .phases
      .iter()
      .find(|(seen, _)| *seen == phase)
      .map(|(_, stats)| *stats)
      .unwrap_or_default()
  }

  pub fn deltas(&self) -> Deltas {
    let average = |phase| self.phase(phase).total.average();

    let runtime = average(Phase::Runtime);
    let apphost_init = average(Phase::AppHostInit);
    let webhost_start = average(Phase::WebHostStartAsync);
    let app = average(Phase::App);

    Deltas {
      total: app,
      runtime,
      apphost: apphost_init.saturating_sub(runtime),
      webhost: webhost_start.saturating_sub(apphost_init),
      app: app.saturating_sub(webhost_start),
    }
  }
}

/// Rebuilds the phase statistics of every configuration in `document`.
pub fn analyze_timings(document: &ResultsDocument) -> Result<Vec<ConfigTimings>, BenchError> {
  document.records.iter().map(ConfigTimings::from_record).collect()
}

/// The distinct resolution failures of one configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigFailures {
  pub mode: BuildMode,
  pub failures: BTreeSet<String>,
}

/// How a failure set differs from the baseline's, both sides sorted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FailureDiff<'a> {
  /// Failing here but not in the baseline.
  pub introduced: Vec<&'a str>,
  /// Failing in the baseline but not here.
  pub fixed: Vec<&'a str>,
}

impl ConfigFailures {
  pub fn diff<'a>(&'a self, baseline: &'a BTreeSet<String>) -> FailureDiff<'a> {
    FailureDiff {
      introduced: self.failures.difference(baseline).map(String::as_str).collect(),
      fixed: baseline.difference(&self.failures).map(String::as_str).collect(),
    }
  }
}

pub fn analyze_failures(document: &ResultsDocument) -> Vec<ConfigFailures> {
  document
    .records
    .iter()
    .map(|record| ConfigFailures {
      mode: record.mode.clone(),
      failures: record.failures.clone().unwrap_or_default(),
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::document::Sample;

  fn record(samples: &[(&str, f64)]) -> RunRecord {
    RunRecord {
      samples: samples
        .iter()
        .map(|&(phase, total_ms)| Sample {
          phase: phase.to_string(),
          total_ms,
          user_ms: total_ms / 2.0,
          system_ms: 1.9,
        })
        .collect(),
      ..RunRecord::new(BuildMode {
        name: "baseline".to_string(),
        ..BuildMode::default()
      })
    }
  }

  #[test]
  fn phases_keep_first_appearance_order() {
    let timings = ConfigTimings::from_record(&record(&[
      ("APP", 300.0),
      ("RUNTIME", 50.0),
      ("APP", 310.0),
      ("RUNTIME", 54.0),
    ]))
    .unwrap();

    let order: Vec<Phase> = timings.phases.iter().map(|(phase, _)| *phase).collect();
    assert_eq!(order, [Phase::App, Phase::Runtime]);
    assert_eq!(timings.phase(Phase::App).total.count(), 2);
    assert_eq!(timings.phase(Phase::Runtime).total.average(), 52);
    assert_eq!(timings.phase(Phase::AppHostInit).total.count(), 0);
  }

  #[test]
  fn sample_values_are_truncated() {
    let timings = ConfigTimings::from_record(&record(&[("APP", 99.99)])).unwrap();
    let app = timings.phase(Phase::App);

    assert_eq!(app.total.average(), 99);
    assert_eq!(app.user.average(), 49);
    assert_eq!(app.system.average(), 1);
  }

  #[test]
  fn deltas_are_incremental() {
    let timings = ConfigTimings::from_record(&record(&[
      ("RUNTIME", 50.0),
      ("APPHOST-INIT", 120.0),
      ("WEBHOST-START-ASYNC", 400.0),
      ("APP", 420.0),
    ]))
    .unwrap();

    assert_eq!(
      timings.deltas(),
      Deltas {
        total: 420,
        runtime: 50,
        apphost: 70,
        webhost: 280,
        app: 20,
      }
    );
  }

  #[test]
  fn out_of_range_samples_analyze_without_overflow() {
    let timings = ConfigTimings::from_record(&record(&[
      ("RUNTIME", -1e300),
      ("APPHOST-INIT", 1e300),
      ("APP", 1e10),
      ("APP", 1e10),
    ]))
    .unwrap();

    assert_eq!(timings.phase(Phase::App).total.average(), 10_000_000_000);
    assert_eq!(timings.deltas().apphost, i64::MAX);
    assert_eq!(timings.deltas().total, 10_000_000_000);
  }

  #[test]
  fn unknown_phase_aborts_analysis() {
    let document = ResultsDocument {
      records: vec![record(&[("RUNTIME", 1.0), ("JIT-WARMUP", 2.0)])],
    };

    assert!(matches!(
      analyze_timings(&document),
      Err(BenchError::UnrecognizedPhase(phase)) if phase == "JIT-WARMUP"
    ));
  }

  #[test]
  fn failure_diff_against_baseline() {
    let baseline = BTreeSet::from(["MethodA".to_string(), "MethodB".to_string()]);
    let config = ConfigFailures {
      mode: BuildMode::default(),
      failures: BTreeSet::from(["MethodB".to_string(), "MethodC".to_string()]),
    };

    let diff = config.diff(&baseline);

    assert_eq!(diff.introduced, ["MethodC"]);
    assert_eq!(diff.fixed, ["MethodA"]);
  }

  #[test]
  fn records_without_failures_analyze_as_empty_sets() {
    let document = ResultsDocument {
      records: vec![record(&[])],
    };

    let failures = analyze_failures(&document);

    assert_eq!(failures.len(), 1);
    assert!(failures[0].failures.is_empty());
  }
}
