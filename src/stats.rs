use std::{fmt, fmt::Write, str::FromStr};

use crate::error::BenchError;

/// A startup phase reported by the measured server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
  Runtime,
  AppHostInit,
  WebHostStartAsync,
  App,
}

impl Phase {
  pub const ALL: [Phase; 4] = [Phase::Runtime, Phase::AppHostInit, Phase::WebHostStartAsync, Phase::App];

  pub fn as_str(&self) -> &'static str {
    match self {
      Phase::Runtime => "RUNTIME",
      Phase::AppHostInit => "APPHOST-INIT",
      Phase::WebHostStartAsync => "WEBHOST-START-ASYNC",
      Phase::App => "APP",
    }
  }
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Phase {
  type Err = BenchError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Phase::ALL
      .into_iter()
      .find(|phase| phase.as_str() == s)
      .ok_or_else(|| BenchError::UnrecognizedPhase(s.to_string()))
  }
}

/// Running statistics over integer millisecond samples. Averages truncate
/// toward zero. Sums are kept wide and saturate, so no input can overflow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ValueStatistics {
  count: i64,
  sum: i128,
  sum_squared: i128,
  min: i64,
  max: i64,
}

fn clamp(value: i128) -> i64 {
  i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

impl ValueStatistics {
  pub fn add(&mut self, value: i64) {
    if self.count == 0 {
      self.min = value;
      self.max = value;
    } else if value < self.min {
      self.min = value;
    } else if value > self.max {
      self.max = value;
    }

    let wide = i128::from(value);
    self.count = self.count.saturating_add(1);
    self.sum = self.sum.saturating_add(wide);
    self.sum_squared = self.sum_squared.saturating_add(wide * wide);
  }

  pub fn count(&self) -> i64 {
    self.count
  }

  /// Only meaningful when `count() > 0`.
  pub fn min(&self) -> i64 {
    self.min
  }

  /// Only meaningful when `count() > 0`.
  pub fn max(&self) -> i64 {
    self.max
  }

  fn nonzero_count(&self) -> i128 {
    i128::from(self.count.max(1))
  }

  fn wide_average(&self) -> i128 {
    self.sum / self.nonzero_count()
  }

  /// Mean of the samples, 0 when empty.
  pub fn average(&self) -> i64 {
    clamp(self.wide_average())
  }

  /// Population variance, `E[X²] - E[X]²` rearranged around the truncated
  /// average.
  pub fn variance(&self) -> i64 {
    let avg = self.wide_average();
    let cross = avg.saturating_mul(2).saturating_mul(self.sum);
    clamp(avg.saturating_mul(avg).saturating_add(self.sum_squared.saturating_sub(cross) / self.nonzero_count()))
  }

  pub fn standard_deviation(&self) -> i64 {
    (self.variance().max(0) as f64).sqrt() as i64
  }

  pub fn write_to(&self, report: &mut String, name: &str) -> fmt::Result {
    writeln!(
      report,
      "{name:<30}: COUNT={:<5} AVG={:<5} INTERVAL={:<5} STDDEV={:<5}",
      self.count(),
      self.average(),
      self.max().saturating_sub(self.min()),
      self.standard_deviation(),
    )
  }
}

/// Total, user and system time of one phase across the measured iterations of
/// one configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseStatistics {
  pub total: ValueStatistics,
  pub user: ValueStatistics,
  pub system: ValueStatistics,
}

impl PhaseStatistics {
  pub fn add(&mut self, total: i64, user: i64, system: i64) {
    self.total.add(total);
    self.user.add(user);
    self.system.add(system);
  }

  pub fn write_to(&self, report: &mut String, name: &str) -> fmt::Result {
    self.total.write_to(report, &format!("{name} (total)"))?;
    self.user.write_to(report, &format!("{name} (user)"))?;
    self.system.write_to(report, &format!("{name} (system)"))
  }
}
