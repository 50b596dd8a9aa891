use std::{collections::BTreeSet, fmt::Write};

use anyhow::Result;

use crate::report::{ConfigFailures, ConfigTimings, Deltas};

const TIMINGS_HEADER: &str =
  "TOTAL |  %  | RUNTIME |  %  | APPHOST |  %  | WEBHOST |  %  |   APP   |  %  | DROP | MODE";
const FAILURES_HEADER: &str = "FAILURES | BASELINE+ | BASELINE- | MODE";

/// `value` as a percentage of `baseline`, rounded. Baselines below 1 count as
/// 1 so the result is always finite.
pub fn percentage(value: i64, baseline: i64) -> i64 {
  (100.0 * value as f64 / baseline.max(1) as f64).round() as i64
}

fn write_title(out: &mut String, title: &str) -> Result<()> {
  writeln!(out, "{title}")?;
  writeln!(out, "{}", "=".repeat(title.len()))?;

  Ok(())
}

fn format_timing_row(deltas: &Deltas, baseline: &Deltas, dropped: u32, name: &str) -> String {
  let mut row = format!("{:>5} | {:>3} | ", deltas.total, percentage(deltas.total, baseline.total));

  for (value, baseline) in [
    (deltas.runtime, baseline.runtime),
    (deltas.apphost, baseline.apphost),
    (deltas.webhost, baseline.webhost),
    (deltas.app, baseline.app),
  ] {
    row.push_str(&format!("{value:>7} | {:>3} | ", percentage(value, baseline)));
  }

  row.push_str(&format!("{dropped:>4} | {name}"));
  row
}

/// Summary table followed by per configuration details. The first
/// configuration is the baseline every percentage is relative to.
pub fn format_timings(configs: &[ConfigTimings]) -> Result<String> {
  let mut summary = String::new();
  write_title(&mut summary, "Summary")?;
  writeln!(summary, "{TIMINGS_HEADER}")?;
  writeln!(summary, "{}", "=".repeat(TIMINGS_HEADER.len()))?;

  let mut details = String::new();
  write_title(&mut details, "Details")?;

  let baseline = configs.first().map(ConfigTimings::deltas).unwrap_or_default();

  for config in configs {
    writeln!(
      summary,
      "{}",
      format_timing_row(&config.deltas(), &baseline, config.dropped, &config.mode.name)
    )?;

    write_title(&mut details, &config.mode.to_string())?;
    for (phase, stats) in &config.phases {
      stats.write_to(&mut details, phase.as_str())?;
    }
    writeln!(details, "DROPPED ITERATIONS: {}", config.dropped)?;
    writeln!(details)?;
  }

  Ok(format!("{summary}\n{details}"))
}

/// Resolution failures of every configuration compared with the first one.
pub fn format_failures(configs: &[ConfigFailures]) -> Result<String> {
  let mut summary = String::new();
  write_title(&mut summary, "Summary")?;
  writeln!(summary, "{FAILURES_HEADER}")?;
  writeln!(summary, "{}", "=".repeat(FAILURES_HEADER.len()))?;

  let mut details = String::new();
  write_title(&mut details, "Details")?;

  let no_failures = BTreeSet::new();

  for (index, config) in configs.iter().enumerate() {
    let is_baseline = index == 0;
    let baseline = if is_baseline { &no_failures } else { &configs[0].failures };
    let diff = config.diff(baseline);

    writeln!(
      summary,
      "{:>8} | {:>9} | {:>9} | {}",
      config.failures.len(),
      diff.introduced.len(),
      diff.fixed.len(),
      config.mode,
    )?;

    write_title(&mut details, &config.mode.to_string())?;
    if is_baseline {
      write_title(&mut details, "BASELINE FAILURES")?;
    } else {
      write_title(&mut details, "FAILURES ON TOP OF BASELINE")?;
    }
    for failure in &diff.introduced {
      writeln!(details, "{failure}")?;
    }

    if !is_baseline {
      write_title(&mut details, "MISSING BASELINE FAILURES")?;
      for failure in &diff.fixed {
        writeln!(details, "{failure}")?;
      }
    }
    writeln!(details)?;
  }

  Ok(format!("{summary}\n{details}"))
}
