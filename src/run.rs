use std::{
  io::Write,
  process::Stdio,
  time::{Duration, Instant},
};

use anyhow::{Context, Result};

use crate::{
  command::Invocation,
  ext::{ChildExt, ExitStatusExt, Stream},
};

/// Line printed by the server right before its timing fragment.
pub const FRAGMENT_START: &str = "XMLXMLXML";
/// Line printed by the server right after its timing fragment.
pub const FRAGMENT_END: &str = "LMXLMXLMX";
/// Exit code of a measured run that finished its report and was terminated.
pub const EXPECTED_RUN_EXIT: i32 = 143;

const FAILURE_OPEN: &str = "<R2RResolutionFailed>";
const FAILURE_CLOSE: &str = "</R2RResolutionFailed>";

/// What an external process left behind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Execution {
  /// Shell style exit code, `None` if the process timed out.
  pub code: Option<i32>,
  /// Non-empty stdout and stderr lines, in arrival order.
  pub lines: Vec<String>,
}

/// Runs external commands on behalf of the orchestrator.
pub trait Executor {
  /// Runs `invocation` to completion, appending its output lines to `log` as
  /// they arrive.
  fn execute(&mut self, invocation: &Invocation, log: &mut dyn Write) -> Result<Execution>;
}

impl<E: Executor + ?Sized> Executor for &mut E {
  fn execute(&mut self, invocation: &Invocation, log: &mut dyn Write) -> Result<Execution> {
    (**self).execute(invocation, log)
  }
}

/// Spawns real processes.
#[derive(Clone, Debug, Default)]
pub struct ProcessExecutor {
  /// Kills processes that run longer than this.
  pub timeout: Option<Duration>,
  /// Echo process output to the console while it runs.
  pub echo: bool,
}

impl Executor for ProcessExecutor {
  fn execute(&mut self, invocation: &Invocation, log: &mut dyn Write) -> Result<Execution> {
    let mut child = invocation
      .command()
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .with_context(|| format!("spawn {invocation}"))?;

    let mut lines = Vec::new();
    let status = child.capture_lines(self.timeout, |stream, line| {
      if line.is_empty() {
        return Ok(());
      }

      match stream {
        Stream::Stdout => {
          if self.echo {
            println!("{line}");
          }
          writeln!(log, "{line}").context("write log")?;
        }
        Stream::Stderr => {
          if self.echo {
            eprintln!("{line}");
          }
          writeln!(log, "!!{line}").context("write log")?;
        }
      }

      lines.push(line);
      Ok(())
    })?;

    Ok(Execution {
      code: status.and_then(|status| status.shell_code()),
      lines,
    })
  }
}

/// Runs `invocation` through `executor`, bracketing its output in `log` with
/// the command line, its duration and its exit code.
pub fn execute_logged<E: Executor + ?Sized>(
  executor: &mut E,
  invocation: &Invocation,
  log: &mut dyn Write,
) -> Result<Execution> {
  let started = Instant::now();
  writeln!(log, "Running {invocation}").context("write log")?;

  let execution = executor.execute(invocation, log)?;

  let code = match execution.code {
    Some(code) => code.to_string(),
    None => "none (timed out)".to_string(),
  };
  writeln!(
    log,
    "Finished in {} msecs with exit code {code}: {invocation}",
    started.elapsed().as_millis(),
  )
  .context("write log")?;

  Ok(execution)
}

/// The structured output of one run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Captured {
  /// Lines strictly between the fragment sentinels, all fragments concatenated.
  pub fragment: Vec<String>,
  /// Resolution failures printed after a fragment.
  pub failures: Vec<String>,
}

/// Splits run output into timing fragment lines and, after each fragment, the
/// resolution failures the runtime reported.
pub fn capture(lines: &[String]) -> Captured {
  #[derive(PartialEq)]
  enum Position {
    BeforeFragment,
    InFragment,
    AfterFragment,
  }

  let mut captured = Captured::default();
  let mut position = Position::BeforeFragment;

  for line in lines.iter().map(|line| line.trim_end()) {
    if position == Position::InFragment {
      if line == FRAGMENT_END {
        position = Position::AfterFragment;
      } else {
        captured.fragment.push(line.to_string());
      }
    } else if line == FRAGMENT_START {
      position = Position::InFragment;
    } else if position == Position::AfterFragment {
      if let Some(failure) = resolution_failure(line) {
        captured.failures.push(failure.to_string());
      }
    }
  }

  captured
}

fn resolution_failure(line: &str) -> Option<&str> {
  let start = line.find(FAILURE_OPEN)? + FAILURE_OPEN.len();
  let end = line.rfind(FAILURE_CLOSE)?;

  (end > start).then(|| &line[start..end])
}

#[cfg(test)]
mod tests {
  use super::*;

  fn lines(text: &str) -> Vec<String> {
    text.lines().map(String::from).collect()
  }

  #[test]
  fn keeps_only_lines_between_sentinels() {
    let output = lines(
      "starting server\n\
       XMLXMLXML\n\
       <Timing Phase=\"APP\">\n\
       </Timing>\n\
       LMXLMXLMX\n\
       shutting down",
    );

    let captured = capture(&output);

    assert_eq!(captured.fragment, ["<Timing Phase=\"APP\">", "</Timing>"]);
    assert!(captured.failures.is_empty());
  }

  #[test]
  fn collects_failures_after_each_fragment() {
    let output = lines(
      "<R2RResolutionFailed>Before.Fragment</R2RResolutionFailed>\n\
       XMLXMLXML\r\n\
       <Timing Phase=\"RUNTIME\"/>\n\
       LMXLMXLMX\n\
       log: <R2RResolutionFailed>System.String.Concat</R2RResolutionFailed>\n\
       <R2RResolutionFailed></R2RResolutionFailed>\n\
       XMLXMLXML\n\
       <Timing Phase=\"APP\"/>\n\
       LMXLMXLMX\n\
       <R2RResolutionFailed>Jellyfin.Server.Program.Main</R2RResolutionFailed>",
    );

    let captured = capture(&output);

    assert_eq!(captured.fragment, ["<Timing Phase=\"RUNTIME\"/>", "<Timing Phase=\"APP\"/>"]);
    assert_eq!(captured.failures, ["System.String.Concat", "Jellyfin.Server.Program.Main"]);
  }

  #[test]
  fn unterminated_fragment_runs_to_the_end() {
    let captured = capture(&lines("XMLXMLXML\n<Timing/>"));
    assert_eq!(captured.fragment, ["<Timing/>"]);
  }

  #[cfg(unix)]
  #[test]
  fn process_executor_logs_and_collects_output() {
    let invocation = Invocation {
      program: "sh".to_string(),
      args: vec![
        "-c".to_string(),
        "echo XMLXMLXML; echo; echo oops >&2; echo LMXLMXLMX; exit 143".to_string(),
      ],
      env: Vec::new(),
    };
    let mut log = Vec::new();

    let execution = execute_logged(&mut ProcessExecutor::default(), &invocation, &mut log).unwrap();

    assert_eq!(execution.code, Some(EXPECTED_RUN_EXIT));
    assert_eq!(execution.lines.len(), 3);
    assert!(execution.lines.contains(&"oops".to_string()));

    let log = String::from_utf8(log).unwrap();
    assert!(log.starts_with("Running sh -c "));
    assert!(log.contains("!!oops\n"));
    assert!(log.contains("with exit code 143: sh -c"));
  }

  #[cfg(unix)]
  #[test]
  fn missing_program_is_an_error() {
    let invocation = Invocation {
      program: "/definitely/not/a/program".to_string(),
      args: Vec::new(),
      env: Vec::new(),
    };

    assert!(ProcessExecutor::default().execute(&invocation, &mut Vec::new()).is_err());
  }
}
