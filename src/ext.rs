use std::{
  io::{BufRead, BufReader, Read},
  process::{Child, ExitStatus},
  sync::mpsc::{self, RecvTimeoutError, Sender},
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use anyhow::{Context, Result};
use wait_timeout::ChildExt as WaitExt;

/// Which pipe a captured line came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
  Stdout,
  Stderr,
}

#[cfg(unix)]
fn signal_code(status: &ExitStatus) -> Option<i32> {
  use std::os::unix::process::ExitStatusExt;

  status.signal().map(|signal| 128 + signal)
}

#[cfg(not(unix))]
fn signal_code(_status: &ExitStatus) -> Option<i32> {
  None
}

#[extend::ext]
pub impl ExitStatus {
  /// The exit code as a shell would report it: on Unix, death by signal `n` is
  /// reported as `128 + n`.
  fn shell_code(&self) -> Option<i32> {
    self.code().or_else(|| signal_code(self))
  }
}

/// Forwards every line of `pipe` until EOF. Invalid UTF-8 is replaced rather
/// than ending the read, otherwise the child would die on its next write.
fn spawn_reader<R: Read + Send + 'static>(stream: Stream, pipe: R, tx: Sender<(Stream, String)>) -> JoinHandle<()> {
  thread::spawn(move || {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();

    loop {
      buf.clear();
      match reader.read_until(b'\n', &mut buf) {
        Ok(0) | Err(_) => break,
        Ok(_) => {}
      }

      if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
          buf.pop();
        }
      }

      let line = String::from_utf8_lossy(&buf).into_owned();
      if tx.send((stream, line)).is_err() {
        break;
      }
    }
  })
}

#[extend::ext]
pub impl Child {
  /// Drains the piped stdout and stderr of the child line by line, handing
  /// every line to `on_line` on the calling thread in arrival order, then waits
  /// for the child to exit.
  ///
  /// On timeout the child is killed and `Ok(None)` is returned.
  fn capture_lines<F>(&mut self, timeout: Option<Duration>, mut on_line: F) -> Result<Option<ExitStatus>>
  where
    F: FnMut(Stream, String) -> Result<()>,
  {
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let (tx, rx) = mpsc::channel();

    let mut readers = Vec::new();
    if let Some(stdout) = self.stdout.take() {
      readers.push(spawn_reader(Stream::Stdout, stdout, tx.clone()));
    }
    if let Some(stderr) = self.stderr.take() {
      readers.push(spawn_reader(Stream::Stderr, stderr, tx.clone()));
    }
    drop(tx);

    loop {
      let next = match deadline {
        Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
      };

      match next {
        Ok((stream, line)) => {
          if let Err(err) = on_line(stream, line) {
            self.kill_and_reap()?;
            return Err(err);
          }
        }
        Err(RecvTimeoutError::Disconnected) => break,
        Err(RecvTimeoutError::Timeout) => {
          self.kill_and_reap()?;
          return Ok(None);
        }
      }
    }

    for reader in readers {
      reader.join().map_err(|_| anyhow::anyhow!("output reader panicked"))?;
    }

    let Some(deadline) = deadline else {
      return Ok(Some(self.wait().context("wait")?));
    };

    match self
      .wait_timeout(deadline.saturating_duration_since(Instant::now()))
      .context("wait")?
    {
      Some(status) => Ok(Some(status)),
      None => {
        self.kill_and_reap()?;
        Ok(None)
      }
    }
  }

  fn kill_and_reap(&mut self) -> Result<()> {
    self.kill().context("kill")?;
    self.wait().context("wait")?;

    Ok(())
  }
}

#[cfg(all(test, unix))]
mod tests {
  use std::process::{Command, Stdio};

  use super::*;

  fn sh(script: &str) -> Child {
    Command::new("sh")
      .args(["-c", script])
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .unwrap()
  }

  #[test]
  fn captures_both_streams_and_the_exit_code() {
    let mut child = sh("echo one; echo two >&2; echo three; exit 143");
    let mut lines = Vec::new();

    let status = child
      .capture_lines(None, |stream, line| {
        lines.push((stream, line));
        Ok(())
      })
      .unwrap()
      .unwrap();

    assert_eq!(status.shell_code(), Some(143));
    let stdout: Vec<&str> = lines
      .iter()
      .filter(|(stream, _)| *stream == Stream::Stdout)
      .map(|(_, line)| line.as_str())
      .collect();
    assert_eq!(stdout, ["one", "three"]);
    assert!(lines.contains(&(Stream::Stderr, "two".to_string())));
  }

  #[test]
  fn signal_death_maps_to_shell_code() {
    let mut child = sh("kill -TERM $$");
    let status = child.capture_lines(None, |_, _| Ok(())).unwrap().unwrap();

    assert_eq!(status.shell_code(), Some(143));
  }

  #[test]
  fn invalid_utf8_does_not_stop_the_drain() {
    let mut child = sh("printf 'bad \\377 byte\\n'; echo XMLXMLXML; echo LMXLMXLMX; exit 143");
    let mut lines = Vec::new();

    let status = child
      .capture_lines(None, |_, line| {
        lines.push(line);
        Ok(())
      })
      .unwrap()
      .unwrap();

    assert_eq!(status.shell_code(), Some(143));
    assert_eq!(lines, ["bad \u{fffd} byte", "XMLXMLXML", "LMXLMXLMX"]);
  }

  #[test]
  fn failing_callback_reaps_the_child() {
    let mut child = sh("echo first; exec sleep 30");
    let started = Instant::now();

    let result = child.capture_lines(None, |_, _| anyhow::bail!("log is gone"));

    assert_eq!(result.unwrap_err().to_string(), "log is gone");
    assert!(child.try_wait().unwrap().is_some());
    assert!(started.elapsed() < Duration::from_secs(10));
  }

  #[test]
  fn timeout_kills_the_child() {
    let mut child = sh("exec sleep 30");
    let started = Instant::now();

    let status = child.capture_lines(Some(Duration::from_millis(200)), |_, _| Ok(())).unwrap();

    assert!(status.is_none());
    assert!(started.elapsed() < Duration::from_secs(10));
  }
}
