use std::{
  fs::File,
  io::{BufWriter, Write},
  path::{Path, PathBuf},
};

use anyhow::{Context, Result};

/// Which of the two logs a process writes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogKind {
  Build,
  Run,
}

/// The build and run logs of one invocation. Both files live as long as the
/// value and are flushed by `finish`.
pub struct RunLogs {
  build_path: PathBuf,
  run_path: PathBuf,
  build: BufWriter<File>,
  run: BufWriter<File>,
}

impl RunLogs {
  pub fn create(dir: &Path, stamp: &str) -> Result<Self> {
    let build_path = dir.join(format!("bench-build-{stamp}.log"));
    let run_path = dir.join(format!("bench-run-{stamp}.log"));

    let build = File::create(&build_path).with_context(|| format!("create {build_path:?}"))?;
    let run = File::create(&run_path).with_context(|| format!("create {run_path:?}"))?;

    Ok(Self {
      build_path,
      run_path,
      build: BufWriter::new(build),
      run: BufWriter::new(run),
    })
  }

  pub fn writer(&mut self, kind: LogKind) -> &mut dyn Write {
    match kind {
      LogKind::Build => &mut self.build,
      LogKind::Run => &mut self.run,
    }
  }

  pub fn path(&self, kind: LogKind) -> &Path {
    match kind {
      LogKind::Build => &self.build_path,
      LogKind::Run => &self.run_path,
    }
  }

  pub fn finish(mut self) -> Result<()> {
    self.build.flush().context("flush build log")?;
    self.run.flush().context("flush run log")?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::fs;

  use tempfile::TempDir;

  use super::*;

  #[test]
  fn writes_each_kind_to_its_own_file() {
    let dir = TempDir::with_prefix("bench-logs-").unwrap();
    let mut logs = RunLogs::create(dir.path(), "0101-1200").unwrap();

    writeln!(logs.writer(LogKind::Build), "building").unwrap();
    writeln!(logs.writer(LogKind::Run), "running").unwrap();

    let build_path = logs.path(LogKind::Build).to_path_buf();
    let run_path = logs.path(LogKind::Run).to_path_buf();
    logs.finish().unwrap();

    assert!(build_path.ends_with("bench-build-0101-1200.log"));
    assert_eq!(fs::read_to_string(build_path).unwrap(), "building\n");
    assert_eq!(fs::read_to_string(run_path).unwrap(), "running\n");
  }
}
