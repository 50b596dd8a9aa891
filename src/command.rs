use std::{fmt, path::PathBuf, process::Command};

use clap::ValueEnum;

use crate::mode::BuildMode;

/// Marker printed by `docker build` right before the id of the image it wrote.
pub const WRITING_IMAGE: &str = "writing image sha256:";

/// How images are built and run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
  /// `docker build` / `docker run`.
  Docker,
  /// The ruby setup script, publishing and running the server on the host.
  Script,
}

impl Default for Backend {
  fn default() -> Self {
    if cfg!(windows) {
      Backend::Script
    } else {
      Backend::Docker
    }
  }
}

/// What a successful build leaves behind for the run step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Artifact {
  Image(String),
  Published,
}

/// The kind of measurement the setup script is asked to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunKind {
  Benchmark,
  Resolution,
}

/// Everything needed to template build and run commands.
#[derive(Clone, Debug)]
pub struct CommandTemplate {
  pub backend: Backend,
  /// Build context handed to `docker build`.
  pub work_dir: PathBuf,
  /// Tag used when printing commands for a single configuration.
  pub image_tag: String,
  pub setup_script: PathBuf,
}

/// A fully templated external command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
  pub program: String,
  pub args: Vec<String>,
  pub env: Vec<(String, String)>,
}

impl Invocation {
  fn new(program: &str) -> Self {
    Self {
      program: program.to_string(),
      args: Vec::new(),
      env: Vec::new(),
    }
  }

  fn arg(mut self, arg: impl Into<String>) -> Self {
    self.args.push(arg.into());
    self
  }

  fn arg_if(self, condition: bool, arg: &str) -> Self {
    if condition {
      self.arg(arg)
    } else {
      self
    }
  }

  fn env(mut self, key: &str, value: &str) -> Self {
    self.env.push((key.to_string(), value.to_string()));
    self
  }

  pub fn command(&self) -> Command {
    let mut command = Command::new(&self.program);
    command.args(&self.args);
    command.envs(self.env.iter().cloned());

    command
  }
}

impl fmt::Display for Invocation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.program)?;
    for arg in &self.args {
      write!(f, " {arg}")?;
    }

    Ok(())
  }
}

/// `True`/`False`, the spelling the Dockerfile build args expect.
fn build_arg(name: &str, value: bool) -> [String; 2] {
  let value = if value { "True" } else { "False" };
  ["--build-arg".to_string(), format!("{name}={value}")]
}

fn env_flag(value: bool) -> &'static str {
  if value {
    "1"
  } else {
    "0"
  }
}

impl CommandTemplate {
  /// The build command for `mode`. `tag` names the resulting image, only
  /// meaningful for the docker backend.
  pub fn build(&self, mode: &BuildMode, tag: Option<&str>) -> Invocation {
    match self.backend {
      Backend::Docker => {
        let mut invocation = Invocation::new("docker")
          .arg("build")
          .arg(self.work_dir.display().to_string())
          .env("DOCKER_BUILDKIT", "1");

        for (name, value) in [
          ("NETCORE_COMPOSITE", mode.net_core_composite),
          ("NETCORE_INCLUDE_ASPNET", mode.net_core_include_asp_net),
          ("ASPNET_COMPOSITE", mode.asp_net_composite),
          ("APP_R2R", mode.app_r2r),
          ("APP_COMPOSITE", mode.app_composite),
          ("ONE_BIG_COMPOSITE", mode.one_big_composite),
          ("APP_AVX2", mode.app_avx2),
        ] {
          invocation.args.extend(build_arg(name, value));
        }

        match tag {
          Some(tag) => invocation.arg("-t").arg(tag),
          None => invocation,
        }
      }
      Backend::Script => self
        .script()
        .arg("--build")
        .arg_if(mode.app_r2r, "--appr2r")
        .arg_if(mode.app_composite, "--appcomposite")
        .arg_if(mode.app_avx2, "--appavx2")
        .arg_if(mode.net_core_composite, "--netcorecomposite")
        .arg_if(mode.net_core_include_asp_net, "--includeaspnet")
        .arg_if(mode.asp_net_composite, "--aspnetcomposite")
        .arg_if(mode.one_big_composite, "--onebigcomposite"),
    }
  }

  /// The run command for `mode` against a built `artifact`. Run processes get
  /// no stdin, so docker must not be asked for a terminal.
  pub fn run(&self, mode: &BuildMode, artifact: &Artifact, kind: RunKind) -> Invocation {
    self.run_with(mode, artifact, kind, false)
  }

  /// Like `run`, but meant to be pasted into an interactive shell.
  pub fn run_in_terminal(&self, mode: &BuildMode, artifact: &Artifact, kind: RunKind) -> Invocation {
    self.run_with(mode, artifact, kind, true)
  }

  fn run_with(&self, mode: &BuildMode, artifact: &Artifact, kind: RunKind, terminal: bool) -> Invocation {
    match self.backend {
      Backend::Docker => {
        let image = match artifact {
          Artifact::Image(image) => image.as_str(),
          Artifact::Published => self.image_tag.as_str(),
        };

        Invocation::new("docker")
          .arg("run")
          .arg("--env")
          .arg(format!("COMPlus_ReadyToRun={}", env_flag(mode.use_ready_to_run)))
          .arg("--env")
          .arg(format!("COMPlus_TieredCompilation={}", env_flag(mode.use_tiered_compilation)))
          .arg_if(terminal, "-it")
          .arg(image)
          .env("DOCKER_BUILDKIT", "1")
      }
      Backend::Script => self
        .script()
        .arg("--run")
        .arg(match kind {
          RunKind::Benchmark => "BENCHMARK",
          RunKind::Resolution => "RESOLUTION",
        })
        .arg_if(mode.use_ready_to_run, "--readytorun")
        .arg_if(mode.use_tiered_compilation, "--tieredcompilation"),
    }
  }

  fn script(&self) -> Invocation {
    Invocation::new("ruby").arg(self.setup_script.display().to_string())
  }
}

/// Finds the image id in the tail of `docker build` output.
pub fn find_image_id(lines: &[String]) -> Option<String> {
  lines.iter().rev().take(10).find_map(|line| {
    line
      .find(WRITING_IMAGE)
      .and_then(|at| line[at + WRITING_IMAGE.len()..].split_whitespace().next())
      .map(str::to_string)
  })
}
