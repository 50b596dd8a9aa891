use std::fmt;

use regex::Regex;

use crate::error::BenchError;

/// One build configuration of the server image, plus the two runtime toggles
/// it is run with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildMode {
  pub name: String,
  /// Compile the shared framework as a composite image.
  pub net_core_composite: bool,
  /// Fold ASP.NET into the framework composite.
  pub net_core_include_asp_net: bool,
  pub asp_net_composite: bool,
  /// Precompile the application itself.
  pub app_r2r: bool,
  pub app_composite: bool,
  /// Framework, ASP.NET and app bundled into a single self-contained composite.
  pub one_big_composite: bool,
  pub app_avx2: bool,
  pub use_ready_to_run: bool,
  pub use_tiered_compilation: bool,
}

impl BuildMode {
  /// Human readable summary of the flags, without the name.
  pub fn description(&self) -> String {
    fn on_off(flag: bool) -> &'static str {
      if flag {
        "ON"
      } else {
        "OFF"
      }
    }

    fn composite(flag: bool) -> &'static str {
      if flag {
        "composite"
      } else {
        "default"
      }
    }

    let mut description = if self.one_big_composite {
      "one big composite".to_string()
    } else {
      let mut parts = format!(
        ".NET Core{}={}",
        if self.net_core_include_asp_net { "+ASP.NET" } else { "" },
        composite(self.net_core_composite),
      );

      if !self.net_core_include_asp_net {
        parts.push_str(&format!(" / ASP.NET={}", composite(self.asp_net_composite)));
      }

      let app = match (self.app_r2r, self.app_composite) {
        (false, _) => "JIT",
        (true, false) => "R2R",
        (true, true) => "composite",
      };
      parts.push_str(&format!(" / APP={app}"));

      parts
    };

    if self.app_avx2 {
      description.push_str(" / AVX2");
    }

    description.push_str(&format!(" / TC {}", on_off(self.use_tiered_compilation)));
    description.push_str(&format!(" / RTR {}", on_off(self.use_ready_to_run)));

    description
  }

  fn variant(&self, suffix: &str, use_ready_to_run: bool, use_tiered_compilation: bool) -> BuildMode {
    BuildMode {
      name: format!("{}-{suffix}", self.name),
      use_ready_to_run,
      use_tiered_compilation,
      ..self.clone()
    }
  }
}

impl fmt::Display for BuildMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.name, self.description())
  }
}

/// Selects configurations by name. A name is selected when any of the
/// patterns matches it.
#[derive(Clone, Debug)]
pub struct ConfigFilter {
  patterns: Vec<Regex>,
}

impl ConfigFilter {
  /// Builds a filter from comma separated regular expressions. Empty fragments
  /// are ignored.
  pub fn from_csv(csv: &str) -> Result<Self, BenchError> {
    let patterns = csv
      .split(',')
      .map(str::trim)
      .filter(|fragment| !fragment.is_empty())
      .map(compile)
      .collect::<Result<_, _>>()?;

    Ok(Self { patterns })
  }

  pub fn matches(&self, name: &str) -> bool {
    self.patterns.iter().any(|pattern| pattern.is_match(name))
  }
}

fn compile(pattern: &str) -> Result<Regex, BenchError> {
  Regex::new(pattern).map_err(|source| BenchError::InvalidPattern {
    pattern: pattern.to_string(),
    source,
  })
}

/// The ordered set of configurations a run walks through.
#[derive(Clone, Debug)]
pub struct ConfigMatrix {
  modes: Vec<BuildMode>,
}

impl ConfigMatrix {
  /// The base templates, optionally followed by their ready-to-run and
  /// tiered-compilation variants.
  pub fn new(expand_variants: bool) -> Self {
    let mut modes = base_modes();

    if expand_variants {
      let variants = [
        ("usereadytorun", true, false),
        ("usetieredcompilation", false, true),
        ("usereadytorun-and-tieredcompilation", true, true),
      ];

      let base = modes.clone();
      for (suffix, ready_to_run, tiered_compilation) in variants {
        modes.extend(
          base
            .iter()
            .map(|mode| mode.variant(suffix, ready_to_run, tiered_compilation)),
        );
      }
    }

    Self { modes }
  }

  #[cfg(test)]
  pub fn from_modes(modes: Vec<BuildMode>) -> Self {
    Self { modes }
  }

  pub fn len(&self) -> usize {
    self.modes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.modes.is_empty()
  }

  /// Keeps only the configurations selected by `filter`, in their current
  /// order.
  pub fn select_matching(&mut self, filter: &ConfigFilter) {
    self.modes.retain(|mode| filter.matches(&mode.name));
  }

  /// The first configuration whose name matches `pattern`.
  pub fn specific(&self, pattern: &str) -> Result<&BuildMode, BenchError> {
    let regex = compile(pattern)?;

    self
      .modes
      .iter()
      .find(|mode| regex.is_match(&mode.name))
      .ok_or_else(|| BenchError::ConfigNotFound(pattern.to_string()))
  }

  pub fn iter(&self) -> impl Iterator<Item = (usize, &BuildMode)> {
    self.modes.iter().enumerate()
  }

  /// Like `iter`, truncated to the first `limit` configurations when given.
  pub fn iter_until(&self, limit: Option<usize>) -> impl Iterator<Item = (usize, &BuildMode)> {
    self.iter().take(limit.unwrap_or(usize::MAX))
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.modes.iter().map(|mode| mode.name.as_str())
  }
}

fn base_modes() -> Vec<BuildMode> {
  let precompiled = BuildMode {
    use_ready_to_run: true,
    ..BuildMode::default()
  };

  vec![
    BuildMode {
      name: "baseline".to_string(),
      ..precompiled.clone()
    },
    BuildMode {
      name: "r2r".to_string(),
      app_r2r: true,
      ..precompiled.clone()
    },
    BuildMode {
      name: "app-composite-avx2".to_string(),
      app_r2r: true,
      app_composite: true,
      app_avx2: true,
      ..precompiled.clone()
    },
    BuildMode {
      name: "one-big-composite-avx2".to_string(),
      app_r2r: true,
      app_composite: true,
      one_big_composite: true,
      app_avx2: true,
      ..precompiled.clone()
    },
    BuildMode {
      name: "r2r-platform-composite-avx2".to_string(),
      net_core_composite: true,
      net_core_include_asp_net: true,
      asp_net_composite: true,
      app_r2r: true,
      app_composite: true,
      app_avx2: true,
      ..precompiled.clone()
    },
    BuildMode {
      name: "jit-platform-composite-avx2".to_string(),
      net_core_composite: true,
      net_core_include_asp_net: true,
      asp_net_composite: true,
      app_avx2: true,
      ..precompiled
    },
  ]
}
