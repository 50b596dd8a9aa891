//! The results document: everything captured by a run, persisted as XML so it
//! can be analyzed again without rebuilding anything.
//!
//! The timing fragments printed by the measured server use the same
//! `<Timing>` element as the document, so both go through the small element
//! tree built here.

use std::{
  collections::BTreeSet,
  fmt::Write as _,
  fs,
  io::Write as _,
  path::Path,
};

use anyhow::{Context, Result};
use quick_xml::{
  escape::escape,
  events::{BytesStart, Event},
  Reader,
};
use tempfile::NamedTempFile;

use crate::{error::BenchError, mode::BuildMode};

/// One phase measurement of one run, in milliseconds as printed by the server.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
  pub phase: String,
  pub total_ms: f64,
  pub user_ms: f64,
  pub system_ms: f64,
}

/// Everything recorded for one configuration that built successfully.
#[derive(Clone, Debug, PartialEq)]
pub struct RunRecord {
  pub mode: BuildMode,
  /// Samples of the measured iterations, in capture order.
  pub samples: Vec<Sample>,
  /// Measured iterations that produced no samples.
  pub dropped: u32,
  /// Resolution failures, only present for resolution runs.
  pub failures: Option<BTreeSet<String>>,
}

impl RunRecord {
  pub fn new(mode: BuildMode) -> Self {
    Self {
      mode,
      samples: Vec::new(),
      dropped: 0,
      failures: None,
    }
  }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultsDocument {
  pub records: Vec<RunRecord>,
}

fn flags(mode: &BuildMode) -> [(&'static str, bool); 9] {
  [
    ("NetCoreComposite", mode.net_core_composite),
    ("NetCoreIncludeAspNet", mode.net_core_include_asp_net),
    ("AspNetComposite", mode.asp_net_composite),
    ("AppR2R", mode.app_r2r),
    ("AppComposite", mode.app_composite),
    ("OneBigComposite", mode.one_big_composite),
    ("AppAVX2", mode.app_avx2),
    ("UseReadyToRun", mode.use_ready_to_run),
    ("UseTieredCompilation", mode.use_tiered_compilation),
  ]
}

fn flags_mut(mode: &mut BuildMode) -> [(&'static str, &mut bool); 9] {
  [
    ("NetCoreComposite", &mut mode.net_core_composite),
    ("NetCoreIncludeAspNet", &mut mode.net_core_include_asp_net),
    ("AspNetComposite", &mut mode.asp_net_composite),
    ("AppR2R", &mut mode.app_r2r),
    ("AppComposite", &mut mode.app_composite),
    ("OneBigComposite", &mut mode.one_big_composite),
    ("AppAVX2", &mut mode.app_avx2),
    ("UseReadyToRun", &mut mode.use_ready_to_run),
    ("UseTieredCompilation", &mut mode.use_tiered_compilation),
  ]
}

impl ResultsDocument {
  pub fn to_xml(&self) -> Result<String> {
    let mut xml = String::new();
    writeln!(xml, "<Xml>")?;

    for record in &self.records {
      writeln!(xml)?;
      writeln!(xml, "<BuildAndRun Name=\"{}\">", escape(record.mode.name.as_str()))?;
      for (field, value) in flags(&record.mode) {
        writeln!(xml, "  <{field}>{}</{field}>", if value { "True" } else { "False" })?;
      }
      writeln!(xml, "  <DroppedIterations>{}</DroppedIterations>", record.dropped)?;

      writeln!(xml)?;
      writeln!(xml, "  <Results>")?;
      for sample in &record.samples {
        writeln!(xml)?;
        writeln!(xml, "    <Timing Phase=\"{}\">", escape(sample.phase.as_str()))?;
        writeln!(xml, "      <TotalTimeMsec>{}</TotalTimeMsec>", sample.total_ms)?;
        writeln!(xml, "      <UserTimeMsec>{}</UserTimeMsec>", sample.user_ms)?;
        writeln!(xml, "      <SystemTimeMsec>{}</SystemTimeMsec>", sample.system_ms)?;
        writeln!(xml, "    </Timing>")?;
      }
      if let Some(failures) = &record.failures {
        writeln!(xml)?;
        writeln!(xml, "    <R2RFails>")?;
        for failure in failures {
          writeln!(xml, "      <R2RResolutionFailed>{}</R2RResolutionFailed>", escape(failure.as_str()))?;
        }
        writeln!(xml, "    </R2RFails>")?;
      }
      writeln!(xml, "  </Results>")?;
      writeln!(xml, "</BuildAndRun>")?;
    }

    writeln!(xml, "</Xml>")?;

    Ok(xml)
  }

  pub fn parse(text: &str) -> Result<Self, BenchError> {
    let root = parse_tree(text)?;

    let records = root
      .children
      .iter()
      .filter(|child| child.name == "BuildAndRun")
      .map(parse_record)
      .collect::<Result<_, _>>()?;

    Ok(Self { records })
  }

  /// Writes the document next to its final location first, so a crash never
  /// leaves a truncated document behind.
  pub fn save(&self, path: &Path) -> Result<()> {
    let dir = path
      .parent()
      .filter(|dir| !dir.as_os_str().is_empty())
      .unwrap_or(Path::new("."));

    let mut file = NamedTempFile::new_in(dir).context("tempfile")?;
    file.write_all(self.to_xml()?.as_bytes()).context("write")?;
    file
      .persist(path)
      .map_err(|err| err.error)
      .with_context(|| format!("persist {path:?}"))?;

    Ok(())
  }

  pub fn load(path: &Path) -> Result<Self> {
    let text = fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;

    Self::parse(&text).with_context(|| format!("parse {path:?}"))
  }
}

/// Parses the lines a server printed between the timing sentinels.
pub fn parse_timing_fragment(lines: &[String]) -> Result<Vec<Sample>, BenchError> {
  let fragment = format!("<Fragment>\n{}\n</Fragment>", lines.join("\n"));
  let root = parse_tree(&fragment)?;

  root
    .children
    .iter()
    .filter(|child| child.name == "Timing")
    .map(parse_sample)
    .collect()
}

fn parse_record(element: &Element) -> Result<RunRecord, BenchError> {
  let name = element
    .attribute("Name")
    .ok_or_else(|| BenchError::malformed("BuildAndRun without a Name attribute"))?;

  let mut mode = BuildMode {
    name: name.to_string(),
    ..BuildMode::default()
  };
  for (field, value) in flags_mut(&mut mode) {
    *value = parse_bool(element.required(field)?.text(), field)?;
  }

  let dropped = match element.child("DroppedIterations") {
    Some(dropped) => dropped
      .text()
      .parse()
      .map_err(|_| BenchError::malformed(format!("DroppedIterations of {name:?} is not a count")))?,
    None => 0,
  };

  let mut record = RunRecord {
    dropped,
    ..RunRecord::new(mode)
  };

  for child in &element.required("Results")?.children {
    match child.name.as_str() {
      "Timing" => record.samples.push(parse_sample(child)?),
      "R2RFails" => record.failures.get_or_insert_with(BTreeSet::new).extend(
        child
          .children
          .iter()
          .filter(|failure| failure.name == "R2RResolutionFailed")
          .map(|failure| failure.text().to_string()),
      ),
      other => {
        return Err(BenchError::malformed(format!("unexpected <{other}> in results of {name:?}")));
      }
    }
  }

  Ok(record)
}

fn parse_sample(element: &Element) -> Result<Sample, BenchError> {
  let phase = element
    .attribute("Phase")
    .ok_or_else(|| BenchError::malformed("Timing without a Phase attribute"))?;

  let msecs = |field: &str| -> Result<f64, BenchError> {
    let text = element.required(field)?.text();
    text
      .parse::<f64>()
      .ok()
      .filter(|value| value.is_finite())
      .ok_or_else(|| BenchError::malformed(format!("{field} {text:?} is not a number")))
  };

  Ok(Sample {
    phase: phase.to_string(),
    total_ms: msecs("TotalTimeMsec")?,
    user_ms: msecs("UserTimeMsec")?,
    system_ms: msecs("SystemTimeMsec")?,
  })
}

fn parse_bool(text: &str, field: &str) -> Result<bool, BenchError> {
  if text.eq_ignore_ascii_case("true") {
    Ok(true)
  } else if text.eq_ignore_ascii_case("false") {
    Ok(false)
  } else {
    Err(BenchError::malformed(format!("{field} {text:?} is not a boolean")))
  }
}

#[derive(Debug, Default)]
struct Element {
  name: String,
  attributes: Vec<(String, String)>,
  children: Vec<Element>,
  text: String,
}

impl Element {
  fn open(start: &BytesStart<'_>) -> Result<Self, BenchError> {
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
      let attribute = attribute.map_err(|err| BenchError::malformed(err.to_string()))?;
      let value = attribute
        .unescape_value()
        .map_err(|err| BenchError::malformed(err.to_string()))?;

      attributes.push((
        String::from_utf8_lossy(attribute.key.as_ref()).into_owned(),
        value.into_owned(),
      ));
    }

    Ok(Self {
      name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
      attributes,
      ..Self::default()
    })
  }

  fn attribute(&self, name: &str) -> Option<&str> {
    self
      .attributes
      .iter()
      .find(|(key, _)| key == name)
      .map(|(_, value)| value.as_str())
  }

  fn child(&self, name: &str) -> Option<&Element> {
    self.children.iter().find(|child| child.name == name)
  }

  fn required(&self, name: &str) -> Result<&Element, BenchError> {
    self
      .child(name)
      .ok_or_else(|| BenchError::malformed(format!("<{}> is missing <{name}>", self.name)))
  }

  fn text(&self) -> &str {
    self.text.trim()
  }
}

/// Builds the element tree of `text` and returns its root element.
fn parse_tree(text: &str) -> Result<Element, BenchError> {
  let mut reader = Reader::from_str(text);
  // The bottom of the stack collects top level elements.
  let mut stack = vec![Element::default()];

  loop {
    let event = reader
      .read_event()
      .map_err(|err| BenchError::malformed(format!("at byte {}: {err}", reader.buffer_position())))?;

    match event {
      Event::Start(start) => stack.push(Element::open(&start)?),
      Event::Empty(start) => {
        let element = Element::open(&start)?;
        if let Some(parent) = stack.last_mut() {
          parent.children.push(element);
        }
      }
      Event::End(_) => {
        let element = stack.pop().filter(|_| !stack.is_empty());
        match (element, stack.last_mut()) {
          (Some(element), Some(parent)) => parent.children.push(element),
          _ => return Err(BenchError::malformed("unbalanced closing tag")),
        }
      }
      Event::Text(text) => {
        let text = text.unescape().map_err(|err| BenchError::malformed(err.to_string()))?;
        if let Some(current) = stack.last_mut() {
          current.text.push_str(&text);
        }
      }
      Event::CData(data) => {
        if let Some(current) = stack.last_mut() {
          current.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
        }
      }
      Event::Eof => break,
      _ => {}
    }
  }

  if stack.len() != 1 {
    return Err(BenchError::malformed("unexpected end of document"));
  }

  let mut top = stack.pop().map(|document| document.children).unwrap_or_default();
  if top.len() != 1 {
    return Err(BenchError::malformed(format!("expected one root element, found {}", top.len())));
  }

  Ok(top.remove(0))
}
