//! Collapsed-stack artifact decoding.
//!
//! An artifact body is a `#`-prefixed JSON header line followed by one
//! `frame;frame;... <count>` line per distinct stack. Decoding hashes every
//! path prefix and accumulates the line's count into a per-container weight
//! table, so each frame's weight is inclusive of its callees.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::hash::{frame_hash, ROOT_PARENT};
use super::normalize::{ReloadableRules, RuleSet};
use super::{Frame, FrameIndex, WeightTable};

/// Artifact-level decode failures. Any of these drops the whole artifact.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("artifact body is empty")]
    Empty,

    #[error("first line is not a '#' header")]
    MissingHeader,

    #[error("malformed header: {0}")]
    MalformedHeader(#[from] serde_json::Error),
}

/// A single sample line that could not be parsed. The line is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    #[error("missing trailing sample count")]
    MissingCount,

    #[error("invalid sample count {raw:?}")]
    InvalidCount { raw: String },

    #[error("empty stack")]
    EmptyStack,

    #[error("empty frame name at depth {depth}")]
    EmptyFrame { depth: usize },
}

/// Resource summary an agent may attach to an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct MetricSummary {
    pub cpu_avg: f64,
    pub mem_avg: f64,
}

/// JSON metadata from the artifact's header line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArtifactHeader {
    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub service: Option<String>,

    #[serde(default)]
    pub instance_type: Option<String>,

    #[serde(default)]
    pub container_env: Option<String>,

    /// Continuous session (true) or one-off adhoc capture (false).
    #[serde(default = "default_true")]
    pub continuous: bool,

    #[serde(default = "default_api_version")]
    pub api_version: u32,

    /// Lines carry a leading container-name field.
    #[serde(default)]
    pub containers: bool,

    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metrics: Option<MetricSummary>,

    #[serde(default)]
    pub session_html: Option<String>,

    #[serde(default)]
    pub flamegraph_html: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_api_version() -> u32 {
    1
}

impl ArtifactHeader {
    /// Whether sample lines start with a container-name field.
    pub fn has_container_field(&self) -> bool {
        self.api_version >= 2 || self.containers
    }
}

/// Side-blob bodies carried inside an artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideBlobs {
    pub session_html: Option<String>,
    pub flamegraph_html: Option<String>,
}

impl SideBlobs {
    pub fn is_empty(&self) -> bool {
        self.session_html.is_none() && self.flamegraph_html.is_none()
    }
}

/// Per-artifact decode counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Sample lines seen (excluding header, comments and blanks).
    pub lines: u64,
    /// Lines skipped as malformed.
    pub skipped: u64,
    /// Lines discarded as idle.
    pub idle: u64,
    /// Sum of counts over accepted lines.
    pub samples: u64,
}

/// Output of decoding one artifact.
#[derive(Debug, Clone)]
pub struct DecodedArtifact {
    pub header: ArtifactHeader,
    /// Container key ("" when the artifact has no container breakdown) ->
    /// inclusive weight per frame hash.
    pub weights: HashMap<String, WeightTable>,
    pub frames: FrameIndex,
    pub side_blobs: SideBlobs,
    pub metrics: Option<MetricSummary>,
    pub stats: DecodeStats,
    /// First skipped line (1-based line number) and why it was skipped.
    pub first_line_error: Option<(usize, LineError)>,
}

impl DecodedArtifact {
    /// Sum of root-frame weights across containers. Equals
    /// `stats.samples` for every successfully decoded artifact.
    pub fn root_weight(&self) -> u64 {
        self.weights
            .values()
            .flat_map(|table| table.iter())
            .filter(|(hash, _)| {
                self.frames
                    .get(hash)
                    .is_some_and(|f| f.parent_hash == ROOT_PARENT)
            })
            .fold(0u64, |acc, (_, w)| acc.saturating_add(*w))
    }

    /// Number of (container, frame) weight entries.
    pub fn entry_count(&self) -> usize {
        self.weights.values().map(HashMap::len).sum()
    }
}

/// Recognizes stacks rooted in the kernel idle task.
#[derive(Debug, Clone)]
pub struct IdleFilter {
    roots: Vec<String>,
}

impl IdleFilter {
    pub fn new(roots: Vec<String>) -> Self {
        Self { roots }
    }

    /// A root is idle when it equals a configured name or is `<name>/<n>`.
    pub fn is_idle(&self, root: &str) -> bool {
        self.roots.iter().any(|idle| {
            root == idle
                || root
                    .strip_prefix(idle.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

impl Default for IdleFilter {
    fn default() -> Self {
        Self::new(vec!["swapper".to_string()])
    }
}

/// Decoder bound to the live normalization rules.
pub struct StackDecoder {
    rules: Arc<ReloadableRules>,
    idle: IdleFilter,
}

impl StackDecoder {
    pub fn new(rules: Arc<ReloadableRules>, idle: IdleFilter) -> Self {
        Self { rules, idle }
    }

    /// Decodes with a snapshot of the current rules, so one artifact never
    /// sees two rule sets.
    pub fn decode(&self, body: &str) -> Result<DecodedArtifact, DecodeError> {
        let rules = self.rules.current();
        decode_artifact(body, &rules, &self.idle)
    }
}

/// One parsed sample line, borrowing from the artifact body.
#[derive(Debug, PartialEq, Eq)]
struct SampleLine<'a> {
    container: &'a str,
    frames: Vec<&'a str>,
    count: u64,
}

fn parse_line(line: &str, container_field: bool) -> Result<SampleLine<'_>, LineError> {
    let (stack, raw_count) = line.rsplit_once(' ').ok_or(LineError::MissingCount)?;
    let count = raw_count
        .parse::<u64>()
        .map_err(|_| LineError::InvalidCount {
            raw: raw_count.to_string(),
        })?;

    let mut fields = stack.trim_end().split(';');
    let container = if container_field {
        fields.next().unwrap_or("")
    } else {
        ""
    };

    let frames: Vec<&str> = fields.collect();
    match frames.as_slice() {
        [] | [""] => return Err(LineError::EmptyStack),
        _ => {}
    }
    if let Some(depth) = frames.iter().position(|f| f.is_empty()) {
        return Err(LineError::EmptyFrame { depth });
    }

    Ok(SampleLine {
        container,
        frames,
        count,
    })
}

/// Decodes one artifact body.
///
/// Fails only when the header is missing or unparseable; malformed sample
/// lines are counted in [`DecodeStats::skipped`] and decoding continues.
pub fn decode_artifact(
    body: &str,
    rules: &RuleSet,
    idle: &IdleFilter,
) -> Result<DecodedArtifact, DecodeError> {
    let mut lines = body.lines().enumerate();

    let header_line = loop {
        match lines.next() {
            None => return Err(DecodeError::Empty),
            Some((_, l)) if l.trim().is_empty() => continue,
            Some((_, l)) => break l.trim(),
        }
    };
    let json = header_line
        .strip_prefix('#')
        .ok_or(DecodeError::MissingHeader)?;
    let mut header: ArtifactHeader = serde_json::from_str(json.trim())?;
    let container_field = header.has_container_field();

    let mut weights: HashMap<String, WeightTable> = HashMap::new();
    let mut frames = FrameIndex::new();
    let mut stats = DecodeStats::default();
    let mut first_line_error = None;

    for (idx, raw_line) in lines {
        let line = raw_line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        stats.lines += 1;

        let sample = match parse_line(line, container_field) {
            Ok(sample) => sample,
            Err(e) => {
                stats.skipped += 1;
                debug!(line = idx + 1, error = %e, "skipping malformed sample line");
                first_line_error.get_or_insert((idx + 1, e));
                continue;
            }
        };

        if sample.count == 0 {
            continue;
        }
        if sample.frames.first().is_some_and(|root| idle.is_idle(root)) {
            stats.idle += 1;
            continue;
        }

        let table = match weights.get_mut(sample.container) {
            Some(table) => table,
            None => weights.entry(sample.container.to_string()).or_default(),
        };

        let mut parent = ROOT_PARENT;
        for raw in &sample.frames {
            let name = rules.apply(raw);
            let hash = frame_hash(parent, &name);

            let weight = table.entry(hash).or_insert(0);
            *weight = weight.saturating_add(sample.count);

            frames.entry(hash).or_insert_with(|| Frame {
                name: Arc::from(name.as_ref()),
                hash,
                parent_hash: parent,
            });
            parent = hash;
        }

        stats.samples = stats.samples.saturating_add(sample.count);
    }

    let side_blobs = SideBlobs {
        session_html: header.session_html.take(),
        flamegraph_html: header.flamegraph_html.take(),
    };
    let metrics = header.metrics;

    Ok(DecodedArtifact {
        header,
        weights,
        frames,
        side_blobs,
        metrics,
        stats,
        first_line_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;
    use crate::stack::hash::path_hash;

    fn decode(body: &str) -> Result<DecodedArtifact, DecodeError> {
        decode_artifact(body, &RuleSet::default(), &IdleFilter::default())
    }

    fn weight(artifact: &DecodedArtifact, container: &str, path: &[&str]) -> u64 {
        artifact
            .weights
            .get(container)
            .and_then(|t| t.get(&path_hash(path)))
            .copied()
            .unwrap_or(0)
    }

    #[test]
    fn test_decode_simple_tree() {
        let body = "#{\"hostname\":\"h1\"}\nmain;foo;bar 5\nmain;foo;baz 3\n";
        let artifact = decode(body).expect("decodes");

        assert_eq!(artifact.header.hostname, "h1");
        assert_eq!(weight(&artifact, "", &["main"]), 8);
        assert_eq!(weight(&artifact, "", &["main", "foo"]), 8);
        assert_eq!(weight(&artifact, "", &["main", "foo", "bar"]), 5);
        assert_eq!(weight(&artifact, "", &["main", "foo", "baz"]), 3);
        assert_eq!(artifact.root_weight(), 8);
        assert_eq!(artifact.stats.samples, 8);
        assert_eq!(artifact.frames.len(), 4);
    }

    #[test]
    fn test_parent_links() {
        let artifact = decode("#{}\nmain;foo 1\n").expect("decodes");
        let foo = artifact
            .frames
            .get(&path_hash(&["main", "foo"]))
            .expect("foo indexed");
        assert_eq!(foo.parent_hash, path_hash(&["main"]));
        assert_eq!(&*foo.name, "foo");

        let main = artifact
            .frames
            .get(&path_hash(&["main"]))
            .expect("main indexed");
        assert_eq!(main.parent_hash, ROOT_PARENT);
    }

    #[test]
    fn test_malformed_header_fails_artifact() {
        let err = decode("#{bad json\nmain;foo 1\n").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedHeader(_)));
    }

    #[test]
    fn test_missing_header_fails_artifact() {
        let err = decode("main;foo 1\n").unwrap_err();
        assert!(matches!(err, DecodeError::MissingHeader));

        let err = decode("\n\n").unwrap_err();
        assert!(matches!(err, DecodeError::Empty));
    }

    #[test]
    fn test_idle_stacks_excluded() {
        let artifact = decode("#{}\nswapper;foo 10\nswapper/3;bar 4\nmain 2\n").expect("decodes");
        assert_eq!(artifact.stats.idle, 2);
        assert_eq!(artifact.stats.samples, 2);
        assert_eq!(artifact.root_weight(), 2);
        assert_eq!(weight(&artifact, "", &["swapper"]), 0);
        assert!(!artifact.frames.contains_key(&path_hash(&["swapper", "foo"])));
    }

    #[test]
    fn test_idle_filter_prefix_rules() {
        let idle = IdleFilter::default();
        assert!(idle.is_idle("swapper"));
        assert!(idle.is_idle("swapper/12"));
        assert!(!idle.is_idle("swapperd"));
        assert!(!idle.is_idle("main"));
    }

    #[test]
    fn test_malformed_line_skipped() {
        let body = "#{}\nmain;foo 5\nmain;foo notanumber\nnocount\n;; 4\nmain;;x 1\nmain;bar 2\n";
        let artifact = decode(body).expect("decodes");

        assert_eq!(artifact.stats.lines, 6);
        assert_eq!(artifact.stats.skipped, 4);
        assert_eq!(artifact.stats.samples, 7);
        assert_eq!(
            artifact.first_line_error,
            Some((
                3,
                LineError::InvalidCount {
                    raw: "notanumber".to_string()
                }
            ))
        );
        assert_eq!(weight(&artifact, "", &["main"]), 7);
    }

    #[test]
    fn test_parse_line_errors() {
        assert_eq!(parse_line("main", false), Err(LineError::MissingCount));
        assert_eq!(
            parse_line("main x", false),
            Err(LineError::InvalidCount {
                raw: "x".to_string()
            })
        );
        assert_eq!(parse_line(" 3", false), Err(LineError::EmptyStack));
        assert_eq!(parse_line("ctr; 3", true), Err(LineError::EmptyStack));
        assert_eq!(
            parse_line("a;;b 3", false),
            Err(LineError::EmptyFrame { depth: 1 })
        );
    }

    #[test]
    fn test_frame_names_with_spaces() {
        let artifact = decode("#{}\nmain;run (inlined) 4\n").expect("decodes");
        assert_eq!(weight(&artifact, "", &["main", "run (inlined)"]), 4);
    }

    #[test]
    fn test_container_field_peeled_for_api_v2() {
        let body = "#{\"api_version\":2}\nweb;main;foo 3\ndb;main;foo 2\n;main 1\n";
        let artifact = decode(body).expect("decodes");

        assert_eq!(weight(&artifact, "web", &["main", "foo"]), 3);
        assert_eq!(weight(&artifact, "db", &["main", "foo"]), 2);
        assert_eq!(weight(&artifact, "", &["main"]), 1);
        assert_eq!(artifact.root_weight(), 6);
    }

    #[test]
    fn test_container_field_peeled_when_enabled() {
        let artifact =
            decode("#{\"containers\":true}\nweb;main 3\n").expect("decodes");
        assert_eq!(weight(&artifact, "web", &["main"]), 3);

        let artifact = decode("#{}\nweb;main 3\n").expect("decodes");
        assert_eq!(weight(&artifact, "", &["web", "main"]), 3);
    }

    #[test]
    fn test_normalization_merges_frames() {
        let rules = RuleSet::compile(&[RuleConfig {
            pattern: r"-\d+$".to_string(),
            replacement: String::new(),
        }])
        .expect("valid rules");
        let body = "#{}\nmain;worker-1 3\nmain;worker-2 4\n";
        let artifact =
            decode_artifact(body, &rules, &IdleFilter::default()).expect("decodes");

        assert_eq!(weight(&artifact, "", &["main", "worker"]), 7);
        assert_eq!(artifact.frames.len(), 2);
    }

    #[test]
    fn test_recursive_frames_distinct() {
        let artifact = decode("#{}\nmain;work;work;work 2\n").expect("decodes");
        assert_eq!(artifact.frames.len(), 4);
        assert_eq!(weight(&artifact, "", &["main", "work", "work", "work"]), 2);
    }

    #[test]
    fn test_side_blobs_and_metrics_extracted() {
        let body = "#{\"hostname\":\"h\",\"continuous\":false,\"metrics\":{\"cpu_avg\":12.5,\"mem_avg\":40.0},\"session_html\":\"<html></html>\"}\nmain 1\n";
        let artifact = decode(body).expect("decodes");

        assert!(!artifact.header.continuous);
        assert_eq!(
            artifact.metrics,
            Some(MetricSummary {
                cpu_avg: 12.5,
                mem_avg: 40.0
            })
        );
        assert_eq!(
            artifact.side_blobs.session_html.as_deref(),
            Some("<html></html>")
        );
        assert!(artifact.side_blobs.flamegraph_html.is_none());
        assert!(artifact.header.session_html.is_none());
    }

    #[test]
    fn test_conservation_over_mixed_input() {
        let body = "#{}\n\
            a;b;c 7\n\
            a;b 3\n\
            d 11\n\
            swapper;idle 100\n\
            broken line here\n\
            a;x;y;z 9\n\
            # trailing comment\n\
            e;f 0\n";
        let artifact = decode(body).expect("decodes");
        assert_eq!(artifact.stats.samples, 30);
        assert_eq!(artifact.root_weight(), 30);
    }

    #[test]
    fn test_crlf_lines() {
        let artifact = decode("#{\"hostname\":\"w\"}\r\nmain;foo 2\r\n").expect("decodes");
        assert_eq!(artifact.header.hostname, "w");
        assert_eq!(weight(&artifact, "", &["main", "foo"]), 2);
    }
}
