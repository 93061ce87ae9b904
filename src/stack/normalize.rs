use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{NormalizationConfig, RuleConfig};

/// One compiled rewrite rule.
#[derive(Debug)]
struct Rule {
    regex: Regex,
    replacement: String,
}

/// Ordered set of regex rewrites applied to every frame name.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Compiles rules in order. Fails on the first invalid pattern.
    pub fn compile(rules: &[RuleConfig]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let regex = Regex::new(&rule.pattern)
                .with_context(|| format!("compiling normalization pattern {:?}", rule.pattern))?;
            compiled.push(Rule {
                regex,
                replacement: rule.replacement.clone(),
            });
        }
        Ok(Self { rules: compiled })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies every rule in order. Borrows when nothing matched.
    pub fn apply<'a>(&self, name: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(name);
        for rule in &self.rules {
            let replaced = match rule.regex.replace_all(&out, rule.replacement.as_str()) {
                Cow::Owned(s) => Some(s),
                Cow::Borrowed(_) => None,
            };
            if let Some(s) = replaced {
                out = Cow::Owned(s);
            }
        }
        out
    }
}

/// On-disk rules file layout.
#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<RuleConfig>,
}

/// Normalization rules that can be swapped while decoders are running.
///
/// Inline rules from the main config always run first, followed by the
/// rules from `rules_path`. Readers take a cheap `Arc` snapshot; a reload
/// replaces the pointer under a short write lock.
pub struct ReloadableRules {
    inline: Vec<RuleConfig>,
    path: Option<PathBuf>,
    current: RwLock<Arc<RuleSet>>,
    last_modified: Mutex<Option<SystemTime>>,
    missing: AtomicBool,
}

impl ReloadableRules {
    /// Builds the initial rule set. An unreadable or invalid rules file is
    /// an error at startup.
    pub fn new(cfg: &NormalizationConfig) -> Result<Self> {
        let path = cfg.rules_path.clone();
        let mut modified = None;
        let mut all = cfg.rules.clone();

        if let Some(p) = &path {
            all.extend(read_rules_file(p)?);
            modified = file_modified(p);
        }

        let set = RuleSet::compile(&all)?;
        info!(
            rules = set.len(),
            path = ?path,
            "normalization rules loaded"
        );

        Ok(Self {
            inline: cfg.rules.clone(),
            path,
            current: RwLock::new(Arc::new(set)),
            last_modified: Mutex::new(modified),
            missing: AtomicBool::new(false),
        })
    }

    /// Rules from inline config only, no file watching.
    pub fn fixed(rules: RuleSet) -> Self {
        Self {
            inline: Vec::new(),
            path: None,
            current: RwLock::new(Arc::new(rules)),
            last_modified: Mutex::new(None),
            missing: AtomicBool::new(false),
        }
    }

    /// Returns the active rule set.
    pub fn current(&self) -> Arc<RuleSet> {
        Arc::clone(&*self.current.read())
    }

    /// Re-reads the rules file if its modification time changed.
    ///
    /// Returns `Ok(true)` when a new rule set was installed. On error the
    /// previous rule set stays active. A missing file keeps the previous
    /// set and is reported once until the file reappears.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };

        let Some(modified) = file_modified(path) else {
            if !self.missing.swap(true, Ordering::Relaxed) {
                *self.last_modified.lock() = None;
                warn!(path = %path.display(), "normalization rules file missing, keeping previous set");
            }
            return Ok(false);
        };
        if self.missing.swap(false, Ordering::Relaxed) {
            info!(path = %path.display(), "normalization rules file reappeared");
        }
        let modified = Some(modified);
        if *self.last_modified.lock() == modified {
            return Ok(false);
        }

        let mut all = self.inline.clone();
        all.extend(read_rules_file(path)?);
        let set = RuleSet::compile(&all)?;
        let count = set.len();

        *self.current.write() = Arc::new(set);
        *self.last_modified.lock() = modified;

        info!(rules = count, path = %path.display(), "normalization rules reloaded");
        Ok(true)
    }

    /// Polls the rules file until `ctx` is cancelled.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        interval: Duration,
        ctx: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        self.path.as_ref()?;

        let rules = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        debug!("normalization rule watcher stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = rules.reload_if_changed() {
                            warn!(error = %e, "normalization rules reload failed, keeping previous set");
                        }
                    }
                }
            }
        }))
    }
}

fn read_rules_file(path: &Path) -> Result<Vec<RuleConfig>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading rules file {}", path.display()))?;
    let file: RulesFile = serde_yaml::from_str(&data)
        .with_context(|| format!("parsing rules file {}", path.display()))?;
    Ok(file.rules)
}

fn file_modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
