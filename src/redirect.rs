//! Versioned name-redirection table with wildcard substitution.
//!
//! The table lives at `/Files/Redirection`: a `@version` counter plus a
//! `Maps` blob laid out as `u32 count ; (pattern NUL replacement NUL)*`.
//! Rules are matched in order. A rule is a wildcard rule when its pattern
//! holds `*`/`?` or its replacement holds `$`; wildcard matches
//! substitute `$N` back-references. A rule with an empty replacement is a
//! blocker: once it matches, iteration stops with no further results.
//! Non-empty replacements must parse as logical names to be yielded.

use std::io::Cursor;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::lfn::LogicalName;
use crate::store::{
    ConnectMode, CoordStore, Result, StoreError, REDIRECTION_ROOT, SDS_LOCK_TIMEOUT,
};
use crate::dmutex::safe_change_mode_write;
use crate::tree::{read_cstr, write_cstr};

/// Loads from the store are spaced at least this far apart.
pub const MIN_REDIRECTION_LOAD_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    replacement: String,
    matcher: Option<Regex>,
}

impl Rule {
    fn new(pattern: String, replacement: String) -> Self {
        let wild = pattern.contains('*') || pattern.contains('?') || replacement.contains('$');
        let matcher = if wild { wild_regex(&pattern) } else { None };
        Self { pattern, replacement, matcher }
    }

    /// Replacement text when this rule matches `name`.
    fn apply(&self, name: &str) -> Option<String> {
        match &self.matcher {
            Some(rx) => {
                let caps = rx.captures(name)?;
                let mut out = String::new();
                let mut chars = self.replacement.chars().peekable();
                while let Some(c) = chars.next() {
                    if c == '$' {
                        if let Some(d) = chars.peek().and_then(|d| d.to_digit(10)) {
                            chars.next();
                            if let Some(m) = caps.get(d as usize) {
                                out.push_str(m.as_str());
                            }
                            continue;
                        }
                    }
                    out.push(c);
                }
                Some(out)
            }
            None => name.eq_ignore_ascii_case(&self.pattern).then(|| self.replacement.clone()),
        }
    }
}

/// Translates a `*`/`?` glob into an anchored case-insensitive regex with
/// one capture group per wildcard.
fn wild_regex(pattern: &str) -> Option<Regex> {
    let mut rx = String::from("(?i)^");
    for c in pattern.chars() {
        match c {
            '*' => rx.push_str("(.*)"),
            '?' => rx.push_str("(.)"),
            _ => rx.push_str(&regex::escape(&c.to_string())),
        }
    }
    rx.push('$');
    match Regex::new(&rx) {
        Ok(rx) => Some(rx),
        Err(e) => {
            warn!("redirection pattern {pattern} rejected: {e}");
            None
        }
    }
}

/// An immutable snapshot of the rule table.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<Rule>,
    version: u32,
}

impl RuleTable {
    /// Table version counter.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no rules are loaded.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn decode_maps(blob: &[u8]) -> Vec<Rule> {
    let mut src = Cursor::new(blob);
    let Ok(count) = src.read_u32::<BigEndian>() else {
        return Vec::new();
    };
    let mut rules = Vec::new();
    for _ in 0..count {
        let (Ok(pattern), Ok(replacement)) = (read_cstr(&mut src), read_cstr(&mut src)) else {
            warn!("redirection table blob truncated after {} rules", rules.len());
            break;
        };
        rules.push(Rule::new(pattern, replacement));
    }
    rules
}

fn encode_maps(rules: &[(String, String)]) -> Vec<u8> {
    let mut blob = Vec::new();
    blob.extend_from_slice(&(rules.len() as u32).to_be_bytes());
    for (pattern, replacement) in rules {
        write_cstr(&mut blob, pattern);
        write_cstr(&mut blob, replacement);
    }
    blob
}

/// Cached, lazily-reloaded view of the store's redirection table.
pub struct Redirection {
    store: Arc<dyn CoordStore>,
    table: RwLock<Arc<RuleTable>>,
    last_load: Mutex<Option<Instant>>,
    min_reload: Duration,
}

impl Redirection {
    /// Binds the table to a store.
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        Self::with_reload_interval(store, MIN_REDIRECTION_LOAD_INTERVAL)
    }

    /// [`Self::new`] with an explicit reload gate.
    pub fn with_reload_interval(store: Arc<dyn CoordStore>, min_reload: Duration) -> Self {
        Self {
            store,
            table: RwLock::new(Arc::new(RuleTable::default())),
            last_load: Mutex::new(None),
            min_reload,
        }
    }

    fn snapshot(&self) -> Arc<RuleTable> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Current table, reloading from the store when the gate allows.
    pub async fn table(&self) -> Arc<RuleTable> {
        let due = {
            let last = self.last_load.lock().unwrap_or_else(PoisonError::into_inner);
            last.map_or(true, |t| t.elapsed() >= self.min_reload)
        };
        if !due {
            return self.snapshot();
        }
        let loaded = match self.load().await {
            Ok(table) => table,
            Err(e) => {
                // an unreachable store clears the table
                warn!("redirection load failed: {e}");
                RuleTable::default()
            }
        };
        let loaded = Arc::new(loaded);
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&loaded);
        *self.last_load.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        loaded
    }

    async fn load(&self) -> Result<RuleTable> {
        let Some(conn) = self
            .store
            .connect(REDIRECTION_ROOT, ConnectMode::read(), SDS_LOCK_TIMEOUT)
            .await?
        else {
            return Ok(RuleTable::default());
        };
        let tree = conn.tree();
        let version = tree.attr_u32("@version").unwrap_or(0);
        let rules = tree.bin("Maps").map(decode_maps).unwrap_or_default();
        debug!("redirection table v{version} loaded ({} rules)", rules.len());
        let table = RuleTable { rules, version };
        conn.close(false).await?;
        Ok(table)
    }

    /// Matches `name` against the table, in rule order.
    pub async fn resolve(&self, name: &str) -> RedirectMatches {
        RedirectMatches { table: self.table().await, name: name.to_string(), pos: 0, done: false }
    }

    /// Inserts a rule at `index` (clamped), bumps `@version`, rewrites the
    /// blob, and invalidates the local load stamp. An existing rule at
    /// `index` is replaced when `replace` is set.
    pub async fn update(
        &self,
        pattern: &str,
        replacement: &str,
        index: usize,
        replace: bool,
    ) -> Result<()> {
        let mut conn = self
            .store
            .connect(REDIRECTION_ROOT, ConnectMode::read().with_create(), SDS_LOCK_TIMEOUT)
            .await?
            .ok_or(StoreError::Unavailable)?;
        safe_change_mode_write(conn.as_mut(), Some(SDS_LOCK_TIMEOUT)).await?;
        let tree = conn.tree_mut();
        let mut rules: Vec<(String, String)> = tree
            .bin("Maps")
            .map(decode_maps)
            .unwrap_or_default()
            .into_iter()
            .map(|r| (r.pattern, r.replacement))
            .collect();
        let at = index.min(rules.len());
        let rule = (pattern.to_string(), replacement.to_string());
        if replace && at < rules.len() {
            rules[at] = rule;
        } else {
            rules.insert(at, rule);
        }
        let version = tree.attr_u32("@version").unwrap_or(0) + 1;
        tree.set_attr("@version", version.to_string());
        tree.set_bin("Maps", encode_maps(&rules));
        conn.commit().await?;
        conn.close(false).await?;
        *self.last_load.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Iterator over the names a redirection table rewrites an input to.
pub struct RedirectMatches {
    table: Arc<RuleTable>,
    name: String,
    pos: usize,
    done: bool,
}

impl Iterator for RedirectMatches {
    type Item = LogicalName;

    fn next(&mut self) -> Option<LogicalName> {
        while !self.done && self.pos < self.table.rules.len() {
            let rule = &self.table.rules[self.pos];
            self.pos += 1;
            let Some(target) = rule.apply(&self.name) else {
                continue;
            };
            if target.is_empty() {
                // blocker rule: nothing further may match
                self.done = true;
                return None;
            }
            match LogicalName::parse(&target) {
                Ok(lfn) => return Some(lfn),
                Err(e) => debug!("redirection produced invalid name {target}: {e}"),
            }
        }
        None
    }
}
