//! Brace-list (`prefix{a,b,...}`) expansion into ordered member names.
//!
//! Brace lists form temporary super-files. Members starting with `~` are
//! absolute; all others get the prefix. Wildcard members are expanded
//! through the [`FileDirectory`](super::FileDirectory) seam; without a
//! directory they stay as unresolved wildcard members.

use super::{LogicalName, ParseOptions, Result};

/// Ordered members of a brace list; owned exclusively by their parent.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct MultiName {
    items: Vec<LogicalName>,
}

impl MultiName {
    /// Attempts to read `input` as a brace list. `Ok(None)` means the
    /// input is not one and scalar parsing should proceed.
    pub(crate) fn create(input: &str, opts: ParseOptions<'_>) -> Result<Option<Self>> {
        let t = input.trim();
        if t.len() <= 2 || !t.ends_with('}') {
            return Ok(None);
        }
        let body = &t[..t.len() - 1];
        let Some(brace) = body.find('{') else {
            return Ok(None);
        };
        let prefix = &body[..brace];
        let list = &body[brace + 1..];
        let mut entries: Vec<String> = if list.is_empty() {
            Vec::new()
        } else {
            list.split(',').map(str::to_string).collect()
        };

        let anywilds = entries.iter().any(|e| e.contains('*') || e.contains('?'));
        if anywilds {
            let mut expanded = Vec::new();
            for entry in &entries {
                if !entry.contains('*') && !entry.contains('?') {
                    expanded.push(entry.clone());
                    continue;
                }
                let trimmed = entry.trim_start();
                let pattern = match trimmed.strip_prefix('~') {
                    Some("*") => "?*".to_string(),
                    Some(abs) => abs.to_string(),
                    None => format!("{prefix}{trimmed}"),
                };
                let pattern = pattern.trim().to_ascii_lowercase();
                match opts.directory {
                    Some(dir) => {
                        for name in dir.matching_files(&pattern) {
                            if name
                                .get(..prefix.len())
                                .is_some_and(|p| p.eq_ignore_ascii_case(prefix))
                            {
                                expanded.push(name[prefix.len()..].to_string());
                            } else {
                                // leading ~ so the prefix is not applied twice
                                expanded.push(format!("~{name}"));
                            }
                        }
                    }
                    None => expanded.push(entry.clone()), // unresolved wildcard
                }
            }
            entries = expanded;
            // with wildcards a zero-member list is still a brace list: the
            // name renders as an empty temporary super-file "{}"
            return Ok(Some(Self::build(prefix, &entries, opts)?));
        }
        if entries.is_empty() {
            return Ok(None);
        }
        let multi = Self::build(prefix, &entries, opts)?;
        if multi.items.is_empty() {
            return Ok(None);
        }
        Ok(Some(multi))
    }

    fn build(prefix: &str, entries: &[String], opts: ParseOptions<'_>) -> Result<Self> {
        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            let e = entry.trim_start();
            let item = match e.strip_prefix('~') {
                Some(abs) => LogicalName::parse_entry(abs, opts)?,
                None => LogicalName::parse_entry(&format!("{prefix}{e}"), opts)?,
            };
            items.push(item);
        }
        Ok(Self { items })
    }

    /// Members in declared order.
    pub(crate) fn items(&self) -> &[LogicalName] {
        &self.items
    }

    /// Number of members.
    pub(crate) fn ordinality(&self) -> usize {
        self.items.len()
    }
}
