//! Shrink/expand transform between explicit `Part` children and the
//! compact `Parts` blob of a file metadata tree.
//!
//! Shrinking removes every `Part` child, slots it into a `@num`-indexed
//! array (gaps become empty records), and stores the array as one binary
//! `Parts` property. Expanding reverses that and can additionally resolve
//! part locations against a named group, filling `@node` per part.

use num_traits::ToPrimitive;
use tracing::{error, warn};

use crate::endpoint::Endpoint;
use crate::partattr::{serialize_part_attr, PartAttrReader};
use crate::tree::{PropTree, Result};

/// A resolved cluster group: member nodes in rank order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub nodes: Vec<Endpoint>,
    pub replicated: bool,
}

/// Seam for the named group store used when expanding part locations.
pub trait GroupResolver {
    /// Group registered under `name`, if any.
    fn lookup(&self, name: &str) -> Option<Group>;
}

/// Splits a `@group` attribute list on commas outside `[]`/`()` nesting,
/// trimming, lowercasing (except the literal `SuperFiles`), and deduping
/// while preserving order.
pub fn file_groups(grplist: &str) -> Vec<String> {
    let mut groups: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut sq = 0usize;
    let mut pa = 0usize;
    let mut chars = grplist.chars();
    loop {
        let c = chars.next();
        if c.is_none() || (c == Some(',') && sq == 0 && pa == 0) {
            let mut g = current.trim().to_string();
            if !g.is_empty() {
                if g != "SuperFiles" {
                    g = g.to_ascii_lowercase();
                }
                if !groups.contains(&g) {
                    groups.push(g);
                }
            }
            current.clear();
            if c.is_none() {
                break;
            }
        } else if let Some(c) = c {
            match c {
                '[' => sq += 1,
                ']' if sq > 0 => sq -= 1,
                '(' => pa += 1,
                ')' if pa > 0 => pa -= 1,
                _ => {}
            }
            current.push(c);
        }
    }
    groups
}

/// Group list of a file tree: the `@group` attribute, falling back to the
/// single part's `@node` for one-part files. With `check_clusters`, the
/// `Cluster` children are cross-checked against the list and mismatches
/// logged.
pub fn file_groups_of(file: &PropTree, check_clusters: bool) -> Vec<String> {
    let mut groups = file_groups(file.attr("@group").unwrap_or(""));
    if groups.is_empty() && file.attr_u64("@numparts") == Some(1) {
        let node = file
            .children_named("Part")
            .find(|p| p.attr_u64("@num") == Some(1))
            .and_then(|p| p.attr("@node"));
        if let Some(node) = node.filter(|n| !n.is_empty()) {
            groups.push(node.to_string());
            return groups;
        }
    }
    if check_clusters {
        let on = file.child_value("OrigName").unwrap_or("<UNKNOWN>");
        let nc = file.attr_u64("@numclusters").unwrap_or(0) as usize;
        if nc != 0 && nc != groups.len() {
            error!("'{on}' groups/numclusters mismatch");
        }
        let mut found = vec![false; groups.len()];
        let mut anyfound = false;
        for cluster in file.children_named("Cluster") {
            let cname = cluster
                .attr("@roxiePrefix")
                .filter(|s| !s.is_empty())
                .or_else(|| cluster.attr("@name"));
            let Some(cname) = cname.filter(|s| !s.is_empty()) else {
                continue;
            };
            anyfound = true;
            match groups.iter().position(|g| g == cname) {
                Some(i) => {
                    if found[i] {
                        error!("'{on}' has duplicate cluster");
                    } else {
                        found[i] = true;
                    }
                }
                None => {
                    let gs = file.attr("@group").unwrap_or("NULL");
                    error!("'{on}' has missing cluster({cname}) in groups({gs})");
                }
            }
        }
        if anyfound {
            for (i, f) in found.iter().enumerate() {
                if !f {
                    warn!("'{on}' has missing group({}) in clusters", groups[i]);
                }
            }
        }
    }
    groups
}

/// Rolls explicit `Part` children into the compact `Parts` blob. Trees
/// that are already shrunken, have fewer than two parts, carry no group,
/// or hold a single `Part` child are left unchanged.
pub fn shrink_file_tree(file: &mut PropTree) {
    if file.bin("Parts").is_some() {
        return;
    }
    let n = file.attr_u64("@numparts").and_then(|v| v.to_usize()).unwrap_or(0);
    if n < 2 {
        return;
    }
    if file.attr("@group").map_or(true, str::is_empty) {
        return;
    }
    if file.children_named("Part").take(2).count() < 2 {
        return; // don't shrink single part files
    }
    let mut slots: Vec<Option<PropTree>> = (0..n).map(|_| None).collect();
    for part in file.take_children("Part") {
        let num = part.attr_u64("@num").and_then(|v| v.to_usize()).unwrap_or(0);
        if num >= 1 && num <= n && slots[num - 1].is_none() {
            slots[num - 1] = Some(part);
        }
        // out-of-range or duplicate part numbers are dropped
    }
    let mut blob = Vec::new();
    for slot in &slots {
        match slot {
            Some(part) => serialize_part_attr(&mut blob, part),
            None => serialize_part_attr(&mut blob, &PropTree::new("Part")),
        }
    }
    file.set_bin("Parts", blob);
}

/// Unrolls a `Parts` blob back into explicit `Part` children and, with
/// `expand_nodes`, resolves part locations against the named group,
/// filling `@node` for each part number once. When `cluster` names a
/// cluster the file does not carry, the mismatch is logged and nodes are
/// left unresolved.
pub fn expand_file_tree(
    file: &mut PropTree,
    expand_nodes: bool,
    cluster: Option<&str>,
    groups_store: Option<&dyn GroupResolver>,
) -> Result<()> {
    if let Some(blob) = file.remove_bin("Parts") {
        for part in PartAttrReader::new(blob) {
            file.add_child(part?);
        }
    }
    if !expand_nodes {
        return Ok(());
    }
    let groups = file_groups_of(file, false);
    let ng = groups.len();
    let mut cn = 0usize;
    if let Some(cluster) = cluster.filter(|c| !c.is_empty()) {
        match groups.iter().position(|g| g == cluster) {
            Some(i) => cn = i,
            None => {
                error!("expand_file_tree: cluster {cluster} not found in file");
                return Ok(());
            }
        }
    }
    if cn >= ng {
        return Ok(());
    }
    let gname = groups[cn].clone();
    file.set_attr("@group", gname.clone());
    let Some(group) = groups_store.and_then(|s| s.lookup(&gname)) else {
        return Ok(());
    };
    if !group.nodes.is_empty() {
        let mut done: Vec<bool> = Vec::new();
        for part in file.children_mut() {
            if part.name() != "Part" {
                continue;
            }
            let Some(num) = part.attr_u64("@num").filter(|&n| n >= 1) else {
                continue;
            };
            let idx = (num - 1) as usize;
            if done.len() <= idx {
                done.resize(idx + 1, false);
            }
            if !done[idx] {
                done[idx] = true;
                let node = &group.nodes[idx % group.nodes.len()];
                part.set_attr("@node", node.host().to_string());
            }
        }
    }
    if !file.has_attr("@replicated") {
        // legacy files inherit the flag from the cluster's disk mapping
        file.set_attr("@replicated", if group.replicated { "1" } else { "0" });
    }
    Ok(())
}

/// Drops every `Part` child whose zero-based number is not in `keep`.
pub fn filter_parts(file: &mut PropTree, keep: &[usize]) {
    file.retain_children(|c| {
        if c.name() != "Part" {
            return true;
        }
        match c.attr_u64("@num") {
            Some(num) if num >= 1 => keep.contains(&((num - 1) as usize)),
            _ => false,
        }
    });
}
