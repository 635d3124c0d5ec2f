//! Logical file name parsing, validation, normalization, and rendering.
//!
//! A logical file name (LFN) is the canonical cluster-wide identifier of a
//! file in the distributed file directory: a `::`-separated path of
//! lowercase scopes ending in a tail. On top of the plain scoped form the
//! grammar carries a trailing `@cluster` hint, `foreign::endpoint::`
//! prefixes addressing another directory instance, `file::endpoint::`
//! names for files outside the logical namespace (including `::>query`
//! names), and `prefix{a,b,...}` brace lists forming ad-hoc super-files.

mod external;
mod multi;

#[cfg(test)]
mod tests;

use std::fmt;

use tracing::{error, warn};

use crate::endpoint::Endpoint;
use crate::tree::PropTree;

pub(crate) use multi::MultiName;

/// Scope naming files held outside the logical namespace.
pub const EXTERNAL_SCOPE: &str = "file";
/// Scope addressing a different directory instance by endpoint.
pub const FOREIGN_SCOPE: &str = "foreign";

/// Canonical name produced for empty input.
const BLANK_NAME: &str = ".::_blank_";

/// Result of logical-name operations with error type [`NameError`].
pub type Result<T> = std::result::Result<T, NameError>;

/// Errors surfaced by logical-name parsing and decomposition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// Wildcards are only allowed for external names and inside an
    /// unresolved brace list.
    #[error("wildcards not allowed in filename ({0})")]
    Wildcard(String),
    /// External-path decomposition was requested of a non-external name.
    #[error("file not external ({0})")]
    NotExternal(String),
    /// An external name is missing its endpoint or directory structure.
    #[error("invalid format for external file ({0})")]
    BadExternal(String),
    /// An external scope embeds an OS path separator.
    #[error("path cannot contain separators, use '::' to separate directories ({0})")]
    PathSeparator(String),
    /// An external scope embeds a bare `:`.
    #[error("path cannot contain single ':', use 'c$' to indicate 'c:' ({0})")]
    SingleColon(String),
    /// An external name has no directory part.
    #[error("no directory specified in external file name ({0})")]
    NoDirectory(String),
    /// The input cannot form a logical name at all.
    #[error("invalid logical name ({0})")]
    Invalid(String),
}

/// Branch kinds a file-metadata node can take in the directory tree.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BranchKind {
    File,
    SuperFile,
    Collection,
    Scope,
    Internal,
}

impl BranchKind {
    /// Element name of this branch kind in the directory tree.
    pub fn branch_name(self) -> &'static str {
        match self {
            BranchKind::File => "File",
            BranchKind::SuperFile => "SuperFile",
            BranchKind::Collection => "Collection",
            BranchKind::Scope => "Scope",
            BranchKind::Internal => "HpccInternal",
        }
    }

    /// Branch kind for a directory-tree element name.
    pub fn from_branch_name(name: &str) -> Option<Self> {
        match name {
            "File" => Some(BranchKind::File),
            "SuperFile" => Some(BranchKind::SuperFile),
            "Collection" => Some(BranchKind::Collection),
            "Scope" => Some(BranchKind::Scope),
            "HpccInternal" => Some(BranchKind::Internal),
            _ => None,
        }
    }
}

/// Directory seam used to expand wildcard members of a brace list.
pub trait FileDirectory {
    /// Logical names matching the lowercase wildcard pattern; matching is
    /// case-insensitive.
    fn matching_files(&self, pattern: &str) -> Vec<String>;
}

/// Options steering [`LogicalName::parse_with`].
#[derive(Default, Clone, Copy)]
pub struct ParseOptions<'a> {
    /// Treat absolute paths, standard I/O names, and `::`-free input as
    /// external remote filenames.
    pub os_path: bool,
    /// Directory consulted to expand wildcard brace-list members.
    pub directory: Option<&'a dyn FileDirectory>,
}

/// True for characters acceptable inside a scope or tail.
pub(crate) fn valid_fname_char(c: char) -> bool {
    c >= ' ' && c < '\u{7f}' && !"*\"/:<>?\\|".contains(c)
}

fn is_sep(c: char) -> bool {
    c == '/' || c == '\\'
}

fn is_absolute_path(s: &str) -> bool {
    let b = s.as_bytes();
    if b.first().is_some_and(|&c| is_sep(c as char)) {
        return true;
    }
    b.len() >= 3 && (b[0] as char).is_ascii_alphabetic() && b[1] == b':' && is_sep(b[2] as char)
}

fn is_std_io(s: &str) -> bool {
    matches!(s, "stdin:" | "stdout:" | "stderr:")
}

/// Skips a leading `scope::` prefix, case-insensitively and tolerating
/// whitespace around the separator; `None` when the scope does not match.
pub fn skip_scope<'a>(name: &'a str, scope: &str) -> Option<&'a str> {
    if scope.is_empty() {
        return Some(name);
    }
    let mut rest = name.trim_start();
    if !rest.get(..scope.len()).is_some_and(|s| s.eq_ignore_ascii_case(scope)) {
        return None;
    }
    rest = rest[scope.len()..].trim_start();
    rest = rest.strip_prefix("::")?;
    Some(rest.trim_start())
}

/// A parsed logical file name in canonical form.
///
/// The canonical string is lowercase except for the query region after a
/// `>` and for characters escaped with `^` in external paths. `tailpos`
/// and `localpos` index into the canonical string: the first byte of the
/// tail, and the first byte past a `foreign::endpoint::` prefix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogicalName {
    lfn: String,
    tailpos: usize,
    localpos: usize,
    external: bool,
    cluster: Option<String>,
    multi: Option<MultiName>,
}

impl LogicalName {
    /// Parses a user string into canonical form.
    pub fn parse(input: &str) -> Result<Self> {
        Self::parse_with(input, ParseOptions::default())
    }

    /// Parses a user string with explicit options.
    pub fn parse_with(input: &str, opts: ParseOptions<'_>) -> Result<Self> {
        let mut name = Self::default();
        name.set_inner(input, opts, false)?;
        Ok(name)
    }

    /// Parses a brace-list member; wildcards stay legal when unresolved.
    pub(crate) fn parse_entry(input: &str, opts: ParseOptions<'_>) -> Result<Self> {
        let mut name = Self::default();
        name.set_inner(input, opts, true)?;
        Ok(name)
    }

    /// Joins a scope path and a tail and parses the result. A tail that is
    /// absolute (leading `~`) or an empty side falls back to parsing the
    /// tail alone.
    pub fn from_scopes(scopes: &str, tail: &str) -> Result<Self> {
        let scopes = scopes.trim();
        let trimmed = tail.trim_start();
        if scopes.is_empty() || trimmed.is_empty() || trimmed.starts_with('~') {
            return Self::parse(tail);
        }
        let mut s = scopes.to_string();
        if !s.ends_with("::") {
            s.push_str("::");
        }
        s.push_str(trimmed);
        let out = Self::parse(&s)?;
        if out.is_multi() {
            warn!("scope join produced multi name {}", out.get(false));
        }
        Ok(out)
    }

    /// Builds an external name for a local path under an endpoint.
    pub fn from_external(ep: &Endpoint, path: &str) -> Result<Self> {
        let encoded = external::encode_external(ep, path)?;
        let mut name = Self::default();
        name.set_inner(&encoded, ParseOptions::default(), false)?;
        Ok(name)
    }

    /// Builds a query name (`file::endpoint::>query`); the query text is
    /// kept case-preserved.
    pub fn from_query(ep: &Endpoint, query: &str) -> Self {
        let mut lfn = format!("{EXTERNAL_SCOPE}::{}::>", ep.url());
        let tailpos = lfn.len() - 1;
        lfn.push_str(query.trim());
        Self { lfn, tailpos, localpos: 0, external: true, cluster: None, multi: None }
    }

    /// Derives a logical name from a physical part mask path such as
    /// `.../scope/name._1_of_3`, stripping `root_dir` and the drive.
    pub fn from_mask(fname: &str, root_dir: &str) -> Option<Self> {
        if fname.is_empty() {
            return None;
        }
        let windows = fname.contains('\\');
        let mut dir = root_dir;
        let mut f = fname;
        if windows {
            if dir.as_bytes().get(1) == Some(&b':') {
                dir = &dir[2..];
            }
            if f.as_bytes().get(1) == Some(&b':') {
                f = &f[2..];
            }
        } else {
            if dir.as_bytes().get(2) == Some(&b'$') {
                dir = &dir[3..];
            }
            if f.as_bytes().get(2) == Some(&b'$') {
                f = &f[3..];
            }
        }
        if f.starts_with(is_sep) {
            let common = dir.bytes().zip(f.bytes()).take_while(|(a, b)| a == b).count();
            if common < dir.len() || !f[common..].starts_with(is_sep) {
                return None; // didn't match base
            }
            f = &f[common + 1..];
        }
        let mut logical = String::new();
        let chars: Vec<char> = f.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if is_sep(c) {
                logical.push_str("::");
            } else if c == '.'
                && !chars[i + 1..].iter().any(|&x| is_sep(x) || x == '.')
                && chars.get(i + 1) == Some(&'_')
            {
                // candidate part-mask suffix: ._N_of_M
                let rest: String = chars[i + 1..].iter().collect();
                let lower = rest.to_ascii_lowercase();
                if let Some(p) = lower[1..].find("_of_") {
                    if lower.len() > 1 + p + 4 {
                        return Self::parse(&logical).ok();
                    }
                }
                return None;
            } else {
                logical.push(c.to_ascii_lowercase());
            }
            i += 1;
        }
        None // never found the tail
    }

    /// Validates a user string against the name grammar; `true` means the
    /// value now holds the parsed name. At most one leading `~` is
    /// accepted, wildcards only inside a brace list or an external name.
    pub fn set_validate(&mut self, raw: &str, strip_foreign: bool) -> bool {
        self.set_validate_with(raw, strip_foreign, ParseOptions::default())
    }

    /// [`Self::set_validate`] with explicit parse options.
    pub fn set_validate_with(
        &mut self,
        raw: &str,
        strip_foreign: bool,
        opts: ParseOptions<'_>,
    ) -> bool {
        let mut s = raw.trim_start();
        if let Some(rest) = s.strip_prefix('~') {
            s = rest.trim_start();
        }
        if s.starts_with('~') {
            return false;
        }
        if opts.os_path && (is_absolute_path(s) || is_std_io(s) || !raw.contains("::")) {
            return self.set_inner(raw, opts, false).is_ok();
        }
        let mut effective = raw;
        let foreign = skip_scope(s, FOREIGN_SCOPE);
        if let Some(ns) = foreign {
            if let Some(p) = ns.find("::") {
                s = &ns[p + 2..];
                if strip_foreign {
                    effective = s;
                    s = s.trim_start();
                }
            }
        } else if let Some(es) = skip_scope(s, EXTERNAL_SCOPE) {
            if let Some(p) = es.find("::") {
                if es.as_bytes().get(p + 2) == Some(&b'>') {
                    return self.set_inner(raw, opts, false).is_ok();
                }
                s = &es[p + 2..];
            }
        }
        let b = s.as_bytes();
        let mut i = 0;
        let mut sc = 0usize;
        let mut inmulti = 0usize;
        loop {
            while i < b.len() && b[i] != b':' {
                let c = b[i] as char;
                if !valid_fname_char(c) && (inmulti == 0 || (c != '?' && c != '*')) {
                    return false;
                }
                if c == '{' {
                    inmulti += 1;
                } else if inmulti > 0 && c == '}' {
                    inmulti -= 1;
                }
                if c != ' ' {
                    sc += 1;
                }
                i += 1;
            }
            if i >= b.len() {
                if sc == 0 {
                    return false;
                }
                return self.set_inner(effective, opts, false).is_ok();
            }
            if sc == 0 {
                return false;
            }
            if b.get(i + 1) != Some(&b':') {
                return false;
            }
            i += 2;
            sc = 0;
        }
    }

    /// True when the value holds a name.
    pub fn is_set(&self) -> bool {
        !self.lfn.is_empty()
    }

    /// Canonical text; `strip_foreign` removes a `foreign::endpoint::`
    /// prefix.
    pub fn get(&self, strip_foreign: bool) -> &str {
        if strip_foreign {
            if self.multi.is_some() {
                warn!("foreign strip requested on multi name {}", self.lfn);
            }
            &self.lfn[self.localpos..]
        } else {
            &self.lfn
        }
    }

    /// Canonical text.
    pub fn as_str(&self) -> &str {
        &self.lfn
    }

    /// Final path component. A tail holding `::` is a latent invariant
    /// violation: logged and tolerated.
    pub fn tail(&self) -> &str {
        if self.multi.is_some() {
            warn!("tail requested on multi name {}", self.lfn);
        }
        let tail = &self.lfn[self.tailpos..];
        if tail.contains("::") {
            error!("tail contains '::' ({})", self.lfn);
        }
        tail
    }

    /// Leading scopes without the trailing `::`.
    pub fn scopes(&self, strip_foreign: bool) -> &str {
        if self.multi.is_some() {
            warn!("scopes requested on multi name {}", self.lfn);
        }
        if self.tailpos <= 2 {
            return "";
        }
        let end = self.tailpos - 2;
        if strip_foreign {
            if end <= self.localpos {
                return "";
            }
            &self.lfn[self.localpos..end]
        } else {
            &self.lfn[..end]
        }
    }

    /// Number of scopes preceding the tail.
    pub fn num_scopes(&self, strip_foreign: bool) -> usize {
        if self.multi.is_some() {
            warn!("scopes requested on multi name {}", self.lfn);
        }
        self.lfn[if strip_foreign { self.localpos } else { 0 }..].matches("::").count()
    }

    /// Path component at `idx`, counting from the start of the (optionally
    /// foreign-stripped) name; the last index yields the tail.
    pub fn scope(&self, idx: usize, strip_foreign: bool) -> Option<&str> {
        if self.multi.is_some() {
            warn!("scopes requested on multi name {}", self.lfn);
        }
        self.lfn[if strip_foreign { self.localpos } else { 0 }..].split("::").nth(idx)
    }

    /// Cluster hint given as a trailing `@cluster`, lowercase.
    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    /// Replaces the cluster hint.
    pub fn set_cluster(&mut self, cname: &str) {
        if self.multi.is_some() {
            warn!("cluster set on multi name {}", self.lfn);
        }
        let c = cname.trim().to_ascii_lowercase();
        self.cluster = if c.is_empty() { None } else { Some(c) };
    }

    /// True for `file::endpoint::...` names (or a brace list holding one).
    pub fn is_external(&self) -> bool {
        self.external
    }

    /// True for `foreign::endpoint::...` names (a brace list is foreign when
    /// any member is).
    pub fn is_foreign(&self) -> bool {
        if self.localpos != 0 {
            return true;
        }
        match &self.multi {
            Some(m) => m.items().iter().any(LogicalName::is_foreign),
            None => false,
        }
    }

    /// True for external names whose path region is a `>query`.
    pub fn is_query(&self) -> bool {
        self.external && self.lfn[self.tailpos..].starts_with('>')
    }

    /// True when the name is a brace list.
    pub fn is_multi(&self) -> bool {
        self.multi.is_some()
    }

    /// Number of brace-list members; zero for scalar names.
    pub fn multi_ordinality(&self) -> usize {
        self.multi.as_ref().map_or(0, MultiName::ordinality)
    }

    /// Brace-list member at `idx`.
    pub fn multi_item(&self, idx: usize) -> Option<&LogicalName> {
        self.multi.as_ref().and_then(|m| m.items().get(idx))
    }

    /// Endpoint of a foreign or external name.
    pub fn endpoint(&self) -> Option<Endpoint> {
        let rest = if self.external {
            skip_scope(&self.lfn, EXTERNAL_SCOPE)
        } else if self.is_foreign() {
            skip_scope(&self.lfn, FOREIGN_SCOPE)
        } else {
            None
        }?;
        if self.multi.is_some() {
            warn!("endpoint requested on multi name {}", self.lfn);
        }
        let end = rest.find("::")?;
        rest[..end].parse().ok()
    }

    /// Group name of an external name (the endpoint text).
    pub fn group_name(&self) -> Option<&str> {
        if !self.external {
            return None;
        }
        let rest = skip_scope(&self.lfn, EXTERNAL_SCOPE)?;
        let end = rest.find("::")?;
        Some(&rest[..end])
    }

    /// Prefixes the name with `foreign::endpoint::`. External names are
    /// left alone; with `check_local`, already-foreign names are too.
    pub fn set_foreign(&mut self, ep: &Endpoint, check_local: bool) -> Result<()> {
        if self.is_external() || (check_local && self.is_foreign()) {
            return Ok(());
        }
        let s = format!("{FOREIGN_SCOPE}::{}::{}", ep.url(), self.get(true));
        self.set_inner(&s, ParseOptions::default(), false)
    }

    /// Strips a `foreign::endpoint::` prefix.
    pub fn clear_foreign(&mut self) -> Result<()> {
        if self.is_foreign() {
            let s = self.get(true).to_string();
            self.set_inner(&s, ParseOptions::default(), false)?;
        }
        Ok(())
    }

    /// XPath of the containing scope, `Scope[@name="..."]` per level,
    /// optionally rooted at the directory root.
    pub fn scope_query(&self, absolute: bool) -> String {
        if self.multi.is_some() {
            warn!("scope query requested on multi name {}", self.lfn);
        }
        let mut query = String::new();
        if absolute {
            query.push_str(crate::store::FILES_ROOT);
            query.push('/');
        }
        let mut s = self.get(true);
        let mut first = true;
        while let Some(e) = s.find("::") {
            if first {
                first = false;
            } else {
                query.push('/');
            }
            query.push_str("Scope[@name=\"");
            query.push_str(&s[..e]);
            query.push_str("\"]");
            s = &s[e + 2..];
        }
        query
    }

    /// XPath of the file branch itself: the scope query plus
    /// `<Branch>[@name="tail"]`.
    pub fn fullname_query(&self, kind: BranchKind, absolute: bool) -> String {
        let mut query = self.scope_query(absolute);
        query.push('/');
        query.push_str(kind.branch_name());
        query.push_str("[@name=\"");
        query.push_str(self.tail());
        query.push_str("\"]");
        query
    }

    /// Local directory and tail of an external name; see the module docs
    /// for the decoding rules.
    pub fn external_parts(&self, windows: bool) -> Result<(String, String)> {
        external::decode_external(self, windows)
    }

    /// Host-prefixed remote directory and tail of an external name
    /// (`\\host\dir\` or `//host/dir/`).
    pub fn external_path(&self, windows: bool) -> Result<(String, String)> {
        external::remote_path(self, windows)
    }

    /// Builds the temporary super-file tree describing a brace list.
    pub fn create_super_tree(&self) -> Option<PropTree> {
        let multi = self.multi.as_ref()?;
        let mut tree = PropTree::new("SuperFile");
        let mut numsub = 0u32;
        for item in multi.items() {
            numsub += 1;
            let mut sub = PropTree::new("SubFile");
            sub.set_attr("@name", item.get(false));
            sub.set_attr("@num", numsub.to_string());
            tree.add_child(sub);
        }
        let mut orig = PropTree::new("OrigName");
        orig.set_value(self.get(false));
        tree.add_child(orig);
        tree.set_attr("@numsubfiles", numsub.to_string());
        tree.set_attr("@interleaved", "2");
        tree.set_attr("@name", "__TEMP__");
        tree.set_attr("@modified", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string());
        Some(tree)
    }

    fn clear(&mut self) {
        self.lfn.clear();
        self.tailpos = 0;
        self.localpos = 0;
        self.external = false;
        self.multi = None;
    }

    pub(crate) fn set_inner(
        &mut self,
        input: &str,
        opts: ParseOptions<'_>,
        in_multi: bool,
    ) -> Result<()> {
        self.clear();
        self.cluster = None;
        let input = input.trim_start();
        match MultiName::create(input, opts) {
            Ok(Some(m)) => {
                let mut full = String::from("{");
                for (i, item) in m.items().iter().enumerate() {
                    if i > 0 {
                        full.push(',');
                    }
                    full.push_str(item.get(false));
                    if item.is_external() {
                        self.external = true;
                    }
                }
                full.push('}');
                self.lfn = full;
                self.multi = Some(m);
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => warn!("brace list rejected ({input}): {e}"),
        }
        if opts.os_path
            && (is_absolute_path(input) || is_std_io(input) || !input.contains("::"))
        {
            let encoded = external::encode_os_path(input)?;
            return self.set_inner(&encoded, ParseOptions::default(), false);
        }

        // consume leading '~' runs
        let mut name: &str = input;
        while let Some(rest) = name.strip_prefix('~') {
            name = rest.trim_start();
        }
        let mut name = name.to_string();

        // cluster suffix: last '@' after the last ':', with '@@'/'@^' as escape
        let mut ct: Option<usize> = None;
        let mut wild = false;
        for (i, c) in name.char_indices() {
            match c {
                '@' => ct = Some(i),
                ':' => ct = None,
                '?' | '*' => wild = true,
                _ => {}
            }
        }
        let isext = name
            .get(..EXTERNAL_SCOPE.len() + 2)
            .is_some_and(|s| s.eq_ignore_ascii_case("file::"));
        if !isext && wild && !in_multi {
            return Err(NameError::Wildcard(name));
        }
        if !isext {
            if let Some(p) = ct.filter(|&p| p >= 1) {
                let next = name.as_bytes().get(p + 1);
                if next == Some(&b'@') || next == Some(&b'^') {
                    name = format!("{}{}", &name[..p], &name[p + 1..]);
                } else {
                    let suffix = name[p + 1..].trim().to_ascii_lowercase();
                    if !suffix.is_empty() {
                        self.cluster = Some(suffix);
                    }
                    name.truncate(p); // trailing @ alone means no cluster
                }
            }
        }
        if name.is_empty() {
            name = BLANK_NAME.to_string();
        }

        let mut out = String::new();
        let mut rest: &str = &name;
        match name.find("::") {
            Some(pos) => {
                if pos == 0 {
                    out.push('.');
                } else {
                    let first = name[..pos].trim_end();
                    out.push_str(first);
                    rest = &name[pos..];
                    if isext {
                        let s1 = &name[pos + 2..];
                        if let Some(np) = s1.find("::") {
                            if let Ok(ep) = s1[..np].trim().parse::<Endpoint>() {
                                out.push_str("::");
                                out.push_str(&ep.url());
                                self.external = true;
                                rest = &s1[np..];
                                if s1.as_bytes().get(np + 2) == Some(&b'>') {
                                    out.push_str("::");
                                    self.tailpos = out.len();
                                    out.make_ascii_lowercase();
                                    out.push_str(&s1[np + 2..]); // query kept case-preserved
                                    self.lfn = out;
                                    return Ok(());
                                }
                            }
                        }
                    } else if first.eq_ignore_ascii_case(FOREIGN_SCOPE) {
                        let s1 = &name[pos + 2..];
                        if let Some(np) = s1.find("::") {
                            if let Ok(ep) = s1[..np].trim().parse::<Endpoint>() {
                                out.push_str("::");
                                out.push_str(&ep.url());
                                self.localpos = out.len() + 2;
                                rest = &s1[np..];
                            }
                        }
                    }
                }
                loop {
                    rest = &rest[2..];
                    match rest.find("::") {
                        Some(ns) => {
                            out.push_str("::");
                            out.push_str(rest[..ns].trim());
                            rest = &rest[ns..];
                        }
                        None => break,
                    }
                }
            }
            None => {
                out.push('.');
            }
        }
        out.push_str("::");
        self.tailpos = out.len();
        let tail = rest.trim();
        if tail.contains("::") {
            error!("tail contains '::' ({tail})");
        }
        out.push_str(tail);
        out.make_ascii_lowercase();
        self.lfn = out;
        Ok(())
    }
}

impl fmt::Display for LogicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lfn)
    }
}
