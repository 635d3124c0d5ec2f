//! Server-side sort, filter, and paged windowing over store branches,
//! with a session-keyed result cache.
//!
//! A sort specification is a comma-separated key list. Each key names an
//! attribute (`@` alone means the element name) and may be prefixed with
//! any of `-` (descending), `?` (case-insensitive), and `#` (numeric).
//! Keys are extracted lazily into a per-row slab: a key column is only
//! materialized for rows the comparisons actually touch. Equal keys keep
//! their input order.
//!
//! [`get_elements_paged`] windows the sorted rows. Results are attached to
//! a process-wide cache under a fresh hint from the store's unique-id
//! service; passing that hint back in avoids re-reading and re-sorting
//! the branch, and reuses the cached post-filter decisions. On a hint
//! hit the post-filter passed with the call is ignored in favor of the
//! cached one, so per-call filters are advisory.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use num_traits::ToPrimitive;
use tracing::{debug, warn};

use crate::store::{ConnectMode, CoordConnection, CoordStore, StoreError, STORE_CONNECT_TIMEOUT};
use crate::tree::PropTree;

/// Cached result sets expire this long after their last insertion.
pub const PAGE_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// One sort key with its comparison modifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Attribute to compare; `None` compares element names.
    pub attr: Option<String>,
    /// Descending order.
    pub reverse: bool,
    /// Case-insensitive comparison.
    pub caseless: bool,
    /// Numeric comparison.
    pub numeric: bool,
}

/// Parses a comma-separated sort specification.
pub fn parse_sort_keys(spec: &str) -> Vec<SortKey> {
    let mut keys = Vec::new();
    for raw in spec.split(',') {
        let mut name = raw.trim();
        let mut key =
            SortKey { attr: None, reverse: false, caseless: false, numeric: false };
        loop {
            if let Some(rest) = name.strip_prefix('-') {
                key.reverse = true;
                name = rest;
            } else if let Some(rest) = name.strip_prefix('?') {
                key.caseless = true;
                name = rest;
            } else if let Some(rest) = name.strip_prefix('#') {
                key.numeric = true;
                name = rest;
            } else {
                break;
            }
        }
        if name.is_empty() {
            continue;
        }
        key.attr = if name == "@" { None } else { Some(name.to_string()) };
        keys.push(key);
    }
    keys
}

/// Inclusive name range admitting rows whose `@name` (element name as a
/// fallback) lies within the bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameRange {
    pub lo: Option<String>,
    pub hi: Option<String>,
}

impl NameRange {
    /// Builds a range from optional bounds; `None` with no bounds set.
    pub fn new(lo: Option<&str>, hi: Option<&str>) -> Option<Self> {
        if lo.is_none() && hi.is_none() {
            return None;
        }
        Some(Self { lo: lo.map(str::to_string), hi: hi.map(str::to_string) })
    }

    fn admits(&self, row: &PropTree) -> bool {
        let name = row.attr("@name").unwrap_or_else(|| row.name());
        if let Some(lo) = &self.lo {
            if name < lo.as_str() {
                return false;
            }
        }
        if let Some(hi) = &self.hi {
            if name > hi.as_str() {
                return false;
            }
        }
        true
    }
}

/// Lazily-extracted key slab keyed by `(row, key index)`.
struct KeySlab<'a> {
    rows: &'a [PropTree],
    keys: &'a [SortKey],
    cells: RefCell<Vec<Option<Arc<str>>>>,
}

impl<'a> KeySlab<'a> {
    fn new(rows: &'a [PropTree], keys: &'a [SortKey]) -> Self {
        Self { rows, keys, cells: RefCell::new(vec![None; rows.len() * keys.len()]) }
    }

    fn cell(&self, row: usize, key: usize) -> Arc<str> {
        let slot = row * self.keys.len() + key;
        let mut cells = self.cells.borrow_mut();
        if let Some(v) = &cells[slot] {
            return Arc::clone(v);
        }
        let node = &self.rows[row];
        let text = match &self.keys[key].attr {
            Some(attr) => node.attr(attr).unwrap_or(""),
            None => node.name(),
        };
        let v: Arc<str> = Arc::from(text);
        cells[slot] = Some(Arc::clone(&v));
        v
    }

    fn compare(&self, a: usize, b: usize) -> Ordering {
        for (k, key) in self.keys.iter().enumerate() {
            let va = self.cell(a, k);
            let vb = self.cell(b, k);
            let ord = if key.numeric {
                let na = va.trim().parse::<f64>().unwrap_or(0.0);
                let nb = vb.trim().parse::<f64>().unwrap_or(0.0);
                na.partial_cmp(&nb).unwrap_or(Ordering::Equal)
            } else if key.caseless {
                va.to_ascii_lowercase().cmp(&vb.to_ascii_lowercase())
            } else {
                va.cmp(&vb)
            };
            let ord = if key.reverse { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        // stable: equal keys preserve input order
        a.cmp(&b)
    }
}

/// Sorts rows by the given keys after applying the name range.
pub fn sort_elements(
    rows: Vec<PropTree>,
    keys: &[SortKey],
    range: Option<&NameRange>,
) -> Vec<PropTree> {
    let mut rows = match range {
        Some(r) => rows.into_iter().filter(|row| r.admits(row)).collect::<Vec<_>>(),
        None => rows,
    };
    if keys.is_empty() {
        return rows;
    }
    let order = {
        let slab = KeySlab::new(&rows, keys);
        let mut order: Vec<usize> = (0..rows.len()).collect();
        order.sort_by(|&a, &b| slab.compare(a, b));
        order
    };
    let mut slots: Vec<Option<PropTree>> = rows.drain(..).map(Some).collect();
    order.iter().filter_map(|&i| slots[i].take()).collect()
}

/// Row predicate applied after sorting.
pub type PostFilter = Arc<dyn Fn(&PropTree) -> bool + Send + Sync>;

/// One paged request over a store branch.
#[derive(Clone)]
pub struct PagedQuery {
    /// Branch the rows live under.
    pub base_path: String,
    /// Child element name to select; `*` selects all children.
    pub xpath: String,
    /// Sort specification, parsed by [`parse_sort_keys`].
    pub sort: String,
    /// First (post-filter) row of the window.
    pub start: u64,
    /// Window length.
    pub page_size: u64,
    /// Cache owner key, typically the requesting session's identity.
    pub owner: String,
    /// Cached result set to reuse; zero for none.
    pub hint: u64,
    /// Inclusive lower name bound.
    pub name_lo: Option<String>,
    /// Inclusive upper name bound.
    pub name_hi: Option<String>,
    /// Also count every row passing the post-filter.
    pub want_total: bool,
}

/// One page of results plus the hint for follow-up requests.
pub struct PagedPage {
    pub elements: Vec<PropTree>,
    pub total: Option<u64>,
    pub hint: u64,
}

struct FilterMarks {
    passed: Vec<u64>,
    evaluated: usize,
}

impl FilterMarks {
    fn new() -> Self {
        Self { passed: Vec::new(), evaluated: 0 }
    }

    fn get(&self, idx: usize) -> bool {
        self.passed.get(idx / 64).is_some_and(|w| w & (1 << (idx % 64)) != 0)
    }

    fn set(&mut self, idx: usize, val: bool) {
        let word = idx / 64;
        if self.passed.len() <= word {
            self.passed.resize(word + 1, 0);
        }
        if val {
            self.passed[word] |= 1 << (idx % 64);
        }
    }
}

struct CacheEntry {
    owner: String,
    rows: Arc<Vec<PropTree>>,
    filter: Option<PostFilter>,
    marks: Mutex<FilterMarks>,
    conn: Mutex<Option<Box<dyn CoordConnection>>>,
}

/// Process-wide cache of paged result sets.
pub struct PagedCache {
    cache: moka::sync::Cache<u64, Arc<CacheEntry>>,
}

static GLOBAL: OnceLock<PagedCache> = OnceLock::new();

impl PagedCache {
    /// Cache with an explicit entry TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { cache: moka::sync::Cache::builder().time_to_live(ttl).build() }
    }

    /// The process-wide cache, lazily initialized.
    pub fn global() -> &'static PagedCache {
        GLOBAL.get_or_init(|| PagedCache::with_ttl(PAGE_CACHE_TTL))
    }

    fn take(&self, owner: &str, hint: u64) -> Option<Arc<CacheEntry>> {
        let entry = self.cache.get(&hint)?;
        if entry.owner != owner {
            return None;
        }
        self.cache.invalidate(&hint);
        Some(entry)
    }

    fn put(&self, hint: u64, entry: Arc<CacheEntry>) {
        self.cache.insert(hint, entry);
    }

    /// Drops every cached result set, closing the connections they hold.
    /// Connection-closed errors are swallowed; anything else is logged.
    pub async fn clear(&self) {
        for (_, entry) in self.cache.iter() {
            let conn = entry.conn.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(conn) = conn {
                match conn.close(false).await {
                    Ok(()) | Err(StoreError::ConnectionClosed) => {}
                    Err(e) => warn!("paged cache teardown: {e}"),
                }
            }
        }
        self.cache.invalidate_all();
    }
}

/// Retrieves one page of sorted, filtered children of `base_path` through
/// the process-wide cache. `Ok(None)` means the branch does not exist.
pub async fn get_elements_paged(
    store: &dyn CoordStore,
    query: &PagedQuery,
    post_filter: Option<PostFilter>,
) -> crate::store::Result<Option<PagedPage>> {
    get_elements_paged_in(PagedCache::global(), store, query, post_filter).await
}

/// [`get_elements_paged`] against an explicit cache instance.
pub async fn get_elements_paged_in(
    cache: &PagedCache,
    store: &dyn CoordStore,
    query: &PagedQuery,
    post_filter: Option<PostFilter>,
) -> crate::store::Result<Option<PagedPage>> {
    let cached = if query.hint != 0 { cache.take(&query.owner, query.hint) } else { None };
    let entry = match cached {
        Some(entry) => {
            debug!("paged query reusing hint {}", query.hint);
            entry
        }
        None => {
            let Some(conn) = store
                .connect(&query.base_path, ConnectMode::read(), STORE_CONNECT_TIMEOUT)
                .await?
            else {
                return Ok(None);
            };
            let rows: Vec<PropTree> = conn
                .tree()
                .children()
                .iter()
                .filter(|c| query.xpath == "*" || c.name() == query.xpath)
                .cloned()
                .collect();
            let keys = parse_sort_keys(&query.sort);
            let range = NameRange::new(query.name_lo.as_deref(), query.name_hi.as_deref());
            let rows = sort_elements(rows, &keys, range.as_ref());
            Arc::new(CacheEntry {
                owner: query.owner.clone(),
                rows: Arc::new(rows),
                filter: post_filter,
                marks: Mutex::new(FilterMarks::new()),
                conn: Mutex::new(Some(conn)),
            })
        }
    };

    let start = query.start.to_usize().unwrap_or(usize::MAX);
    let page_size = query.page_size.to_usize().unwrap_or(usize::MAX);
    let mut elements = Vec::new();
    let total = match &entry.filter {
        Some(filter) => {
            let mut marks = entry.marks.lock().unwrap_or_else(PoisonError::into_inner);
            let mut passing = 0usize;
            for (idx, row) in entry.rows.iter().enumerate() {
                let pass = if idx < marks.evaluated {
                    marks.get(idx)
                } else {
                    let pass = filter(row);
                    marks.set(idx, pass);
                    marks.evaluated = idx + 1;
                    pass
                };
                if pass {
                    if passing >= start && elements.len() < page_size {
                        elements.push(row.clone());
                    }
                    passing += 1;
                }
                if !query.want_total && elements.len() >= page_size {
                    break;
                }
            }
            query.want_total.then_some(passing as u64)
        }
        None => {
            elements.extend(
                entry.rows.iter().skip(start).take(page_size).cloned(),
            );
            Some(entry.rows.len() as u64)
        }
    };

    let hint = store.unique_id();
    cache.put(hint, entry);
    Ok(Some(PagedPage { elements, total, hint }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::CoordStore;
    use std::time::Duration;

    fn row(name: &str, size: u64) -> PropTree {
        let mut t = PropTree::new("File");
        t.set_attr("@name", name);
        t.set_attr("@size", size.to_string());
        t
    }

    #[test]
    fn sort_key_spec_parsing() {
        let keys = parse_sort_keys("-#@size,?@name,@");
        assert_eq!(keys.len(), 3);
        assert!(keys[0].reverse && keys[0].numeric);
        assert_eq!(keys[0].attr.as_deref(), Some("@size"));
        assert!(keys[1].caseless);
        assert_eq!(keys[2].attr, None);
    }

    #[test]
    fn numeric_and_reverse_sorting() {
        let rows = vec![row("a", 5), row("b", 40), row("c", 7)];
        let sorted = sort_elements(rows, &parse_sort_keys("-#@size"), None);
        let names: Vec<_> = sorted.iter().map(|r| r.attr("@name").unwrap()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);
    }

    #[test]
    fn equal_keys_preserve_input_order() {
        let rows = vec![row("z", 1), row("y", 1), row("x", 1)];
        let sorted = sort_elements(rows, &parse_sort_keys("#@size"), None);
        let names: Vec<_> = sorted.iter().map(|r| r.attr("@name").unwrap()).collect();
        assert_eq!(names, vec!["z", "y", "x"]);
    }

    #[test]
    fn name_range_is_inclusive() {
        let rows = vec![row("a", 1), row("b", 1), row("c", 1), row("d", 1)];
        let range = NameRange::new(Some("b"), Some("c")).unwrap();
        let kept = sort_elements(rows, &[], Some(&range));
        assert_eq!(kept.len(), 2);
    }

    async fn seeded_store() -> (MemoryStore, crate::store::memory::MemorySession) {
        let store = MemoryStore::new();
        let s = store.session();
        let mut conn = s
            .connect("/Files", ConnectMode::write().with_create(), Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        for i in 0..10u64 {
            conn.tree_mut().add_child(row(&format!("f{i}"), 100 - i));
        }
        conn.commit().await.unwrap();
        conn.close(false).await.unwrap();
        (store, s)
    }

    #[tokio::test]
    async fn pages_window_the_sorted_rows() {
        let (_store, s) = seeded_store().await;
        let cache = PagedCache::with_ttl(PAGE_CACHE_TTL);
        let query = PagedQuery {
            base_path: "/Files".into(),
            xpath: "File".into(),
            sort: "#@size".into(),
            start: 2,
            page_size: 3,
            owner: "tester".into(),
            hint: 0,
            name_lo: None,
            name_hi: None,
            want_total: false,
        };
        let page =
            get_elements_paged_in(&cache, &s, &query, None).await.unwrap().unwrap();
        assert_eq!(page.elements.len(), 3);
        // ascending by size: f9 (91), f8 (92), ... window starts at f7
        assert_eq!(page.elements[0].attr("@name"), Some("f7"));
        assert_eq!(page.total, Some(10));
        assert_ne!(page.hint, 0);
    }

    #[tokio::test]
    async fn hint_reuses_cached_filter_decisions() {
        let (_store, s) = seeded_store().await;
        let cache = PagedCache::with_ttl(PAGE_CACHE_TTL);
        let even: PostFilter =
            Arc::new(|row| row.attr_u64("@size").unwrap_or(0) % 2 == 0);
        let mut query = PagedQuery {
            base_path: "/Files".into(),
            xpath: "File".into(),
            sort: "@name".into(),
            start: 0,
            page_size: 2,
            owner: "tester".into(),
            hint: 0,
            name_lo: None,
            name_hi: None,
            want_total: true,
        };
        let first = get_elements_paged_in(&cache, &s, &query, Some(even)).await.unwrap().unwrap();
        assert_eq!(first.total, Some(5));

        // on a hint hit the per-call filter is advisory: pass none, get
        // the cached one
        query.hint = first.hint;
        query.start = 2;
        let second = get_elements_paged_in(&cache, &s, &query, None).await.unwrap().unwrap();
        assert_eq!(second.total, Some(5));
        assert!(second
            .elements
            .iter()
            .all(|r| r.attr_u64("@size").unwrap() % 2 == 0));
        assert_ne!(second.hint, first.hint);
    }

    #[tokio::test]
    async fn hint_with_wrong_owner_is_ignored() {
        let (_store, s) = seeded_store().await;
        let cache = PagedCache::with_ttl(PAGE_CACHE_TTL);
        let query = PagedQuery {
            base_path: "/Files".into(),
            xpath: "File".into(),
            sort: "@name".into(),
            start: 0,
            page_size: 2,
            owner: "alice".into(),
            hint: 0,
            name_lo: None,
            name_hi: None,
            want_total: false,
        };
        let first = get_elements_paged_in(&cache, &s, &query, None).await.unwrap().unwrap();
        let mut second = query.clone();
        second.owner = "bob".into();
        second.hint = first.hint;
        // falls back to a fresh read rather than alice's cached rows
        let page = get_elements_paged_in(&cache, &s, &second, None).await.unwrap().unwrap();
        assert_eq!(page.elements.len(), 2);
    }

    #[tokio::test]
    async fn missing_branch_yields_none() {
        let store = MemoryStore::new();
        let s = store.session();
        let cache = PagedCache::with_ttl(PAGE_CACHE_TTL);
        let query = PagedQuery {
            base_path: "/Nowhere".into(),
            xpath: "*".into(),
            sort: String::new(),
            start: 0,
            page_size: 5,
            owner: "tester".into(),
            hint: 0,
            name_lo: None,
            name_hi: None,
            want_total: false,
        };
        assert!(get_elements_paged_in(&cache, &s, &query, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_swallows_closed_connections() {
        let (_store, s) = seeded_store().await;
        let cache = PagedCache::with_ttl(PAGE_CACHE_TTL);
        let query = PagedQuery {
            base_path: "/Files".into(),
            xpath: "File".into(),
            sort: String::new(),
            start: 0,
            page_size: 1,
            owner: "tester".into(),
            hint: 0,
            name_lo: None,
            name_hi: None,
            want_total: false,
        };
        get_elements_paged_in(&cache, &s, &query, None).await.unwrap().unwrap();
        cache.clear().await;
        cache.clear().await; // second clear finds nothing to close
    }
}
