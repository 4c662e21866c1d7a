//! Snapshot cache for query results.
//!
//! A cache entry is identified by a file name and the query text that produced it. A stored
//! snapshot only counts as a hit when it was made from exactly the same query, so editing a query
//! (or the usage window) means it runs again.
use crate::{table::RowSet, util};
use qu::ick_use::*;
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheKey {
    /// File name of the snapshot, e.g. `rx_df.csv`.
    pub name: String,
    /// The query the snapshot answers.
    pub query: String,
}

impl CacheKey {
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
        }
    }
}

pub trait TableCache {
    fn get(&self, key: &CacheKey) -> Result<Option<RowSet>>;
    fn put(&self, key: &CacheKey, rows: &RowSet) -> Result;
}

/// Stores each snapshot as `<dir>/<name>`, with the query text alongside in `<dir>/<name>.sql`.
pub struct CsvCache {
    dir: PathBuf,
}

impl CsvCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn snapshot_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(&key.name)
    }

    pub fn query_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.sql", key.name))
    }
}

impl TableCache for CsvCache {
    fn get(&self, key: &CacheKey) -> Result<Option<RowSet>> {
        let path = self.snapshot_path(key);
        let query_path = self.query_path(key);
        if !util::path_exists(&path)? {
            event!(Level::INFO, "no snapshot at \"{}\"", path.display());
            return Ok(None);
        }
        if !util::path_exists(&query_path)? {
            event!(
                Level::WARN,
                "ignoring snapshot \"{}\": no record of the query that made it",
                path.display()
            );
            return Ok(None);
        }
        let stored = fs::read_to_string(&query_path)
            .with_context(|| format!("reading \"{}\"", query_path.display()))?;
        if stored != key.query {
            event!(
                Level::WARN,
                "ignoring snapshot \"{}\": query has changed",
                path.display()
            );
            return Ok(None);
        }
        event!(Level::INFO, "using snapshot \"{}\"", path.display());
        RowSet::load(&path).map(Some)
    }

    fn put(&self, key: &CacheKey, rows: &RowSet) -> Result {
        let path = self.snapshot_path(key);
        rows.save(&path)?;
        write_query(&self.query_path(key), &key.query)?;
        event!(
            Level::INFO,
            "wrote {} rows to \"{}\"",
            rows.len(),
            path.display()
        );
        Ok(())
    }
}

fn write_query(path: &Path, query: &str) -> Result {
    fs::write(path, query).with_context(|| format!("writing \"{}\"", path.display()))
}

/// Keeps snapshots in memory for the life of the value.
#[derive(Default)]
pub struct MemoryCache {
    entries: RefCell<BTreeMap<CacheKey, RowSet>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl TableCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<RowSet>> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn put(&self, key: &CacheKey, rows: &RowSet) -> Result {
        self.entries.borrow_mut().insert(key.clone(), rows.clone());
        Ok(())
    }
}

/// Get the result of a query, from the cache if allowed and present, otherwise by calling
/// `fetch`. Fresh results are always written back to the cache.
///
/// A failing `fetch` is fatal: there is nothing to fall back to.
pub fn cached_read(
    cache: &dyn TableCache,
    key: &CacheKey,
    use_cache: bool,
    fetch: impl FnOnce() -> Result<RowSet>,
) -> Result<RowSet> {
    if use_cache {
        if let Some(rows) = cache.get(key)? {
            return Ok(rows);
        }
    } else {
        event!(Level::INFO, "cache disabled, running query for {}", key.name);
    }
    let rows = fetch().with_context(|| {
        format!(
            "could not get {}: the query failed and no usable snapshot exists",
            key.name
        )
    })?;
    cache.put(key, &rows)?;
    Ok(rows)
}
