//! An untyped table of nullable text cells.
//!
//! This is what crosses the query service and cache boundaries. Typed records are decoded from it
//! with serde, going through the csv deserializer so the same rules apply to fresh query results
//! and to snapshots read back from disk.
use crate::{util, ArcStr};
use itertools::Itertools;
use qu::ick_use::*;
use serde::de::DeserializeOwned;
use std::{collections::BTreeSet, fs, io, iter, path::Path, sync::Arc};

/// A single cell. Empty strings are always stored as `None`.
pub type Cell = Option<ArcStr>;

/// Column names plus rows of cells.
///
/// Cloning is cheap, rows are shared. There are no methods that change a `RowSet` once it has been
/// built: transformations return a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSet {
    headers: Vec<ArcStr>,
    rows: Arc<Vec<Vec<Cell>>>,
}

impl RowSet {
    /// Create a table with the given columns and rows.
    ///
    /// Column names must be unique and every row must have one cell per column.
    pub fn from_rows(
        headers: impl IntoIterator<Item = impl Into<ArcStr>>,
        rows: impl IntoIterator<Item = Vec<Cell>>,
    ) -> Result<Self> {
        let headers: Vec<ArcStr> = headers.into_iter().map(Into::into).collect();
        let mut seen = BTreeSet::new();
        for header in &headers {
            ensure!(seen.insert(header.clone()), "duplicate column \"{}\"", header);
        }
        let mut out = Vec::new();
        for (idx, row) in rows.into_iter().enumerate() {
            ensure!(
                row.len() == headers.len(),
                "row {} has {} cells, expected {}",
                idx,
                row.len(),
                headers.len()
            );
            out.push(row.into_iter().map(clean_cell).collect());
        }
        Ok(Self {
            headers,
            rows: Arc::new(out),
        })
    }

    /// Like `from_rows`, with borrowed text cells. Empty text is null.
    pub fn from_text<'a>(
        headers: &[&str],
        rows: impl IntoIterator<Item = &'a [&'a str]>,
    ) -> Result<Self> {
        Self::from_rows(
            headers.iter().copied(),
            rows.into_iter()
                .map(|row| row.iter().map(|cell| Some(ArcStr::from(*cell))).collect()),
        )
    }

    pub fn headers(&self) -> &[ArcStr] {
        &self.headers
    }

    /// Position of the named column.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| &**h == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl ExactSizeIterator<Item = &[Cell]> + '_ {
        self.rows.iter().map(Vec::as_slice)
    }

    /// The cell at `row` in the named column.
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let col = self.column(column)?;
        self.rows.get(row)?.get(col)?.as_deref()
    }

    /// Stack `other` under `self`. Both must have the same columns in the same order.
    pub fn union_all(&self, other: &RowSet) -> Result<Self> {
        ensure!(
            self.headers == other.headers,
            "cannot union tables with different columns: [{}] and [{}]",
            self.headers.iter().join(", "),
            other.headers.iter().join(", ")
        );
        let rows: Vec<Vec<Cell>> = self.rows.iter().chain(other.rows.iter()).cloned().collect();
        ensure!(
            rows.len() == self.len() + other.len(),
            "union lost or duplicated rows"
        );
        Ok(Self {
            headers: self.headers.clone(),
            rows: Arc::new(rows),
        })
    }

    /// Return a copy of this table with every cell in the named column passed through `f`.
    ///
    /// `f` gets the row index and the current value.
    pub fn map_column(
        &self,
        column: &str,
        mut f: impl FnMut(usize, Option<&str>) -> Result<Cell>,
    ) -> Result<Self> {
        let Some(col) = self.column(column) else {
            bail!("no column named \"{}\"", column)
        };
        let rows = self
            .rows
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                let value = clean_cell(f(idx, row[col].as_deref())?);
                let mut row = row.clone();
                row[col] = value;
                Ok(row)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            headers: self.headers.clone(),
            rows: Arc::new(rows),
        })
    }

    /// Decode every row into `T`, matching struct fields to column names.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let headers = csv::StringRecord::from(self.headers.iter().map(|h| &**h).collect_vec());
        self.rows
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                let record = csv::StringRecord::from(
                    row.iter().map(|c| c.as_deref().unwrap_or("")).collect_vec(),
                );
                record
                    .deserialize(Some(&headers))
                    .with_context(|| format!("decoding row {}", idx))
            })
            .collect()
    }

    /// Write as CSV with a header row and a leading unnamed row-index column.
    pub fn write_csv(&self, out: impl io::Write) -> Result {
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(iter::once("").chain(self.headers.iter().map(|h| &**h)))?;
        for (idx, row) in self.rows.iter().enumerate() {
            let idx = idx.to_string();
            writer.write_record(
                iter::once(idx.as_str()).chain(row.iter().map(|c| c.as_deref().unwrap_or(""))),
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read CSV written by `write_csv`. A leading column with an empty name is taken to be the row
    /// index and dropped, so files without one also load.
    pub fn read_csv(input: impl io::Read) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(input);
        let headers = reader.headers()?.clone();
        let skip = match headers.get(0) {
            Some(h) if h.is_empty() => 1,
            _ => 0,
        };
        let mut rows: Vec<Vec<Cell>> = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(
                record
                    .iter()
                    .skip(skip)
                    .map(|c| Some(ArcStr::from(c)))
                    .collect(),
            );
        }
        Self::from_rows(headers.iter().skip(skip), rows)
    }

    /// Load a table from a CSV file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        fn inner(path: &Path) -> Result<RowSet> {
            let reader = io::BufReader::new(fs::File::open(path)?);
            RowSet::read_csv(reader)
        }
        let path = path.as_ref();
        inner(path).with_context(|| format!("unable to load table from \"{}\"", path.display()))
    }

    /// Save a table to a CSV file, creating parent directories and replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        fn inner(this: &RowSet, path: &Path) -> Result {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("could not create parent")?;
            }
            if util::path_exists(path)? {
                event!(Level::DEBUG, "overwriting \"{}\"", path.display());
            }
            let out = io::BufWriter::new(fs::File::create(path)?);
            this.write_csv(out)
        }
        let path = path.as_ref();
        inner(self, path).with_context(|| format!("unable to save table to \"{}\"", path.display()))
    }

    /// The first `max_rows` rows as a terminal table.
    pub fn term_table(&self, max_rows: usize) -> term_data_table::Table<'static> {
        util::head_table(
            self.headers.iter().map(|h| h.to_string()),
            self.rows.iter().map(|row| {
                row.iter()
                    .map(|c| c.as_deref().unwrap_or("").to_string())
                    .collect_vec()
            }),
            max_rows,
        )
    }
}

fn clean_cell(cell: Cell) -> Cell {
    cell.filter(|c| !c.is_empty())
}

#[cfg(test)]
mod test {
    use super::RowSet;

    fn sample() -> RowSet {
        RowSet::from_text(
            &["bnf_code", "bnf_name", "items"],
            [
                &["0101010A0", "Drug X", "500"][..],
                &["0202020B0", "", "12"][..],
            ],
        )
        .unwrap()
    }

    #[test]
    fn empty_text_is_null() {
        let rows = sample();
        assert_eq!(rows.get(1, "bnf_name"), None);
        assert_eq!(rows.get(0, "bnf_name"), Some("Drug X"));
        assert_eq!(rows.get(0, "missing"), None);
    }

    #[test]
    fn csv_has_index_column() {
        let mut out = Vec::new();
        sample().write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            ",bnf_code,bnf_name,items\n0,0101010A0,Drug X,500\n1,0202020B0,,12\n"
        );
        assert_eq!(RowSet::read_csv(text.as_bytes()).unwrap(), sample());
    }

    #[test]
    fn csv_without_index_loads() {
        let text = "bnf_code,bnf_name,items\n0101010A0,Drug X,500\n";
        let rows = RowSet::read_csv(text.as_bytes()).unwrap();
        assert_eq!(rows.headers().len(), 3);
        assert_eq!(rows.get(0, "items"), Some("500"));
    }

    #[test]
    fn rejects_ragged_rows() {
        let res = RowSet::from_text(&["a", "b"], [&["1"][..]]);
        assert!(res.is_err());
        let res = RowSet::from_text(&["a", "a"], []);
        assert!(res.is_err());
    }

    #[test]
    fn union_counts() {
        let a = sample();
        let b = RowSet::from_text(
            &["bnf_code", "bnf_name", "items"],
            [&["0303030C0", "Drug Z", "1"][..]],
        )
        .unwrap();
        let both = a.union_all(&b).unwrap();
        assert_eq!(both.len(), a.len() + b.len());
        assert_eq!(both.get(2, "bnf_name"), Some("Drug Z"));

        let other = RowSet::from_text(&["bnf_code"], []).unwrap();
        assert!(a.union_all(&other).is_err());
    }

    #[test]
    fn map_column_leaves_original() {
        let rows = sample();
        let mapped = rows
            .map_column("items", |_, v| Ok(v.map(|v| format!("{}0", v).into())))
            .unwrap();
        assert_eq!(mapped.get(0, "items"), Some("5000"));
        assert_eq!(rows.get(0, "items"), Some("500"));
        assert!(rows.map_column("nope", |_, _| Ok(None)).is_err());
    }
}
