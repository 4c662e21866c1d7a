use std::{fmt, fs, io, path::Path};
use term_data_table::{Cell, Row, Table};

/// Converts a not found error to Ok(false)
pub fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Values BigQuery and pandas-era snapshots use to mean "no value".
pub fn is_null_text(s: &str) -> bool {
    let s = s.trim();
    s.is_empty()
        || s.eq_ignore_ascii_case("null")
        || s.eq_ignore_ascii_case("nan")
        || s == "<NA>"
}

/// Show an optional value, with nothing for `None`.
pub fn opt<T: fmt::Display>(value: Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

/// Build a terminal table showing at most `max_rows` rows (`0` shows all).
///
/// When rows are dropped, a final row says how many.
pub fn head_table<R, C>(
    headers: impl IntoIterator<Item = impl Into<String>>,
    rows: R,
    max_rows: usize,
) -> Table<'static>
where
    R: IntoIterator<Item = C>,
    R::IntoIter: ExactSizeIterator,
    C: IntoIterator<Item = String>,
{
    let rows = rows.into_iter();
    let total = rows.len();
    let headers: Vec<String> = headers.into_iter().map(Into::into).collect();
    let width = headers.len();

    let mut header_row = Row::new().with_cell(Cell::from(String::new()));
    for header in headers {
        header_row = header_row.with_cell(Cell::from(header));
    }
    let mut table = Table::new().with_row(header_row);

    let shown = if max_rows == 0 { total } else { max_rows.min(total) };
    for (idx, cells) in rows.take(shown).enumerate() {
        let mut row = Row::new().with_cell(Cell::from(idx.to_string()));
        for cell in cells {
            row = row.with_cell(Cell::from(cell));
        }
        table.add_row(row);
    }
    if shown < total {
        let mut row = Row::new().with_cell(Cell::from("..."));
        for _ in 0..width {
            row = row.with_cell(Cell::from("..."));
        }
        table.add_row(row);
        table.add_row(Row::new().with_cell(Cell::from(format!(
            "{} rows, {} shown",
            total, shown
        ))));
    }
    table
}

pub fn header(header: &str) {
    let len = header.len();
    print!("\n{}\n", header);
    for _ in 0..len {
        print!("=");
    }
    println!("\n")
}

#[cfg(test)]
mod test {
    use super::is_null_text;

    #[test]
    fn null_text() {
        for s in ["", "  ", "null", "NULL", "NaN", "<NA>"] {
            assert!(is_null_text(s), "{:?}", s);
        }
        for s in ["0", "na", "none"] {
            assert!(!is_null_text(s), "{:?}", s);
        }
    }
}
