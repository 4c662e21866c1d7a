//! Matching prescribing onto the reference table by BNF code.
//!
//! Every usage row appears exactly once in the join, carrying all the products that share its BNF
//! code (often one VMP and several AMPs). A row with no products is prescribing that the mapping
//! can't place at all. A row where some matched product lacks a VTM can be placed, but that part
//! of it can't be grouped by substance.
use crate::{
    dmd::{Formulation, Formulations},
    rx::{Usage, Usages},
    util, ArcStr,
};
use noisy_float::prelude::*;
use std::{cmp::Reverse, collections::BTreeMap};
use term_data_table::{Cell, Row, Table};

/// One usage row and the products that share its BNF code.
#[derive(Debug, Clone)]
pub struct Joined<'a> {
    pub usage: &'a Usage,
    pub matches: Vec<&'a Formulation>,
}

impl<'a> Joined<'a> {
    pub fn items(&self) -> f64 {
        self.usage.items
    }

    pub fn has_dmd_match(&self) -> bool {
        !self.matches.is_empty()
    }

    /// Some matching product has no VTM.
    pub fn missing_vtm(&self) -> bool {
        self.matches.iter().any(|f| f.vtm.is_none())
    }
}

/// The result of a right join of usage onto the reference table.
pub struct JoinedTable<'a> {
    rows: Vec<Joined<'a>>,
}

/// Join `usages` onto `formulations` by BNF code, keeping every usage row in order.
///
/// Usage rows without a BNF code never match.
pub fn right_join<'a>(formulations: &'a Formulations, usages: &'a Usages) -> JoinedTable<'a> {
    let rows = usages
        .iter()
        .map(|usage| Joined {
            usage,
            matches: match &usage.bnf_code {
                Some(code) => formulations.find_by_bnf_code(code).collect(),
                None => vec![],
            },
        })
        .collect();
    JoinedTable { rows }
}

impl<'a> JoinedTable<'a> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Joined<'a>> + '_ {
        self.rows.iter()
    }

    /// How many rows a row-per-pair merge would have produced: one per (usage, product) pair,
    /// plus one for each unmatched usage row.
    pub fn pair_count(&self) -> usize {
        self.rows.iter().map(|row| row.matches.len().max(1)).sum()
    }

    /// Usage rows with no product, most prescribed first.
    pub fn without_dmd(&self) -> Vec<&Joined<'a>> {
        let mut out: Vec<_> = self.rows.iter().filter(|row| !row.has_dmd_match()).collect();
        sort_by_items_desc(&mut out);
        out
    }

    /// Usage rows with products where at least one of them has no VTM, most prescribed first.
    ///
    /// Disjoint from `without_dmd`.
    pub fn without_vtm(&self) -> Vec<&Joined<'a>> {
        let mut out: Vec<_> = self
            .rows
            .iter()
            .filter(|row| row.has_dmd_match() && row.missing_vtm())
            .collect();
        sort_by_items_desc(&mut out);
        out
    }

    pub fn summary(&self) -> JoinSummary {
        let without_dmd = self.without_dmd();
        let without_vtm = self.without_vtm();
        JoinSummary {
            usage_rows: self.len(),
            merged_rows: self.pair_count(),
            without_dmd_rows: without_dmd.len(),
            without_vtm_rows: without_vtm.len(),
            total_items: self.rows.iter().map(|row| row.items()).sum(),
            without_dmd_items: total_items(&without_dmd),
            without_vtm_items: total_items(&without_vtm),
        }
    }

    /// Show joined rows, one line each. Matched products are summarised by their first entry.
    pub fn term_table(rows: &[&Joined<'a>], max_rows: usize) -> Table<'static> {
        util::head_table(
            [
                "BNF code",
                "BNF name",
                "items",
                "products",
                "id",
                "name",
                "vtm",
                "vtm name",
            ],
            rows.iter().map(|row| {
                let first = row.matches.first();
                vec![
                    util::opt(row.usage.bnf_code.as_deref()),
                    util::opt(row.usage.bnf_name.as_deref()),
                    row.items().to_string(),
                    row.matches.len().to_string(),
                    util::opt(first.and_then(|f| f.id)),
                    util::opt(first.and_then(|f| f.name.as_deref())),
                    util::opt(first.and_then(|f| f.vtm)),
                    util::opt(first.and_then(|f| f.vtm_name.as_deref())),
                ]
            }),
            max_rows,
        )
    }
}

fn total_items(rows: &[&Joined]) -> f64 {
    rows.iter().map(|row| row.items()).sum()
}

/// Stable, so rows with equal counts keep their order.
fn sort_by_items_desc(rows: &mut [&Joined]) {
    rows.sort_by_key(|row| Reverse(n64(row.items())));
}

/// Mean items per BNF name.
#[derive(Debug, Clone, PartialEq)]
pub struct NameMean {
    pub bnf_name: ArcStr,
    pub mean_items: f64,
    /// How many usage rows had this name.
    pub rows: usize,
}

/// Group rows by BNF name and take the mean item count of each group, highest first.
///
/// Rows without a name are left out. Ties are ordered by name.
pub fn mean_items_by_name(rows: &[&Joined]) -> Vec<NameMean> {
    let mut groups: BTreeMap<ArcStr, (f64, usize)> = BTreeMap::new();
    for row in rows {
        let Some(name) = &row.usage.bnf_name else {
            continue
        };
        let entry = groups.entry(name.clone()).or_insert((0., 0));
        entry.0 += row.items();
        entry.1 += 1;
    }
    let mut out: Vec<NameMean> = groups
        .into_iter()
        .map(|(bnf_name, (sum, rows))| NameMean {
            bnf_name,
            mean_items: sum / rows as f64,
            rows,
        })
        .collect();
    out.sort_by_key(|el| Reverse(n64(el.mean_items)));
    out
}

pub fn name_mean_table(means: &[NameMean], max_rows: usize) -> Table<'static> {
    util::head_table(
        ["BNF name", "mean items", "rows"],
        means.iter().map(|el| {
            vec![
                el.bnf_name.to_string(),
                format!("{:.1}", el.mean_items),
                el.rows.to_string(),
            ]
        }),
        max_rows,
    )
}

/// Headline numbers for the join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSummary {
    pub usage_rows: usize,
    pub merged_rows: usize,
    pub without_dmd_rows: usize,
    pub without_vtm_rows: usize,
    pub total_items: f64,
    pub without_dmd_items: f64,
    pub without_vtm_items: f64,
}

impl JoinSummary {
    pub fn term_table(&self) -> Table<'static> {
        let pct = |part: f64| {
            if self.total_items > 0. {
                format!("{:.2}%", part / self.total_items * 100.)
            } else {
                "-".to_string()
            }
        };
        let mut table = Table::new().with_row(
            Row::new()
                .with_cell(Cell::from(""))
                .with_cell(Cell::from("rows"))
                .with_cell(Cell::from("items"))
                .with_cell(Cell::from("share of items")),
        );
        for (label, rows, items) in [
            ("all prescribing", self.usage_rows, self.total_items),
            ("no dm+d match", self.without_dmd_rows, self.without_dmd_items),
            ("dm+d match, no VTM", self.without_vtm_rows, self.without_vtm_items),
        ] {
            table.add_row(
                Row::new()
                    .with_cell(Cell::from(label))
                    .with_cell(Cell::from(rows.to_string()))
                    .with_cell(Cell::from(items.to_string()))
                    .with_cell(Cell::from(pct(items))),
            );
        }
        table.add_row(
            Row::new()
                .with_cell(Cell::from("one row per product"))
                .with_cell(Cell::from(self.merged_rows.to_string()))
                .with_cell(Cell::from(""))
                .with_cell(Cell::from("")),
        );
        table
    }
}
