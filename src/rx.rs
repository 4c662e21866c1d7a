//! Primary care prescribing, summed by BNF code over a window of months.
use crate::{
    cache::{cached_read, CacheKey, TableCache},
    config::{UsageWindow, USAGE_FILE},
    query::QueryService,
    table::RowSet,
    util, ArcStr,
};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{ops::Deref, sync::Arc};

/// The prescribing query for a window. Both ends are inclusive.
pub fn usage_sql(window: &UsageWindow) -> String {
    format!(
        r#"SELECT
  bnf_code,
  bnf_name,
  SUM(items) AS items
FROM
  ebmdatalab.hscic.normalised_prescribing AS rx
WHERE
  month BETWEEN '{}'
  AND '{}'
GROUP BY
  bnf_name,
  bnf_code"#,
        window.from.format("%Y-%m-%d"),
        window.to.format("%Y-%m-%d")
    )
}

/// Get the prescribing table for `window`.
pub fn extract_usage(
    service: &dyn QueryService,
    cache: &dyn TableCache,
    use_cache: bool,
    window: &UsageWindow,
) -> Result<RowSet> {
    ensure!(
        window.from <= window.to,
        "usage window starts ({}) after it ends ({})",
        window.from,
        window.to
    );
    let sql = usage_sql(window);
    let key = CacheKey::new(USAGE_FILE, sql.clone());
    cached_read(cache, &key, use_cache, || service.execute(&sql))
}

/// A row in the prescribing table: the number of items prescribed under one BNF code and name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub bnf_code: Option<ArcStr>,
    pub bnf_name: Option<ArcStr>,
    pub items: f64,
}

/// The parsed prescribing table.
pub struct Usages {
    els: Arc<Vec<Usage>>,
}

impl Usages {
    pub fn from_rows(rows: &RowSet) -> Result<Self> {
        let els: Vec<Usage> = rows.deserialize().context("decoding prescribing table")?;
        for (idx, el) in els.iter().enumerate() {
            ensure!(
                el.items.is_finite(),
                "row {} has a non-finite item count",
                idx
            );
        }
        Ok(Self::new(els))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Usage> + '_ {
        self.els.iter()
    }

    pub fn total_items(&self) -> f64 {
        self.iter().map(|el| el.items).sum()
    }

    pub fn term_table<'a>(
        els: impl IntoIterator<Item = &'a Usage>,
        max_rows: usize,
    ) -> term_data_table::Table<'static> {
        let els: Vec<&Usage> = els.into_iter().collect();
        util::head_table(
            ["BNF code", "BNF name", "items"],
            els.into_iter().map(|el| {
                vec![
                    util::opt(el.bnf_code.as_deref()),
                    util::opt(el.bnf_name.as_deref()),
                    el.items.to_string(),
                ]
            }),
            max_rows,
        )
    }

    fn new(els: Vec<Usage>) -> Self {
        Self { els: Arc::new(els) }
    }
}

impl Deref for Usages {
    type Target = [Usage];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl FromIterator<Usage> for Usages {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Usage>,
    {
        Self::new(iter.into_iter().collect())
    }
}
