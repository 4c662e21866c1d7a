//! The dm+d side of the mapping: VMPs and AMPs with their BNF codes and VTMs.
//!
//! VMPs carry their VTM directly. AMPs don't, so they are joined through their VMP. Both branches
//! left join the VTM table, because plenty of products (devices, appliances, and anything with
//! more than a few ingredients) have no VTM at all.
use crate::{
    cache::{cached_read, CacheKey, TableCache},
    config::RAW_REFERENCE_FILE,
    normalize,
    query::QueryService,
    table::RowSet,
    util, ArcStr,
};
use chrono::NaiveDate;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    ops::{Bound, Deref},
    path::Path,
    sync::Arc,
};
use term_data_table::{Cell, Row, Table};

/// A dm+d identifier (a SNOMED CT concept ID).
pub type DmdId = u64;

/// VMPs, with their VTM and the VMP they replaced, if any.
pub const VMP_SQL: &str = r#"SELECT
  "vmp" AS type,
  vmp.id AS id,
  vmp.nm AS nm,
  vmp.vtm AS vtm,
  vtm.nm AS vtm_nm,
  vmp.bnf_code AS bnf_code,
  vmp.vpidprev AS vmp_previous,
  vmp.vpiddt AS vmp_previous_date
FROM
  ebmdatalab.dmd.vmp_full AS vmp
LEFT OUTER JOIN
  dmd.vtm AS vtm
ON
  vmp.vtm = vtm.id"#;

/// AMPs, with the VTM of their VMP. AMPs have no predecessor columns.
pub const AMP_SQL: &str = r#"SELECT
  "amp" AS type,
  amp.id AS id,
  amp.descr AS nm,
  vmp.vtm AS vtm,
  vtm.nm AS vtm_nm,
  amp.bnf_code AS bnf_code,
  NULL AS vmp_previous,
  NULL AS vmp_previous_date
FROM
  ebmdatalab.dmd.amp_full AS amp
INNER JOIN
  dmd.vmp AS vmp
ON
  amp.vmp = vmp.id
LEFT OUTER JOIN
  dmd.vtm AS vtm
ON
  vmp.vtm = vtm.id"#;

/// The whole reference query. This is what the snapshot is keyed on.
pub fn reference_sql() -> String {
    format!("{}\n\nUNION ALL\n\n{}", VMP_SQL, AMP_SQL)
}

/// Get the raw reference table, VMPs first then AMPs.
///
/// The two branches are fetched separately and stacked here, so we can check nothing went missing
/// in the union.
pub fn extract_reference(
    service: &dyn QueryService,
    cache: &dyn TableCache,
    use_cache: bool,
) -> Result<RowSet> {
    let key = CacheKey::new(RAW_REFERENCE_FILE, reference_sql());
    cached_read(cache, &key, use_cache, || {
        let vmps = service.execute(VMP_SQL).context("fetching VMPs")?;
        let amps = service.execute(AMP_SQL).context("fetching AMPs")?;
        let all = vmps.union_all(&amps).context("combining VMPs and AMPs")?;
        event!(
            Level::INFO,
            "{} VMPs + {} AMPs = {} products",
            vmps.len(),
            amps.len(),
            all.len()
        );
        Ok(all)
    })
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormulationKind {
    /// Virtual medicinal product: the generic formulation.
    Vmp,
    /// Actual medicinal product: a particular supplier's product.
    Amp,
}

impl fmt::Display for FormulationKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FormulationKind::Vmp => f.write_str("vmp"),
            FormulationKind::Amp => f.write_str("amp"),
        }
    }
}

/// A row in the reference table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formulation {
    #[serde(rename = "type")]
    pub kind: FormulationKind,
    pub id: Option<DmdId>,
    #[serde(rename = "nm")]
    pub name: Option<ArcStr>,
    pub vtm: Option<DmdId>,
    #[serde(rename = "vtm_nm")]
    pub vtm_name: Option<ArcStr>,
    pub bnf_code: Option<ArcStr>,
    /// The VMP this one replaced. Always `None` for AMPs.
    #[serde(rename = "vmp_previous")]
    pub previous_id: Option<DmdId>,
    /// When `previous_id` stopped being used.
    #[serde(rename = "vmp_previous_date")]
    pub previous_date: Option<NaiveDate>,
}

/// The parsed reference table, with a pre-built index on BNF code.
pub struct Formulations {
    els: Arc<Vec<Formulation>>,
    bnf_idx: BTreeMap<ArcStr, Vec<usize>>,
}

impl Formulations {
    /// Decode a table whose identifier columns have already been normalized.
    pub fn from_rows(rows: &RowSet) -> Result<Self> {
        let els = rows
            .deserialize()
            .context("decoding reference table (are the identifier columns normalized?)")?;
        Ok(Self::new(els))
    }

    /// Normalize the identifier columns of a raw table, then decode it.
    pub fn from_raw(raw: &RowSet) -> Result<Self> {
        Self::from_rows(&normalize::normalize_columns(raw, &normalize::ID_COLUMNS)?)
    }

    /// Load the normalized mapping file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        ensure!(
            util::path_exists(path)?,
            "no mapping file at \"{}\", run `bnf_to_dmd` first",
            path.display()
        );
        Self::from_rows(&RowSet::load(path)?)
            .with_context(|| format!("while loading \"{}\"", path.display()))
    }

    /// All products with exactly this BNF code.
    pub fn find_by_bnf_code(&self, code: &str) -> impl Iterator<Item = &Formulation> + '_ {
        self.bnf_idx
            .get(code)
            .into_iter()
            .flatten()
            .map(move |idx| &self.els[*idx])
    }

    /// All products whose BNF code starts with `prefix`, ordered by BNF code.
    ///
    /// BNF codes are hierarchical, so a prefix selects a chapter, section, chemical, etc.
    pub fn find_by_bnf_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a Formulation> + 'a {
        self.bnf_idx
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(code, _)| code.starts_with(prefix))
            .flat_map(|(_, idxs)| idxs.iter())
            .map(move |idx| &self.els[*idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Formulation> + '_ {
        self.els.iter()
    }

    /// Count products with missing BNF codes or VTMs.
    pub fn coverage(&self) -> ReferenceCoverage {
        let mut coverage = ReferenceCoverage {
            vmp: KindCoverage::new(FormulationKind::Vmp),
            amp: KindCoverage::new(FormulationKind::Amp),
        };
        for el in self.iter() {
            let counts = match el.kind {
                FormulationKind::Vmp => &mut coverage.vmp,
                FormulationKind::Amp => &mut coverage.amp,
            };
            counts.total += 1;
            if el.bnf_code.is_none() {
                counts.without_bnf_code += 1;
            }
            if el.vtm.is_none() {
                counts.without_vtm += 1;
            }
        }
        coverage
    }

    pub fn term_table<'a>(
        els: impl IntoIterator<Item = &'a Formulation>,
        max_rows: usize,
    ) -> Table<'static> {
        let els: Vec<&Formulation> = els.into_iter().collect();
        util::head_table(
            [
                "type",
                "id",
                "name",
                "vtm",
                "vtm name",
                "BNF code",
                "previous VMP",
                "previous VMP date",
            ],
            els.into_iter().map(|el| {
                vec![
                    el.kind.to_string(),
                    util::opt(el.id),
                    util::opt(el.name.as_deref()),
                    util::opt(el.vtm),
                    util::opt(el.vtm_name.as_deref()),
                    util::opt(el.bnf_code.as_deref()),
                    util::opt(el.previous_id),
                    util::opt(el.previous_date),
                ]
            }),
            max_rows,
        )
    }

    fn new(els: Vec<Formulation>) -> Self {
        let mut this = Self {
            els: Arc::new(els),
            bnf_idx: BTreeMap::new(),
        };
        this.rebuild_index();
        this
    }

    fn rebuild_index(&mut self) {
        self.bnf_idx.clear();
        for (idx, el) in self.els.iter().enumerate() {
            if let Some(code) = &el.bnf_code {
                self.bnf_idx.entry(code.clone()).or_default().push(idx);
            }
        }
    }
}

impl Deref for Formulations {
    type Target = [Formulation];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindCoverage {
    pub kind: FormulationKind,
    pub total: usize,
    pub without_bnf_code: usize,
    pub without_vtm: usize,
}

impl KindCoverage {
    fn new(kind: FormulationKind) -> Self {
        Self {
            kind,
            total: 0,
            without_bnf_code: 0,
            without_vtm: 0,
        }
    }
}

/// How complete the reference table is, per product type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceCoverage {
    pub vmp: KindCoverage,
    pub amp: KindCoverage,
}

impl ReferenceCoverage {
    pub fn term_table(&self) -> Table<'static> {
        let mut table = Table::new().with_row(
            Row::new()
                .with_cell(Cell::from("type"))
                .with_cell(Cell::from("products"))
                .with_cell(Cell::from("without BNF code"))
                .with_cell(Cell::from("without VTM")),
        );
        for counts in [&self.vmp, &self.amp] {
            table.add_row(
                Row::new()
                    .with_cell(Cell::from(counts.kind.to_string()))
                    .with_cell(Cell::from(counts.total.to_string()))
                    .with_cell(Cell::from(counts.without_bnf_code.to_string()))
                    .with_cell(Cell::from(counts.without_vtm.to_string())),
            );
        }
        table
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::{
        extract_reference, reference_sql, FormulationKind, Formulations, AMP_SQL, VMP_SQL,
    };
    use crate::{
        cache::{CacheKey, MemoryCache, TableCache},
        config::RAW_REFERENCE_FILE,
        query::MemoryService,
        table::RowSet,
    };

    pub(crate) const COLUMNS: [&str; 8] = [
        "type",
        "id",
        "nm",
        "vtm",
        "vtm_nm",
        "bnf_code",
        "vmp_previous",
        "vmp_previous_date",
    ];

    pub(crate) fn vmps() -> RowSet {
        RowSet::from_text(
            &COLUMNS,
            [
                &[
                    "vmp",
                    "39720311000001101",
                    "Paracetamol 500mg tablets",
                    "90332006",
                    "Paracetamol",
                    "0407010H0AAAMAM",
                    "",
                    "",
                ][..],
                &[
                    "vmp",
                    "3378311000001103",
                    "Macrogol compound oral powder sachets",
                    "",
                    "",
                    "0106040M0AAAAAA",
                    "322280009",
                    "2004-05-27",
                ][..],
                &[
                    "vmp",
                    "22000111000001109",
                    "Unmapped device",
                    "",
                    "",
                    "",
                    "",
                    "",
                ][..],
            ],
        )
        .unwrap()
    }

    pub(crate) fn amps() -> RowSet {
        RowSet::from_text(
            &COLUMNS,
            [
                &[
                    "amp",
                    "4049911000001108.0",
                    "Paracetamol 500mg tablets (Acme)",
                    "90332006.0",
                    "Paracetamol",
                    "0407010H0AAAMAM",
                    "",
                    "",
                ][..],
                &[
                    "amp",
                    "3381211000001101",
                    "Laxido oral powder sachets (Galen)",
                    "",
                    "",
                    "0106040M0BBAAAA",
                    "",
                    "",
                ][..],
            ],
        )
        .unwrap()
    }

    pub(crate) fn service() -> MemoryService {
        MemoryService::new()
            .with_table(VMP_SQL, vmps())
            .with_table(AMP_SQL, amps())
    }

    #[test]
    fn union_keeps_every_row() {
        let cache = MemoryCache::new();
        let service = service();
        let raw = extract_reference(&service, &cache, true).unwrap();
        assert_eq!(raw.len(), vmps().len() + amps().len());
        assert_eq!(raw.get(0, "type"), Some("vmp"));
        assert_eq!(raw.get(3, "type"), Some("amp"));
        assert_eq!(service.calls(), 2);

        // cached under the full query text
        let key = CacheKey::new(RAW_REFERENCE_FILE, reference_sql());
        assert_eq!(cache.get(&key).unwrap(), Some(raw));
    }

    #[test]
    fn cached_reference_skips_service() {
        let cache = MemoryCache::new();
        extract_reference(&service(), &cache, true).unwrap();
        let offline = MemoryService::new();
        let raw = extract_reference(&offline, &cache, true).unwrap();
        assert_eq!(offline.calls(), 0);
        assert_eq!(raw.len(), 5);
        assert!(extract_reference(&offline, &cache, false).is_err());
    }

    #[test]
    fn decode_and_index() {
        let raw = vmps().union_all(&amps()).unwrap();
        let formulations = Formulations::from_raw(&raw).unwrap();
        assert_eq!(formulations.len(), 5);

        let amp = &formulations[3];
        assert_eq!(amp.kind, FormulationKind::Amp);
        assert_eq!(amp.id, Some(4049911000001108));
        assert_eq!(amp.vtm, Some(90332006));

        let macrogol = &formulations[1];
        assert_eq!(macrogol.previous_id, Some(322280009));
        assert_eq!(
            macrogol.previous_date,
            chrono::NaiveDate::from_ymd_opt(2004, 5, 27)
        );

        assert_eq!(formulations.find_by_bnf_code("0407010H0AAAMAM").count(), 2);
        assert_eq!(formulations.find_by_bnf_code("nope").count(), 0);
        assert_eq!(formulations.find_by_bnf_prefix("0106040M0").count(), 2);
        assert_eq!(formulations.find_by_bnf_prefix("04").count(), 2);
        assert_eq!(formulations.find_by_bnf_prefix("").count(), 4);
    }

    #[test]
    fn raw_ids_must_be_normalized_first() {
        let raw = vmps().union_all(&amps()).unwrap();
        assert!(Formulations::from_rows(&raw).is_err());
    }

    #[test]
    fn coverage() {
        let raw = vmps().union_all(&amps()).unwrap();
        let coverage = Formulations::from_raw(&raw).unwrap().coverage();
        assert_eq!(coverage.vmp.total, 3);
        assert_eq!(coverage.vmp.without_bnf_code, 1);
        assert_eq!(coverage.vmp.without_vtm, 2);
        assert_eq!(coverage.amp.total, 2);
        assert_eq!(coverage.amp.without_bnf_code, 0);
        assert_eq!(coverage.amp.without_vtm, 1);
    }
}
