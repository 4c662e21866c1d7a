//! The end-to-end run: reference table, normalization, prescribing, join.
use crate::{
    cache::TableCache,
    config::Config,
    dmd::{self, Formulations},
    join::{self, JoinedTable},
    normalize,
    query::QueryService,
    rx::{self, Usages},
    table::RowSet,
    util,
};
use qu::ick_use::*;

/// Everything produced by a run. The join borrows from here, see `Outcome::join`.
pub struct Outcome {
    /// The reference table as returned by the query.
    pub raw_reference: RowSet,
    /// The reference table with integer identifier columns: the mapping file.
    pub normalized_reference: RowSet,
    pub formulations: Formulations,
    pub usage: RowSet,
    pub usages: Usages,
}

impl Outcome {
    pub fn join(&self) -> JoinedTable<'_> {
        join::right_join(&self.formulations, &self.usages)
    }
}

pub struct Pipeline<'a> {
    config: &'a Config,
    service: &'a dyn QueryService,
    cache: &'a dyn TableCache,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        service: &'a dyn QueryService,
        cache: &'a dyn TableCache,
    ) -> Self {
        Self {
            config,
            service,
            cache,
        }
    }

    pub fn reference(&self) -> Result<RowSet> {
        dmd::extract_reference(self.service, self.cache, self.config.use_cache)
    }

    /// Normalize the identifier columns and write both versions of the reference table.
    pub fn normalize_reference(&self, raw: &RowSet) -> Result<RowSet> {
        let normalized = normalize::normalize_columns(raw, &normalize::ID_COLUMNS)?;
        raw.save(self.config.raw_reference_path())?;
        normalized.save(self.config.normalized_reference_path())?;
        event!(
            Level::INFO,
            "wrote mapping file \"{}\"",
            self.config.normalized_reference_path().display()
        );
        Ok(normalized)
    }

    pub fn usage(&self) -> Result<RowSet> {
        rx::extract_usage(
            self.service,
            self.cache,
            self.config.use_cache,
            &self.config.usage_window,
        )
    }

    pub fn run(&self) -> Result<Outcome> {
        self.config.validate()?;
        let raw_reference = self.reference()?;
        let normalized_reference = self.normalize_reference(&raw_reference)?;
        let formulations = Formulations::from_rows(&normalized_reference)?;
        let usage = self.usage()?;
        let usages = Usages::from_rows(&usage)?;
        Ok(Outcome {
            raw_reference,
            normalized_reference,
            formulations,
            usage,
            usages,
        })
    }
}

/// Print the reports for a finished run.
pub fn print_report(config: &Config, outcome: &Outcome) {
    let report = &config.report;

    util::header("dm+d reference table");
    println!("{}", outcome.normalized_reference.term_table(report.preview_rows));
    println!("{}", outcome.formulations.coverage().term_table());

    util::header(&format!(
        "Prescribing {} to {}",
        config.usage_window.from, config.usage_window.to
    ));
    println!("{}", outcome.usage.term_table(report.preview_rows));

    let joined = outcome.join();
    util::header("Coverage of prescribing");
    println!("{}", joined.summary().term_table());

    util::header("Prescribing with no dm+d product");
    println!(
        "{}",
        JoinedTable::term_table(&joined.without_dmd(), report.no_dmd_rows)
    );

    let without_vtm = joined.without_vtm();
    util::header("Prescribing with dm+d products but no VTM");
    println!(
        "{}",
        JoinedTable::term_table(&without_vtm, report.no_vtm_rows)
    );
    util::header("Mean items per BNF name, no VTM");
    println!(
        "{}",
        join::name_mean_table(&join::mean_items_by_name(&without_vtm), report.no_vtm_rows)
    );
}

#[cfg(test)]
mod test {
    use super::Pipeline;
    use crate::{
        cache::{CsvCache, MemoryCache},
        config::{Config, UsageWindow},
        dmd, rx,
        query::MemoryService,
        table::RowSet,
    };

    fn service() -> MemoryService {
        dmd::test::service().with_table(
            rx::usage_sql(&UsageWindow::default()),
            rx::test::usage_rows(),
        )
    }

    #[test]
    fn full_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_owned(),
            ..Config::default()
        };
        let service = service();
        let cache = MemoryCache::new();
        let outcome = Pipeline::new(&config, &service, &cache).run().unwrap();

        assert_eq!(outcome.formulations.len(), 5);
        assert_eq!(outcome.usages.len(), 5);
        assert_eq!(outcome.join().len(), outcome.usages.len());

        // both reference snapshots are written, the normalized one with integer ids
        let raw = RowSet::load(config.raw_reference_path()).unwrap();
        assert_eq!(raw, outcome.raw_reference);
        let normalized = RowSet::load(config.normalized_reference_path()).unwrap();
        assert_eq!(normalized.get(3, "id"), Some("4049911000001108"));
        assert_eq!(raw.get(3, "id"), Some("4049911000001108.0"));

        super::print_report(&config, &outcome);
    }

    #[test]
    fn second_run_is_offline() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_owned(),
            ..Config::default()
        };
        let cache = CsvCache::new(&config.data_dir);
        let service = service();
        let first = Pipeline::new(&config, &service, &cache).run().unwrap();
        assert_eq!(service.calls(), 3);

        let offline = MemoryService::new();
        let second = Pipeline::new(&config, &offline, &cache).run().unwrap();
        assert_eq!(offline.calls(), 0);
        assert_eq!(first.raw_reference, second.raw_reference);
        assert_eq!(first.usage, second.usage);
    }

    #[test]
    fn unreachable_service_without_snapshots_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_owned(),
            ..Config::default()
        };
        let service = MemoryService::new();
        let cache = CsvCache::new(&config.data_dir);
        assert!(Pipeline::new(&config, &service, &cache).run().is_err());
    }
}
