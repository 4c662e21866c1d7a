//! Build the BNF code to dm+d mapping file and report how well it covers prescribing.
use bnf_dmd_map::{
    cache::CsvCache,
    query::{BigQuery, Offline, QueryService},
    Config, Pipeline,
};
use clap::Parser;
use qu::ick_use::*;
use std::path::PathBuf;

#[derive(Parser)]
struct Opt {
    /// A TOML file overriding the default configuration.
    #[clap(long, short)]
    config: Option<PathBuf>,
    /// Where snapshots are read from and written to.
    #[clap(long)]
    data_dir: Option<PathBuf>,
    /// Run both queries even if matching snapshots exist.
    #[clap(long)]
    no_cache: bool,
    /// Never contact BigQuery: fail unless every snapshot is present.
    #[clap(long, conflicts_with = "no_cache")]
    offline: bool,
    /// How many rows each report shows (0 for all).
    #[clap(long)]
    top: Option<usize>,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let mut config = Config::load_or_default(opt.config.as_deref())?;
    if let Some(data_dir) = opt.data_dir {
        config.data_dir = data_dir;
    }
    if opt.no_cache {
        config.use_cache = false;
    }
    if let Some(top) = opt.top {
        config.report.no_dmd_rows = top;
        config.report.no_vtm_rows = top;
    }

    let service: Box<dyn QueryService> = if opt.offline {
        Box::new(Offline)
    } else {
        Box::new(BigQuery::from_env(&config)?)
    };
    let cache = CsvCache::new(&config.data_dir);

    let outcome = Pipeline::new(&config, &*service, &cache).run()?;
    bnf_dmd_map::print_report(&config, &outcome);
    Ok(())
}
