//! Mapping BNF codes to dm+d.
//!
//! Prescribing data from the NHS BSA is coded with BNF codes, while most other systems use dm+d
//! (VMP/AMP level, with VTMs for the substance). This crate builds a reference table linking the
//! two from the dm+d tables in BigQuery, then checks it against a year of primary care prescribing
//! to see how much prescribing can't be mapped, or can't be mapped to a VTM.
//!
//! The pipeline is in `pipeline`. Queries go through `query::QueryService` and snapshots through
//! `cache::TableCache`, so everything can be run against in-memory fakes.
pub mod cache;
pub mod config;
pub mod dmd;
pub mod join;
pub mod normalize;
pub mod pipeline;
pub mod query;
pub mod rx;
pub mod table;
mod util;

pub use anyhow::{Context, Error};
use std::sync::Arc;

pub use crate::{
    config::Config,
    dmd::{Formulation, FormulationKind, Formulations},
    pipeline::{print_report, Outcome, Pipeline},
    rx::{Usage, Usages},
    table::RowSet,
    util::header,
};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
