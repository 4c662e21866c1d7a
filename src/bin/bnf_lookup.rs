//! Look up the dm+d products for a BNF code, or for every code under a BNF prefix.
use bnf_dmd_map::{header, Config, Formulations};
use clap::Parser;
use qu::ick_use::*;
use std::path::PathBuf;

#[derive(Parser)]
struct Opt {
    /// A TOML file overriding the default configuration.
    #[clap(long, short)]
    config: Option<PathBuf>,
    /// Only show products with exactly this BNF code.
    #[clap(long)]
    exact: bool,
    /// How many rows to show (0 for all).
    #[clap(long, default_value_t = 0)]
    top: usize,
    /// The BNF code or code prefix, e.g. `0407010H0`.
    code: String,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let config = Config::load_or_default(opt.config.as_deref())?;
    let formulations = Formulations::load(config.normalized_reference_path())?;
    let code = opt.code.trim();
    ensure!(!code.is_empty(), "please supply a BNF code");

    let found: Vec<_> = if opt.exact {
        formulations.find_by_bnf_code(code).collect()
    } else {
        formulations.find_by_bnf_prefix(code).collect()
    };
    if found.is_empty() {
        bail!("no dm+d products found for BNF code \"{}\"", code);
    }
    header(&format!("{} products for \"{}\"", found.len(), code));
    println!("{}", Formulations::term_table(found, opt.top));
    Ok(())
}
