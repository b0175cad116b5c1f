use std::path::PathBuf;

use anyhow::{Context, bail};

pub const USAGE: &str = "usage: forge-evaluate <predictions.json> <output.json> <program> [args...]";

/// Command line of `forge-evaluate`.
#[derive(Debug, PartialEq, Eq)]
pub struct Args {
    pub predictions: PathBuf,
    pub output: PathBuf,
    pub program: String,
    pub program_args: Vec<String>,
}

impl Args {
    /// Parse everything after the binary name.
    pub fn parse<I>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut it = args.into_iter();
        let predictions = it.next().context(USAGE)?;
        if predictions == "-h" || predictions == "--help" {
            bail!(USAGE);
        }
        let output = it.next().context(USAGE)?;
        let program = it.next().context(USAGE)?;

        Ok(Self {
            predictions: predictions.into(),
            output: output.into(),
            program,
            program_args: it.collect(),
        })
    }
}
