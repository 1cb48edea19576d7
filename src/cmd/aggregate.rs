//! The `aggregate` subcommand.

use clap::Args;
use futures::TryStreamExt as _;

use crate::{
    async_utils::io::{read_jsonl_or_csv, write_json},
    contents::aggregate_contents,
    prelude::*,
};

/// One contents list to merge.
#[derive(Debug, Deserialize)]
struct AggregateInput {
    /// A `"Name*Qty, Name*Qty"` string.
    #[serde(default)]
    contents: Option<String>,
}

/// Merge several contents lists into one item list.
#[derive(Args, Debug)]
pub struct AggregateOpts {
    /// Input file, in JSONL or CSV format, with a `contents` field. Defaults
    /// to standard input.
    pub input_path: Option<PathBuf>,

    /// Output location. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// Run the `aggregate` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_aggregate(opts: &AggregateOpts) -> Result<()> {
    let inputs = read_jsonl_or_csv(opts.input_path.as_deref())
        .await?
        .try_collect::<Vec<_>>()
        .await?;
    let mut contents = vec![];
    for value in inputs {
        let input = serde_json::from_value::<AggregateInput>(value)
            .context("failed to deserialize input")?;
        contents.extend(input.contents);
    }
    let items = aggregate_contents(contents.iter().map(String::as_str));
    write_json(opts.output_path.as_deref(), &items).await
}
