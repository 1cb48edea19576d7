use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod contents;
mod cpu_limit;
mod drivers;
mod ocr;
mod prelude;
mod preprocess;
mod queues;
mod rate_limit;
mod records;
mod retry;
mod storage;
mod ui;

/// Turn shipping-label photos into validated shipping records.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - GEMINI_API_KEY: The Gemini API key to use. Required by `scan`, unless
    you pass `--driver offline`.
  - GEMINI_API_BASE (optional): Override the Gemini server URL.
  - SHIPSCAN_STORE (optional): The record store file. Defaults to
    `records.json`.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Scan label images into records. The input file should have `id` and
    /// `path` fields.
    Scan(cmd::scan::ScanOpts),
    /// Extract label fields from plain text, without a model.
    ParseText(cmd::parse_text::ParseTextOpts),
    /// Merge `contents` lists from several labels into one item list.
    Aggregate(cmd::aggregate::AggregateOpts),
    /// List, show, update or delete saved records.
    Records(cmd::records::RecordsOpts),
    /// Print schemas for input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Scan(opts) => opts.output_path.is_none(),
            Cmd::ParseText(opts) => opts.output_path.is_none(),
            Cmd::Aggregate(opts) => opts.output_path.is_none(),
            Cmd::Records(_) => true,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Scan(scan_opts) => cmd::scan::cmd_scan(ui, scan_opts).await,
        Cmd::ParseText(parse_opts) => cmd::parse_text::cmd_parse_text(parse_opts).await,
        Cmd::Aggregate(aggregate_opts) => {
            cmd::aggregate::cmd_aggregate(aggregate_opts).await
        }
        Cmd::Records(records_opts) => cmd::records::cmd_records(ui, records_opts).await,
        Cmd::Schema(schema_opts) => cmd::schema::cmd_schema(schema_opts).await,
    }
}
