//! The `scan` subcommand.

use std::sync::Arc;

use clap::Args;
use futures::{StreamExt as _, TryStreamExt as _, stream};

use crate::{
    async_utils::io::write_json,
    drivers::DriverOpts,
    ocr::{OcrClient, OcrOpts},
    preprocess::PreprocessOpts,
    prelude::*,
    queues::{
        scan::{ScanBatch, ScanContext, ScanInput, ScanOutput, scan_images},
        work::{WorkInput, WorkOutput},
    },
    records::store::{JsonFileStore, RecordStore},
    storage::{FileSink, LocalDirSink},
    ui::Ui,
};

use super::StreamOpts;

/// Where records go unless told otherwise.
pub const DEFAULT_STORE_PATH: &str = "records.json";

/// Options for opening the record store.
#[derive(Args, Clone, Debug)]
pub struct StoreOpts {
    /// JSON file holding saved records.
    #[clap(long = "store", env = "SHIPSCAN_STORE", default_value = DEFAULT_STORE_PATH)]
    pub store_path: PathBuf,
}

impl StoreOpts {
    /// Open our record store.
    pub async fn open(&self) -> Result<JsonFileStore> {
        JsonFileStore::open(&self.store_path).await
    }

    /// Default image directory: `uploads` next to the store.
    fn default_upload_dir(&self) -> PathBuf {
        self.store_path
            .parent()
            .map(|dir| dir.join("uploads"))
            .unwrap_or_else(|| PathBuf::from("uploads"))
    }
}

/// Scan shipping label images into records.
#[derive(Args, Debug)]
pub struct ScanOpts {
    /// Input file, in JSONL or CSV format, with `id`, `path` and optional
    /// `mime_type` fields. Defaults to standard input.
    pub input_path: Option<PathBuf>,

    /// Output location. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Also write the batch summary as JSON to this file.
    #[clap(long = "summary")]
    pub summary_path: Option<PathBuf>,

    /// Directory where label images are kept. Defaults to `uploads` next to
    /// the store.
    #[clap(long)]
    pub upload_dir: Option<PathBuf>,

    #[command(flatten)]
    pub store_opts: StoreOpts,

    #[command(flatten)]
    pub stream_opts: StreamOpts,

    #[command(flatten)]
    pub driver_opts: DriverOpts,

    #[command(flatten)]
    pub ocr_opts: OcrOpts,

    #[command(flatten)]
    pub preprocess_opts: PreprocessOpts,
}

/// Run the `scan` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_scan(ui: Ui, opts: &ScanOpts) -> Result<()> {
    // Build everything the pipeline needs up front.
    let driver = opts
        .driver_opts
        .driver
        .create_driver(&opts.driver_opts)
        .await?;
    let store: Arc<dyn RecordStore> = Arc::new(opts.store_opts.open().await?);
    let upload_dir = opts
        .upload_dir
        .clone()
        .unwrap_or_else(|| opts.store_opts.default_upload_dir());
    let sink: Arc<dyn FileSink> = Arc::new(LocalDirSink::new(upload_dir));
    let ctx = Arc::new(ScanContext {
        ocr: OcrClient::new(driver, opts.ocr_opts.clone()),
        store,
        sink,
        preprocess: opts.preprocess_opts.clone(),
        job_count: opts.stream_opts.job_count,
    });

    // Read all our inputs. Batches are small, and we need the whole list to
    // spot repeated file names.
    let input = WorkInput::<ScanInput>::read_stream(opts.input_path.as_deref()).await?;
    let inputs = opts
        .stream_opts
        .apply_stream_input_opts(input)
        .try_collect::<Vec<_>>()
        .await?;

    let ScanBatch { outputs, summary } = scan_images(&ui, ctx, inputs).await?;
    summary.display(&ui);
    if let Some(path) = &opts.summary_path {
        write_json(Some(path), &summary).await?;
    }

    let output = stream::iter(outputs.into_iter().map(Ok::<_, anyhow::Error>)).boxed();
    WorkOutput::<ScanOutput>::write_stream(
        &ui,
        opts.output_path.as_deref(),
        output,
        &opts.stream_opts,
    )
    .await
}
