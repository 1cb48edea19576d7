//! The `parse-text` subcommand.

use clap::Args;

use crate::{
    async_utils::io::{read_text, write_json},
    ocr::fallback::parse_label_text,
    prelude::*,
};

/// Extract label fields from plain text, without a model.
#[derive(Args, Debug)]
pub struct ParseTextOpts {
    /// A text file containing the label's text. Defaults to standard input.
    pub input_path: Option<PathBuf>,

    /// Output location. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// Run the `parse-text` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_parse_text(opts: &ParseTextOpts) -> Result<()> {
    let text = read_text(opts.input_path.as_deref()).await?;
    let fields = parse_label_text(&text);
    debug!(
        unknown = fields.unknown_fields().len(),
        "Parsed label text"
    );
    write_json(opts.output_path.as_deref(), &fields).await
}
