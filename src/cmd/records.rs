//! The `records` subcommand.

use clap::{Args, Subcommand};
use uuid::Uuid;

use crate::{
    async_utils::io::{read_text, write_json},
    prelude::*,
    records::store::{RecordQuery, RecordStore as _},
    ui::Ui,
};

use super::scan::StoreOpts;

/// Work with saved records.
#[derive(Args, Debug)]
pub struct RecordsOpts {
    #[command(flatten)]
    pub store_opts: StoreOpts,

    #[clap(subcommand)]
    pub action: RecordsCmd,
}

/// What to do with saved records.
#[derive(Debug, Subcommand)]
pub enum RecordsCmd {
    /// List records, a page at a time.
    List(RecordQuery),
    /// Print one record.
    Show {
        /// The record's ID.
        id: Uuid,
    },
    /// Change a record using a JSON merge patch.
    Update {
        /// The record's ID.
        id: Uuid,
        /// A file containing the patch. Defaults to standard input.
        patch_path: Option<PathBuf>,
    },
    /// Delete a record.
    Delete {
        /// The record's ID.
        id: Uuid,
    },
}

/// Run the `records` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_records(ui: Ui, opts: &RecordsOpts) -> Result<()> {
    let store = opts.store_opts.open().await?;
    match &opts.action {
        RecordsCmd::List(query) => {
            let page = store.get_records(query).await?;
            write_json(None, &page).await
        }
        RecordsCmd::Show { id } => {
            let record = store
                .get_record(*id)
                .await?
                .ok_or_else(|| anyhow!("no record with ID {id}"))?;
            write_json(None, &record).await
        }
        RecordsCmd::Update { id, patch_path } => {
            let patch_text = read_text(patch_path.as_deref()).await?;
            let patch = serde_json::from_str::<Value>(&patch_text)
                .context("failed to parse JSON patch")?;
            let record = store
                .update_record(*id, &patch)
                .await?
                .ok_or_else(|| anyhow!("no record with ID {id}"))?;
            write_json(None, &record).await
        }
        RecordsCmd::Delete { id } => {
            if !store.delete_record(*id).await? {
                return Err(anyhow!("no record with ID {id}"));
            }
            ui.display_message("🗑️", &format!("Deleted record {id}"));
            Ok(())
        }
    }
}
