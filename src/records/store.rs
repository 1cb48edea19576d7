//! Where shipping records are saved.

use std::{cmp::Ordering, sync::Mutex};

use chrono::Utc;
use clap::{Args, ValueEnum};
use schemars::JsonSchema;
use serde_json::Map;
use tokio::{fs, sync::Mutex as AsyncMutex};
use uuid::Uuid;

use super::{ShippingRecord, StoredRecord, assemble::validate_record};
use crate::prelude::*;

/// Default page size for listings.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// The field we sort listings by.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    #[value(name = "createdAt")]
    CreatedAt,
    #[value(name = "updatedAt")]
    UpdatedAt,
}

/// Ascending or descending.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

/// Which page of records to list.
#[derive(Args, Clone, Debug)]
pub struct RecordQuery {
    /// Page number, starting at 1.
    #[clap(long, default_value = "1")]
    pub page: usize,

    /// Records per page.
    #[clap(long, default_value = "10")]
    pub size: usize,

    /// Case-insensitive text to look for in sender and recipient names,
    /// barcode numbers and internal numbers.
    #[clap(long)]
    pub search: Option<String>,

    /// Field to sort by.
    #[clap(long, value_enum, default_value_t)]
    pub sort: SortField,

    /// Sort order.
    #[clap(long, value_enum, default_value_t)]
    pub order: SortOrder,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            page: 1,
            size: DEFAULT_PAGE_SIZE,
            search: None,
            sort: SortField::default(),
            order: SortOrder::default(),
        }
    }
}

/// Pagination metadata for a [`RecordPage`].
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: usize,
    pub size: usize,
    pub total_items: usize,
    pub total_pages: usize,
    /// Offset of the first item on this page.
    pub start_index: usize,
    /// Offset of the last item on this page, if there is one.
    pub end_index: Option<usize>,
    pub sort: SortField,
    pub order: SortOrder,
    pub search: String,
    pub last_page: usize,
}

/// How to ask for the following page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct NextPage {
    /// Query string for the next page, like `?page=2&size=10&sort=createdAt&order=desc`.
    pub path: String,
    pub page: usize,
    pub size: usize,
    pub sort: SortField,
    pub order: SortOrder,
}

/// One page of records.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct RecordPage {
    pub items: Vec<StoredRecord>,
    pub pagination: Pagination,
    pub next: Option<NextPage>,
}

/// Interface to record persistence.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Validate and save a new record.
    async fn create_record(&self, record: ShippingRecord) -> Result<StoredRecord>;

    /// Look up a record by ID.
    async fn get_record(&self, id: Uuid) -> Result<Option<StoredRecord>>;

    /// List records.
    async fn get_records(&self, query: &RecordQuery) -> Result<RecordPage>;

    /// Apply a JSON merge patch to a record, re-validate it and bump its
    /// `updatedAt`. Returns `None` if there is no such record.
    async fn update_record(&self, id: Uuid, patch: &Value) -> Result<Option<StoredRecord>>;

    /// Delete a record. Returns `false` if there was no such record.
    async fn delete_record(&self, id: Uuid) -> Result<bool>;
}

/// Apply an RFC 7396 JSON merge patch.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Records held in memory. Shared by our store implementations.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(transparent)]
struct RecordTable {
    records: Vec<StoredRecord>,
}

impl RecordTable {
    fn create(&mut self, record: ShippingRecord) -> Result<StoredRecord> {
        validate_record(&record)?;
        let now = Utc::now();
        let stored = StoredRecord {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            record,
        };
        self.records.push(stored.clone());
        Ok(stored)
    }

    fn get(&self, id: Uuid) -> Option<StoredRecord> {
        self.records.iter().find(|r| r.id == id).cloned()
    }

    fn page(&self, query: &RecordQuery) -> RecordPage {
        let search = query.search.as_deref().unwrap_or_default().trim();
        let needle = search.to_lowercase();
        let mut matching = self
            .records
            .iter()
            .filter(|r| needle.is_empty() || matches_search(&r.record, &needle))
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| {
            let ordering = match query.sort {
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            };
            query.order.apply(ordering)
        });

        let page = query.page.max(1);
        let size = query.size.max(1);
        let offset = (page - 1).saturating_mul(size);
        let total_items = matching.len();
        let total_pages = total_items.div_ceil(size);
        let items = matching
            .into_iter()
            .skip(offset)
            .take(size)
            .cloned()
            .collect();

        let next = (page < total_pages).then(|| NextPage {
            path: format!(
                "?page={}&size={size}&sort={}&order={}",
                page + 1,
                value_name(query.sort),
                value_name(query.order),
            ),
            page: page + 1,
            size,
            sort: query.sort,
            order: query.order,
        });
        RecordPage {
            items,
            pagination: Pagination {
                page,
                size,
                total_items,
                total_pages,
                start_index: offset,
                end_index: offset.saturating_add(size).min(total_items).checked_sub(1),
                sort: query.sort,
                order: query.order,
                search: search.to_owned(),
                last_page: total_pages,
            },
            next,
        }
    }

    fn update(&mut self, id: Uuid, patch: &Value) -> Result<Option<StoredRecord>> {
        let Some(stored) = self.records.iter_mut().find(|r| r.id == id) else {
            return Ok(None);
        };
        let mut patch = patch.clone();
        if let Value::Object(fields) = &mut patch {
            for key in ["id", "createdAt", "updatedAt"] {
                fields.remove(key);
            }
        } else {
            return Err(anyhow!("record update must be a JSON object"));
        }

        let mut value = serde_json::to_value(&stored.record)
            .context("could not serialize record")?;
        merge_patch(&mut value, &patch);
        let record = serde_json::from_value::<ShippingRecord>(value)
            .context("updated record is not a valid shipping record")?;
        validate_record(&record)?;

        stored.record = record;
        stored.updated_at = Utc::now().max(stored.updated_at);
        Ok(Some(stored.clone()))
    }

    fn delete(&mut self, id: Uuid) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.id != id);
        self.records.len() != before
    }
}

/// Does `record` contain `needle`, which must already be lower-case?
fn matches_search(record: &ShippingRecord, needle: &str) -> bool {
    [
        &record.sender.name,
        &record.recipient.name,
        &record.tracking.barcode_number,
        &record.tracking.internal_number,
    ]
    .into_iter()
    .any(|field| field.to_lowercase().contains(needle))
}

/// The name a `clap` value uses on the command line.
fn value_name(value: impl ValueEnum) -> String {
    value
        .to_possible_value()
        .map(|v| v.get_name().to_owned())
        .unwrap_or_default()
}

/// A store which forgets everything when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: Mutex<RecordTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_record(&self, record: ShippingRecord) -> Result<StoredRecord> {
        self.table.lock().expect("lock poisoned").create(record)
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<StoredRecord>> {
        Ok(self.table.lock().expect("lock poisoned").get(id))
    }

    async fn get_records(&self, query: &RecordQuery) -> Result<RecordPage> {
        Ok(self.table.lock().expect("lock poisoned").page(query))
    }

    async fn update_record(&self, id: Uuid, patch: &Value) -> Result<Option<StoredRecord>> {
        self.table.lock().expect("lock poisoned").update(id, patch)
    }

    async fn delete_record(&self, id: Uuid) -> Result<bool> {
        Ok(self.table.lock().expect("lock poisoned").delete(id))
    }
}

/// A store kept in a single JSON file, rewritten after every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    table: AsyncMutex<RecordTable>,
}

impl JsonFileStore {
    /// Open a store, creating an empty one if `path` does not exist.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self> {
        let table = if fs::try_exists(path)
            .await
            .with_context(|| format!("could not access {}", path.display()))?
        {
            let data = fs::read_to_string(path)
                .await
                .with_context(|| format!("could not read {}", path.display()))?;
            if data.trim().is_empty() {
                RecordTable::default()
            } else {
                serde_json::from_str(&data)
                    .with_context(|| format!("could not parse {}", path.display()))?
            }
        } else {
            RecordTable::default()
        };
        debug!(count = table.records.len(), "Loaded records");
        Ok(Self {
            path: path.to_owned(),
            table: AsyncMutex::new(table),
        })
    }

    /// Write `table` to a temporary file, then move it into place.
    async fn save(&self, table: &RecordTable) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("could not create {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(table).context("could not serialize records")?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data)
            .await
            .with_context(|| format!("could not write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("could not replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn create_record(&self, record: ShippingRecord) -> Result<StoredRecord> {
        let mut table = self.table.lock().await;
        let stored = table.create(record)?;
        if let Err(err) = self.save(&table).await {
            table.delete(stored.id);
            return Err(err);
        }
        Ok(stored)
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<StoredRecord>> {
        Ok(self.table.lock().await.get(id))
    }

    async fn get_records(&self, query: &RecordQuery) -> Result<RecordPage> {
        Ok(self.table.lock().await.page(query))
    }

    async fn update_record(&self, id: Uuid, patch: &Value) -> Result<Option<StoredRecord>> {
        let mut table = self.table.lock().await;
        let previous = table.clone();
        let updated = table.update(id, patch)?;
        if updated.is_some() {
            if let Err(err) = self.save(&table).await {
                *table = previous;
                return Err(err);
            }
        }
        Ok(updated)
    }

    async fn delete_record(&self, id: Uuid) -> Result<bool> {
        let mut table = self.table.lock().await;
        let previous = table.clone();
        let deleted = table.delete(id);
        if deleted {
            if let Err(err) = self.save(&table).await {
                *table = previous;
                return Err(err);
            }
        }
        Ok(deleted)
    }
}
