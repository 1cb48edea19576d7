//! Scanning a batch of label images into shipping records.
//!
//! Each image is read, checked, compressed and sent for OCR independently,
//! with up to `job_count` images in flight at once. Saving happens afterwards,
//! one image at a time in input order, so that every record can list the
//! images stored before it.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{StreamExt as _, stream};
use schemars::JsonSchema;
use uuid::Uuid;

use crate::{
    contents::{ContentAggregator, ContentItem},
    ocr::{
        OcrClient, OcrImage, OcrResult, OcrSource,
        fields::{ExtractedFields, is_known},
    },
    preprocess::{
        PreprocessOpts, check_intake, check_size, detect_mime_type, preprocess_image,
    },
    prelude::*,
    records::{
        assemble::{ImageUrls, assemble_record, validate_record},
        store::RecordStore,
    },
    storage::FileSink,
    ui::{ProgressConfig, Ui},
};

use super::work::{WorkInput, WorkOutput, WorkStatus};

/// An image to scan.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
pub struct ScanInput {
    /// Path to a JPEG or PNG image.
    pub path: PathBuf,

    /// The image's MIME type. Detected from the file if omitted.
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// What we learned from one image.
#[derive(Clone, Debug, Default, JsonSchema, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOutput {
    /// The image's file name. Results are matched to inputs by this name.
    pub file_name: String,

    /// Where the fields came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<OcrSource>,

    /// Mean of the positive per-field confidence scores.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_confidence: Option<f64>,

    /// How many model calls we made.
    pub attempts: u32,

    /// Things a human should double-check.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    /// The extracted fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<ExtractedFields>,

    /// Where we stored the image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    /// The ID of the saved record.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub record_id: Option<Uuid>,
}

impl ScanOutput {
    fn for_file(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_owned(),
            ..Self::default()
        }
    }
}

/// Totals across a whole batch.
#[derive(Clone, Debug, Default, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total_images: usize,
    /// Images which produced fields, whether or not they were saved.
    pub processed_images: usize,
    pub failed_images: usize,
    /// Contents of every processed image, merged by item name.
    pub contents: Vec<ContentItem>,
    /// Every known barcode number, in first-seen order.
    pub barcode_numbers: Vec<String>,
    /// Every known internal number, in first-seen order.
    pub internal_numbers: Vec<String>,
    /// Every stored image, in input order.
    pub image_urls: Vec<String>,
    #[schemars(with = "Vec<String>")]
    pub record_ids: Vec<Uuid>,
}

impl BatchSummary {
    fn from_outputs(outputs: &[WorkOutput<ScanOutput>]) -> Self {
        let mut contents = ContentAggregator::new();
        let mut barcode_numbers = vec![];
        let mut internal_numbers = vec![];
        let mut summary = BatchSummary {
            total_images: outputs.len(),
            ..BatchSummary::default()
        };
        for output in outputs {
            let Some(fields) = &output.data.fields else {
                summary.failed_images += 1;
                continue;
            };
            summary.processed_images += 1;
            contents.add_contents(&fields.contents);
            push_unique(&mut barcode_numbers, &fields.barcode_number);
            push_unique(&mut internal_numbers, &fields.internal_number);
            summary.image_urls.extend(output.data.image_url.clone());
            summary.record_ids.extend(output.data.record_id);
        }
        summary.contents = contents.finish();
        summary.barcode_numbers = barcode_numbers;
        summary.internal_numbers = internal_numbers;
        summary
    }

    /// Tell the user what we found.
    pub fn display(&self, ui: &Ui) {
        ui.display_message(
            "📦",
            &format!(
                "{}/{} images processed, {} records saved",
                self.processed_images,
                self.total_images,
                self.record_ids.len()
            ),
        );
        if !self.contents.is_empty() {
            let items = self
                .contents
                .iter()
                .map(|item| format!("{}*{}", item.name, item.qty))
                .collect::<Vec<_>>()
                .join(", ");
            ui.display_message("🧾", &format!("Contents: {items}"));
        }
        if !self.barcode_numbers.is_empty() {
            ui.display_message(
                "🏷️",
                &format!("Barcodes: {}", self.barcode_numbers.join(", ")),
            );
        }
    }
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    let value = value.trim();
    if is_known(value) && !values.iter().any(|v| v == value) {
        values.push(value.to_owned());
    }
}

/// Everything a scan needs, built once by the caller.
pub struct ScanContext {
    pub ocr: OcrClient,
    pub store: Arc<dyn RecordStore>,
    pub sink: Arc<dyn FileSink>,
    pub preprocess: PreprocessOpts,
    pub job_count: usize,
}

/// The results of scanning a batch.
pub struct ScanBatch {
    /// One output per input, in input order.
    pub outputs: Vec<WorkOutput<ScanOutput>>,
    pub summary: BatchSummary,
}

/// An image which made it through OCR.
struct ScannedImage {
    ocr: OcrResult,
    image_url: Result<String, String>,
    errors: Vec<String>,
}

/// The result of the concurrent part of the pipeline for one input.
struct Processed {
    index: usize,
    id: Value,
    file_name: String,
    result: Result<ScannedImage, String>,
}

/// The name we use to match results to inputs.
fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Scan a batch of images.
///
/// Only repeated file names and the final save are handled outside the
/// per-image tasks. Individual failures become [`WorkStatus::Failed`]
/// outputs; they never abort the batch.
#[instrument(level = "debug", skip_all, fields(count = inputs.len()))]
pub async fn scan_images(
    ui: &Ui,
    ctx: Arc<ScanContext>,
    inputs: Vec<WorkInput<ScanInput>>,
) -> Result<ScanBatch> {
    // Drop repeated file names, keeping the first.
    let mut submitted = HashSet::new();
    let mut duplicates = vec![];
    let mut unique = vec![];
    for (index, input) in inputs.into_iter().enumerate() {
        let file_name = file_name_of(&input.data.path);
        if submitted.insert(file_name.clone()) {
            unique.push((index, file_name, input));
        } else {
            warn!(%file_name, "Skipping repeated file name");
            duplicates.push((index, file_name, input.id));
        }
    }

    let pb = ui.new_from_size_hint(
        &ProgressConfig {
            emoji: "📷",
            msg: "Scanning labels",
            done_msg: "Scanned labels",
        },
        (unique.len(), Some(unique.len())),
    );
    let job_count = ctx.job_count.max(1);
    let scans = stream::iter(unique).map(|(index, file_name, input)| {
        let ctx = ctx.clone();
        let ui = ui.clone();
        async move {
            let started = Instant::now();
            let result = scan_image(&ctx, &file_name, &input.data)
                .await
                .map_err(|err| format!("{err:#}"));
            report(&ui, &file_name, started.elapsed(), &result);
            Processed {
                index,
                id: input.id,
                file_name,
                result,
            }
        }
    });
    let mut processed = pb
        .wrap_stream(Box::pin(scans.buffer_unordered(job_count)))
        .collect::<Vec<_>>()
        .await;
    processed.sort_by_key(|p| p.index);

    let mut outputs = duplicates
        .into_iter()
        .map(|(index, file_name, id)| {
            let error = format!("{file_name} was already submitted in this batch");
            (
                index,
                WorkOutput::new_failed(id, vec![error], ScanOutput::for_file(&file_name)),
            )
        })
        .collect::<Vec<_>>();
    let mut stored_urls = vec![];
    for p in processed {
        let output = save_scan(ctx.store.as_ref(), p.id, &p.file_name, p.result, &mut stored_urls)
            .await;
        outputs.push((p.index, output));
    }
    outputs.sort_by_key(|(index, _)| *index);
    let outputs = outputs
        .into_iter()
        .map(|(_, output)| output)
        .collect::<Vec<_>>();

    let summary = BatchSummary::from_outputs(&outputs);
    Ok(ScanBatch { outputs, summary })
}

fn report(ui: &Ui, file_name: &str, elapsed: Duration, result: &Result<ScannedImage, String>) {
    match result {
        Ok(_) => ui.display_message(
            "✅",
            &format!("Processed {file_name} in {:.1} seconds", elapsed.as_secs_f64()),
        ),
        Err(reason) => {
            ui.display_message("❌", &format!("Failed to process {file_name}: {reason}"))
        }
    }
}

/// Read, check, compress and OCR one image, then store it.
#[instrument(level = "debug", skip_all, fields(file_name = %file_name))]
async fn scan_image(ctx: &ScanContext, file_name: &str, input: &ScanInput) -> Result<ScannedImage> {
    let metadata = tokio::fs::metadata(&input.path)
        .await
        .with_context(|| format!("could not read {}", input.path.display()))?;
    check_size(metadata.len(), &ctx.preprocess)?;
    let bytes = tokio::fs::read(&input.path)
        .await
        .with_context(|| format!("could not read {}", input.path.display()))?;
    let mime_type = detect_mime_type(input.mime_type.as_deref(), &bytes, &input.path);
    check_intake(mime_type.as_deref(), bytes.len() as u64, &ctx.preprocess)?;
    let mime_type = mime_type.unwrap_or_default();

    let prepared =
        preprocess_image(bytes.clone(), mime_type.clone(), ctx.preprocess.clone()).await?;
    let mut errors = vec![];
    let compressed = OcrImage {
        file_name: file_name.to_owned(),
        bytes: prepared.bytes,
        mime_type: prepared.mime_type,
    };
    let (ocr, sent) = match ctx.ocr.extract(&compressed).await {
        Ok(ocr) => (ocr, compressed),
        Err(err) if prepared.compressed => {
            warn!("OCR of compressed image failed, retrying with original: {err}");
            errors.push(format!("OCR of compressed image failed: {err}"));
            let original = OcrImage {
                file_name: file_name.to_owned(),
                bytes,
                mime_type,
            };
            (ctx.ocr.extract(&original).await?, original)
        }
        Err(err) => return Err(err.into()),
    };

    let image_url = ctx
        .sink
        .store(file_name, &sent.bytes, &sent.mime_type)
        .await
        .map_err(|err| format!("could not store image: {err:#}"));
    Ok(ScannedImage {
        ocr,
        image_url,
        errors,
    })
}

/// Turn a scanned image into a saved record, if we can.
async fn save_scan(
    store: &dyn RecordStore,
    id: Value,
    file_name: &str,
    result: Result<ScannedImage, String>,
    stored_urls: &mut Vec<String>,
) -> WorkOutput<ScanOutput> {
    let scanned = match result {
        Ok(scanned) => scanned,
        Err(reason) => {
            return WorkOutput::new_failed(id, vec![reason], ScanOutput::for_file(file_name));
        }
    };
    let ScannedImage {
        ocr,
        image_url,
        mut errors,
    } = scanned;
    let mut data = ScanOutput {
        file_name: file_name.to_owned(),
        source: Some(ocr.source),
        overall_confidence: Some(ocr.overall_confidence),
        attempts: ocr.attempts,
        warnings: ocr.warnings,
        fields: None,
        image_url: None,
        record_id: None,
    };

    let mut status = WorkStatus::Ok;
    match image_url {
        Err(err) => {
            status = WorkStatus::Incomplete;
            errors.push(err);
        }
        Ok(url) => {
            stored_urls.push(url.clone());
            data.image_url = Some(url.clone());
            let record = assemble_record(
                &ocr.fields,
                ImageUrls {
                    image_url: Some(url),
                    cumulative: stored_urls.clone(),
                },
            );
            match validate_record(&record) {
                Ok(issues) => {
                    data.warnings
                        .extend(issues.into_iter().map(|issue| issue.to_string()));
                    match store.create_record(record).await {
                        Ok(stored) => data.record_id = Some(stored.id),
                        Err(err) => {
                            status = WorkStatus::Incomplete;
                            errors.push(format!("could not save record: {err:#}"));
                        }
                    }
                }
                Err(err) => {
                    status = WorkStatus::Incomplete;
                    errors.push(err.to_string());
                }
            }
        }
    }
    data.fields = Some(ocr.fields);
    WorkOutput {
        id,
        status,
        errors,
        data,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use reqwest::StatusCode;

    use super::*;
    use crate::{
        drivers::{VisionError, scripted::ScriptedDriver},
        ocr::OcrOpts,
        preprocess::tests::noisy_png,
        records::store::{MemoryStore, RecordQuery},
        storage::LocalDirSink,
    };

    /// A sink that always fails.
    struct BrokenSink;

    #[async_trait]
    impl FileSink for BrokenSink {
        async fn store(&self, _: &str, _: &[u8], _: &str) -> Result<String> {
            Err(anyhow!("disk full"))
        }
    }

    /// A sink that remembers what it was given.
    #[derive(Default)]
    struct MemorySink {
        files: Mutex<Vec<(String, Vec<u8>, String)>>,
    }

    #[async_trait]
    impl FileSink for MemorySink {
        async fn store(&self, file_name: &str, bytes: &[u8], mime_type: &str) -> Result<String> {
            let mut files = self.files.lock().expect("lock poisoned");
            files.push((file_name.to_owned(), bytes.to_vec(), mime_type.to_owned()));
            Ok(format!("memory://{}/{file_name}", files.len()))
        }
    }

    fn reply(barcode: &str, contents: &str) -> String {
        json!({
            "barcodeNumber": barcode,
            "internalNumber": "INT-1",
            "contents": contents,
            "confidenceScores": { "barcodeNumber": 0.95 },
            "rawText": "label",
        })
        .to_string()
    }

    fn context(
        replies: &[String],
        store: Arc<MemoryStore>,
        sink: Arc<dyn FileSink>,
    ) -> Arc<ScanContext> {
        let driver = Arc::new(ScriptedDriver::replies(replies.iter().map(String::as_str)));
        let opts = OcrOpts {
            retries: 0,
            retry_backoff_ms: 0,
            ..OcrOpts::default()
        };
        Arc::new(ScanContext {
            ocr: OcrClient::new(driver, opts),
            store,
            sink,
            preprocess: PreprocessOpts::default(),
            job_count: 1,
        })
    }

    fn input(id: u32, path: &Path) -> WorkInput<ScanInput> {
        WorkInput {
            id: json!(id),
            data: ScanInput {
                path: path.to_owned(),
                mime_type: None,
            },
        }
    }

    #[tokio::test]
    async fn scans_saves_and_summarizes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        let text = dir.path().join("notes.txt");
        std::fs::write(&a, noisy_png(32, 32)).unwrap();
        std::fs::write(&b, noisy_png(32, 32)).unwrap();
        std::fs::write(&text, "hello").unwrap();

        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(LocalDirSink::new(dir.path().join("uploads")));
        let ctx = context(
            &[reply("111", "Shirt*2"), reply("222", "shirt (3), Hat*1")],
            store.clone(),
            sink,
        );
        let inputs = vec![input(1, &a), input(2, &b), input(3, &a), input(4, &text)];
        let batch = scan_images(&Ui::init_for_tests(), ctx, inputs).await.unwrap();

        let statuses = batch.outputs.iter().map(|o| o.status).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            [WorkStatus::Ok, WorkStatus::Ok, WorkStatus::Failed, WorkStatus::Failed]
        );
        assert!(batch.outputs[2].errors[0].contains("already submitted"));
        assert!(batch.outputs[3].errors[0].contains("unsupported image type"));

        let second = &batch.outputs[1].data;
        let record = store
            .get_record(second.record_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.record.cumulative_image_urls.len(), 2);

        let summary = &batch.summary;
        assert_eq!(summary.total_images, 4);
        assert_eq!(summary.processed_images, 2);
        assert_eq!(summary.failed_images, 2);
        assert_eq!(summary.barcode_numbers, ["111", "222"]);
        assert_eq!(summary.internal_numbers, ["INT-1"]);
        let contents = summary
            .contents
            .iter()
            .map(|item| (item.name.as_str(), item.qty))
            .collect::<Vec<_>>();
        assert_eq!(contents, [("shirt", 5), ("hat", 1)]);
        assert_eq!(
            store
                .get_records(&RecordQuery::default())
                .await
                .unwrap()
                .pagination
                .total_items,
            2
        );
    }

    #[tokio::test]
    async fn upload_failure_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.png");
        std::fs::write(&a, noisy_png(16, 16)).unwrap();
        let store = Arc::new(MemoryStore::new());
        let ctx = context(&[reply("111", "Shirt*2")], store.clone(), Arc::new(BrokenSink));

        let batch = scan_images(&Ui::init_for_tests(), ctx, vec![input(1, &a)])
            .await
            .unwrap();
        let output = &batch.outputs[0];
        assert_eq!(output.status, WorkStatus::Incomplete);
        assert!(output.errors[0].contains("disk full"));
        assert!(output.data.fields.is_some());
        assert!(output.data.record_id.is_none());
        assert_eq!(batch.summary.processed_images, 1);
        assert_eq!(batch.summary.contents.len(), 1);
    }

    #[tokio::test]
    async fn retries_ocr_with_original_after_compressed_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.png");
        let original = noisy_png(400, 200);
        std::fs::write(&path, &original).unwrap();

        let driver = Arc::new(ScriptedDriver::new([
            Err(VisionError::Status {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                body: "bad image".to_owned(),
            }),
            Ok(reply("111", "Shirt*2")),
        ]));
        let sink = Arc::new(MemorySink::default());
        let ctx = Arc::new(ScanContext {
            ocr: OcrClient::new(
                driver.clone(),
                OcrOpts {
                    retries: 0,
                    retry_backoff_ms: 0,
                    ..OcrOpts::default()
                },
            ),
            store: Arc::new(MemoryStore::new()),
            sink: sink.clone(),
            preprocess: PreprocessOpts {
                max_dimension: 100,
                ..PreprocessOpts::default()
            },
            job_count: 1,
        });

        let batch = scan_images(&Ui::init_for_tests(), ctx, vec![input(1, &path)])
            .await
            .unwrap();
        let output = &batch.outputs[0];
        assert_eq!(output.status, WorkStatus::Ok);
        assert!(output.errors[0].contains("OCR of compressed image failed"));
        assert!(output.data.record_id.is_some());
        assert_eq!(driver.calls(), 2);

        let files = sink.files.lock().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].1, original);
        assert_eq!(files[0].2, "image/png");
    }

    #[tokio::test]
    async fn rejects_oversized_files_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.png");
        std::fs::write(&path, noisy_png(64, 64)).unwrap();

        let driver = Arc::new(ScriptedDriver::replies([]));
        let ctx = Arc::new(ScanContext {
            ocr: OcrClient::new(driver.clone(), OcrOpts::default()),
            store: Arc::new(MemoryStore::new()),
            sink: Arc::new(MemorySink::default()),
            preprocess: PreprocessOpts {
                max_upload_bytes: 10,
                ..PreprocessOpts::default()
            },
            job_count: 1,
        });

        let batch = scan_images(&Ui::init_for_tests(), ctx, vec![input(1, &path)])
            .await
            .unwrap();
        let output = &batch.outputs[0];
        assert_eq!(output.status, WorkStatus::Failed);
        assert!(output.errors[0].contains("over the 10 byte limit"));
        assert_eq!(driver.calls(), 0);
    }

    #[test]
    fn scan_output_uses_camel_case() {
        let output = ScanOutput {
            overall_confidence: Some(0.9),
            record_id: Some(Uuid::nil()),
            ..ScanOutput::for_file("a.png")
        };
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["fileName"], "a.png");
        assert_eq!(value["overallConfidence"], 0.9);
        assert_eq!(value["recordId"], Uuid::nil().to_string());
    }
}
