//! Input and output records for batch work, and the counters we keep while
//! writing them out.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use crate::{
    async_utils::{
        BoxedStream,
        io::{read_jsonl_or_csv, write_output},
    },
    cmd::StreamOpts,
    prelude::*,
    ui::Ui,
};

/// Input record for a batch of work.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct WorkInput<T>
where
    T: 'static,
{
    /// The unique ID of the work item.
    pub id: Value,

    /// The input data for the work item.
    #[serde(flatten)]
    pub data: T,
}

impl<T> WorkInput<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Convert from a JSON value to the input type.
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value::<Self>(value).context("failed to deserialize input")
    }

    /// Read a stream from a [`Path`] or from standard input.
    pub async fn read_stream(path: Option<&Path>) -> Result<BoxedStream<Result<Self>>> {
        Ok(read_jsonl_or_csv(path)
            .await?
            .map(|value| Self::from_json(value?))
            .boxed())
    }
}

/// Output status of a work item.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    // The work item was successful.
    Ok,

    // Usable data, but something we needed to finish the job went wrong.
    Incomplete,

    // The work item failed.
    Failed,
}

/// Output record for a batch of work.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct WorkOutput<T>
where
    T: 'static,
{
    /// The unique ID of the work item.
    pub id: Value,

    /// What is the status of this work item?
    pub status: WorkStatus,

    /// Any errors that occurred during processing. Successful items may
    /// still have non-fatal errors, like retried requests.
    pub errors: Vec<String>,

    /// The output data for the work item.
    #[serde(flatten)]
    pub data: T,
}

impl<T> WorkOutput<T>
where
    T: Clone + Serialize + Send + 'static,
{
    /// Create a new failed output record.
    pub fn new_failed(id: Value, errors: Vec<String>, data: T) -> Self {
        Self {
            id,
            status: WorkStatus::Failed,
            errors,
            data,
        }
    }

    /// Convert from the output type to a JSON value.
    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value::<&Self>(self).context("failed to serialize output")
    }

    /// Write a stream of outputs to a [`Path`] or to standard output.
    pub async fn write_stream(
        ui: &Ui,
        path: Option<&Path>,
        stream: BoxedStream<Result<Self>>,
        stream_opts: &StreamOpts,
    ) -> Result<()> {
        let (stream, counters) = WorkOutputCounters::wrap_stream(stream);
        let output = stream
            .map(|value| {
                let value = value?;
                value.to_json()
            })
            .boxed();
        write_output(path, output).await?;
        counters.finish(ui, stream_opts)
    }
}

/// Counters associated with a work item.
#[derive(Clone, Debug, Default)]
pub struct WorkOutputCounters {
    /// How many records did we process?
    pub total_record_count: usize,

    /// How many records did we fail to process?
    pub failure_count: usize,

    /// How many records produced usable data, but not everything we wanted?
    pub incomplete_count: usize,

    /// How many non-fatal errors did we encounter?
    pub non_fatal_error_count: usize,
}

impl WorkOutputCounters {
    /// Wrap a stream with counters.
    pub fn wrap_stream<T>(
        stream: BoxedStream<Result<WorkOutput<T>>>,
    ) -> (
        BoxedStream<Result<WorkOutput<T>>>,
        Arc<Mutex<WorkOutputCounters>>,
    ) {
        let counters = Arc::new(Mutex::new(Self::default()));
        let counters_clone = counters.clone();
        let stream = stream
            .map(move |value| {
                let value = value?;
                counters_clone.update(&value);
                Ok(value)
            })
            .boxed();
        (stream, counters)
    }

    /// How many records produced usable data?
    pub fn usable_count(&self) -> usize {
        self.total_record_count - self.failure_count
    }
}

/// We actually want to put methods in `Mutex<WorkOutputCounters>`, because
/// that's the type we actually work with. To do that, we need to define an
/// extension trait with the methods we want.
pub trait WorkItemCounterExt {
    /// Update counters for a work item.
    fn update<T>(&self, item: &WorkOutput<T>);

    /// Display counter values to the user, and fail if too few items worked.
    fn finish(self: Arc<Self>, ui: &Ui, stream_opts: &StreamOpts) -> Result<()>;
}

impl WorkItemCounterExt for Mutex<WorkOutputCounters> {
    fn update<T>(&self, item: &WorkOutput<T>) {
        // Hold a sync lock, but just for an instant to update counters.
        let mut counters = self.lock().expect("lock poisoned");
        counters.total_record_count += 1;
        match item.status {
            WorkStatus::Failed => counters.failure_count += 1,
            WorkStatus::Incomplete => counters.incomplete_count += 1,
            WorkStatus::Ok => {
                counters.non_fatal_error_count += item.errors.len();
            }
        }
    }

    fn finish(self: Arc<Self>, ui: &Ui, stream_opts: &StreamOpts) -> Result<()> {
        let counters = self.lock().expect("lock poisoned").to_owned();
        if counters.total_record_count > 0 && counters.usable_count() == 0 {
            return Err(anyhow!(
                "none of the {} inputs could be processed",
                counters.total_record_count
            ));
        }
        if let Some(allowed_failure_rate) = stream_opts.allowed_failure_rate {
            let failure_rate =
                counters.failure_count as f32 / counters.total_record_count.max(1) as f32;
            if failure_rate > allowed_failure_rate {
                return Err(anyhow!(
                    "{}/{} ({:.2}%) of outputs were failures, but only {:.2}% were allowed",
                    counters.failure_count,
                    counters.total_record_count,
                    failure_rate * 100.0,
                    allowed_failure_rate * 100.0
                ));
            }
        }
        if counters.non_fatal_error_count > 0 {
            ui.display_message(
                "⚠️",
                &format!(
                    "{} non-fatal errors encountered",
                    counters.non_fatal_error_count
                ),
            );
        }
        if counters.incomplete_count > 0 {
            ui.display_message(
                "🧩",
                &format!("{} records were only partly processed", counters.incomplete_count),
            );
        }
        if counters.failure_count > 0 {
            ui.display_message(
                "❌",
                &format!("{} records could not be processed", counters.failure_count),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    fn output(status: WorkStatus, errors: &[&str]) -> WorkOutput<Value> {
        WorkOutput {
            id: json!(1),
            status,
            errors: errors.iter().map(|e| e.to_string()).collect(),
            data: json!({}),
        }
    }

    fn stream_opts(allowed_failure_rate: Option<f32>) -> StreamOpts {
        StreamOpts {
            take_first: None,
            job_count: 1,
            allowed_failure_rate,
        }
    }

    #[test]
    fn counts_outcomes() {
        let counters = Arc::new(Mutex::new(WorkOutputCounters::default()));
        counters.update(&output(WorkStatus::Ok, &["retried"]));
        counters.update(&output(WorkStatus::Incomplete, &["upload failed"]));
        counters.update(&output(WorkStatus::Failed, &["bad image"]));
        let snapshot = counters.lock().unwrap().clone();
        assert_eq!(snapshot.total_record_count, 3);
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.incomplete_count, 1);
        assert_eq!(snapshot.non_fatal_error_count, 1);
        assert_eq!(snapshot.usable_count(), 2);

        let ui = Ui::init_for_tests();
        assert!(counters.clone().finish(&ui, &stream_opts(None)).is_ok());
        assert!(counters.finish(&ui, &stream_opts(Some(0.1))).is_err());
    }

    #[test]
    fn fails_when_nothing_worked() {
        let counters = Arc::new(Mutex::new(WorkOutputCounters::default()));
        counters.update(&output(WorkStatus::Failed, &["x"]));
        let ui = Ui::init_for_tests();
        let err = counters.finish(&ui, &stream_opts(None)).unwrap_err();
        assert!(err.to_string().contains("none of the 1 inputs"));
    }

    #[tokio::test]
    async fn wrapped_stream_updates_counters() {
        let input: BoxedStream<Result<WorkOutput<Value>>> =
            stream::iter(vec![Ok(output(WorkStatus::Ok, &[]))]).boxed();
        let (stream, counters) = WorkOutputCounters::wrap_stream(input);
        let items = stream.collect::<Vec<_>>().await;
        assert_eq!(items.len(), 1);
        assert_eq!(counters.lock().unwrap().total_record_count, 1);
    }
}
