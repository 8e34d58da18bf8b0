use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use crate::app::{ProgressSink, emit};
use crate::client::{CreateJobRequest, JobStore, MediaType, UploadKind, UploadOptions};
use crate::clock::Clock;
use crate::dedup::{DedupIndex, identifier_tag, mark_processed};
use crate::domain::{Algorithm, InputRef, ItemKind, RemoteJob, ResultField, WorkUnit};
use crate::error::BatchError;

pub const ALGORITHM_FIELD: &str = "infinidream_algorithm";
pub const URL_RESOLVE_ATTEMPTS: usize = 10;
pub const URL_RESOLVE_DELAY: Duration = Duration::from_millis(500);
const URL_FIELDS: [ResultField; 3] = [
    ResultField::OriginalVideo,
    ResultField::Video,
    ResultField::Thumbnail,
];
const DEFAULT_DESCRIPTION: &str = "Batch generation.";

/// How a run recognizes work that was already done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupMode {
    /// `BATCH_IDENTIFIER:<id>` embedded in the new job's description.
    Identifier,
    /// Marker word appended to the source item's description.
    Marker(String),
}

#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub algorithm: Algorithm,
    pub mode: DedupMode,
    pub target_collection: Option<String>,
    pub url_attempts: usize,
    pub url_delay: Duration,
    pub dry_run: bool,
}

impl SubmitOptions {
    pub fn new(algorithm: Algorithm, mode: DedupMode) -> Self {
        Self {
            algorithm,
            mode,
            target_collection: None,
            url_attempts: URL_RESOLVE_ATTEMPTS,
            url_delay: URL_RESOLVE_DELAY,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SubmissionOutcome {
    Planned,
    SkippedDuplicate,
    Submitted(RemoteJob),
    Failed(String),
}

/// Per-unit outcomes, in the order the units were given.
#[derive(Debug, Clone, Default)]
pub struct SubmissionReport {
    pub outcomes: Vec<SubmissionOutcome>,
    pub warnings: Vec<String>,
}

impl SubmissionReport {
    pub fn submitted(&self) -> impl Iterator<Item = (usize, &RemoteJob)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(position, outcome)| match outcome {
                SubmissionOutcome::Submitted(job) => Some((position, job)),
                _ => None,
            })
    }
}

#[derive(Debug, Clone)]
enum UploadState {
    Ready(String),
    Failed(String),
}

pub struct Submitter<'a, S: JobStore + ?Sized, C: Clock + ?Sized> {
    store: &'a S,
    clock: &'a C,
    options: SubmitOptions,
    uploads: HashMap<PathBuf, UploadState>,
    warnings: Vec<String>,
}

impl<'a, S: JobStore + ?Sized, C: Clock + ?Sized> Submitter<'a, S, C> {
    pub fn new(store: &'a S, clock: &'a C, options: SubmitOptions) -> Self {
        Self {
            store,
            clock,
            options,
            uploads: HashMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Submits every unit not yet in `index`. A failing unit is recorded and
    /// the batch moves on; identifiers of created jobs are added to `index`
    /// so a repeated unit within the same run is not submitted twice.
    pub fn submit_all(
        &mut self,
        units: &[WorkUnit],
        index: &mut DedupIndex,
        sink: &dyn ProgressSink,
    ) -> SubmissionReport {
        let total = units.len();
        let mut outcomes = Vec::with_capacity(total);

        for (position, unit) in units.iter().enumerate() {
            let counter = format!("[{}/{}]", position + 1, total);
            if index.is_satisfied(&unit.identifier) {
                emit(
                    sink,
                    format!("{counter} skipping existing: {}", unit.identifier),
                );
                outcomes.push(SubmissionOutcome::SkippedDuplicate);
                continue;
            }
            if self.options.dry_run {
                emit(sink, format!("{counter} would submit {}", unit.name));
                index.insert(unit.identifier.clone());
                outcomes.push(SubmissionOutcome::Planned);
                continue;
            }

            emit(sink, format!("{counter} submitting {}", unit.name));
            match self.submit(unit) {
                Ok(job) => {
                    emit(sink, format!("  -> job started: {}", job.id));
                    index.insert(unit.identifier.clone());
                    outcomes.push(SubmissionOutcome::Submitted(job));
                }
                Err(err) => {
                    tracing::warn!(
                        identifier = %unit.identifier,
                        error = %err,
                        "failed to submit work unit"
                    );
                    emit(sink, format!("  -> failed to start job: {err}"));
                    outcomes.push(SubmissionOutcome::Failed(err.to_string()));
                }
            }
        }

        SubmissionReport {
            outcomes,
            warnings: std::mem::take(&mut self.warnings),
        }
    }

    pub fn submit(&mut self, unit: &WorkUnit) -> Result<RemoteJob, BatchError> {
        let source = match &unit.input {
            InputRef::LocalFile(path) => Some(self.uploaded_source(path)?),
            InputRef::RemoteItem(id) => Some(id.clone()),
            InputRef::None => None,
        };

        let request = CreateJobRequest {
            name: unit.name.clone(),
            description: self.description(unit),
            prompt: self.payload(unit, source.as_deref())?,
        };
        let job = self.store.create_job(&request)?;
        tracing::info!(job = %job.id, identifier = %unit.identifier, "job created");

        if let Some(collection) = &self.options.target_collection {
            if let Err(err) = self
                .store
                .add_item_to_collection(collection, ItemKind::Dream, &job.id)
            {
                tracing::warn!(
                    job = %job.id,
                    collection = %collection,
                    error = %err,
                    "failed to add job to collection"
                );
                self.warnings
                    .push(format!("job {} not added to collection {collection}: {err}", job.id));
            }
        }

        if let (DedupMode::Marker(marker), InputRef::RemoteItem(source_id)) =
            (&self.options.mode, &unit.input)
        {
            if let Err(err) = mark_processed(self.store, source_id, marker) {
                tracing::warn!(
                    item = %source_id,
                    error = %err,
                    "failed to mark source as processed"
                );
                self.warnings
                    .push(format!("source {source_id} not marked as processed: {err}"));
            }
        }

        Ok(job)
    }

    fn description(&self, unit: &WorkUnit) -> String {
        match self.options.mode {
            DedupMode::Identifier => format!(
                "{} {}",
                unit.description.as_deref().unwrap_or(DEFAULT_DESCRIPTION),
                identifier_tag(&unit.identifier)
            ),
            DedupMode::Marker(_) => unit.description.clone().unwrap_or_default(),
        }
    }

    fn payload(&self, unit: &WorkUnit, source: Option<&str>) -> Result<String, BatchError> {
        let mut payload = unit.params.clone();
        payload.insert(
            ALGORITHM_FIELD.to_string(),
            Value::String(self.options.algorithm.as_str().to_string()),
        );
        if let (Some(field), Some(source)) = (self.options.algorithm.input_field(), source) {
            payload.insert(field.to_string(), Value::String(source.to_string()));
        }
        serde_json::to_string(&Value::Object(payload))
            .map_err(|err| BatchError::InvalidConfig(err.to_string()))
    }

    fn uploaded_source(&mut self, path: &Path) -> Result<String, BatchError> {
        if let Some(state) = self.uploads.get(path) {
            return match state {
                UploadState::Ready(reference) => Ok(reference.clone()),
                UploadState::Failed(message) => Err(BatchError::Upload {
                    path: path.to_path_buf(),
                    message: message.clone(),
                }),
            };
        }

        let result = self.upload(path);
        let state = match &result {
            Ok(reference) => UploadState::Ready(reference.clone()),
            Err(err) => UploadState::Failed(err.to_string()),
        };
        self.uploads.insert(path.to_path_buf(), state);
        result.map_err(|err| match err {
            BatchError::Upload { .. } => err,
            other => BatchError::Upload {
                path: path.to_path_buf(),
                message: other.to_string(),
            },
        })
    }

    fn upload(&mut self, path: &Path) -> Result<String, BatchError> {
        let item = self.store.upload_file(
            path,
            UploadKind::Dream,
            &UploadOptions {
                media_type: MediaType::Image,
            },
        )?;
        tracing::info!(path = %path.display(), item = %item.id, "input uploaded");

        if !self.options.algorithm.requires_url() {
            return Ok(item.id);
        }

        match resolve_presigned_url(
            self.store,
            self.clock,
            &item.id,
            self.options.url_attempts,
            self.options.url_delay,
        ) {
            Some(url) => Ok(url),
            None => {
                tracing::warn!(
                    item = %item.id,
                    attempts = self.options.url_attempts,
                    "no presigned URL; falling back to item id"
                );
                self.warnings.push(format!(
                    "no presigned URL for {} after {} attempts; using item id {}",
                    path.display(),
                    self.options.url_attempts,
                    item.id
                ));
                Ok(item.id)
            }
        }
    }
}

/// Polls a freshly uploaded item until one of its media fields holds an
/// absolute URL. Returns `None` once `attempts` reads came back without one.
pub fn resolve_presigned_url<S: JobStore + ?Sized, C: Clock + ?Sized>(
    store: &S,
    clock: &C,
    item_id: &str,
    attempts: usize,
    delay: Duration,
) -> Option<String> {
    for attempt in 0..attempts {
        match store.get_job(item_id) {
            Ok(item) => {
                let url = URL_FIELDS
                    .iter()
                    .find_map(|field| item.field(*field).filter(|value| is_absolute_url(value)));
                if let Some(url) = url {
                    return Some(url.to_string());
                }
            }
            Err(err) => {
                tracing::debug!(
                    item = item_id,
                    attempt = attempt + 1,
                    error = %err,
                    "upload lookup failed"
                );
            }
        }
        if attempt + 1 < attempts {
            clock.sleep(delay);
        }
    }
    None
}

fn is_absolute_url(value: &str) -> bool {
    value.starts_with("https://") || value.starts_with("http://")
}
