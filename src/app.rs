use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::client::{CreateCollectionRequest, JobStore};
use crate::clock::Clock;
use crate::config::{
    CollectionTarget, ResolvedImageGeneration, ResolvedImageToVideo, ResolvedUprez,
};
use crate::dedup::{DEFAULT_PAGE_SIZE, DedupIndex, is_processed, scan_collection};
use crate::domain::{Algorithm, Collection, InputRef, ResultField, WorkUnit};
use crate::error::BatchError;
use crate::fetch::{FetchOutcome, IMAGE_ARTIFACT_FIELDS, fetch_artifact};
use crate::fs_util::list_images;
use crate::identity::{ParamsFingerprint, derive};
use crate::poller::{PollOptions, poll_until_terminal};
use crate::store::ArtifactStore;
use crate::submit::{DedupMode, SubmissionOutcome, SubmitOptions, Submitter};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub(crate) fn emit(sink: &dyn ProgressSink, message: impl Into<String>) {
    sink.event(ProgressEvent {
        message: message.into(),
        elapsed: None,
    });
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub dry_run: bool,
    pub page_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UnitState {
    Planned,
    SkippedDuplicate,
    FailedToSubmit { error: String },
    Submitted { job_id: String },
    Succeeded { job_id: String },
    Failed { job_id: String, error: Option<String> },
    TimedOut { job_id: String },
}

impl UnitState {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            UnitState::Submitted { job_id }
            | UnitState::Succeeded { job_id }
            | UnitState::Failed { job_id, .. }
            | UnitState::TimedOut { job_id } => Some(job_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub identifier: String,
    pub name: String,
    pub index: usize,
    #[serde(flatten)]
    pub state: UnitState,
    pub artifact: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub planned: usize,
    pub submitted: usize,
    pub skipped: usize,
    pub failed_to_submit: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub downloaded: usize,
    pub warnings: usize,
}

impl Summary {
    fn from_units(units: &[UnitReport], warnings: usize) -> Self {
        let mut summary = Summary {
            total: units.len(),
            warnings,
            ..Summary::default()
        };
        for unit in units {
            if unit.state.job_id().is_some() {
                summary.submitted += 1;
            }
            if unit.artifact.is_some() {
                summary.downloaded += 1;
            }
            match unit.state {
                UnitState::Planned => summary.planned += 1,
                UnitState::SkippedDuplicate => summary.skipped += 1,
                UnitState::FailedToSubmit { .. } => summary.failed_to_submit += 1,
                UnitState::Succeeded { .. } => summary.succeeded += 1,
                UnitState::Failed { .. } => summary.failed += 1,
                UnitState::TimedOut { .. } => summary.timed_out += 1,
                UnitState::Submitted { .. } => {}
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub algorithm: Algorithm,
    pub collection_id: Option<String>,
    pub dry_run: bool,
    pub started_at: String,
    pub finished_at: String,
    pub units: Vec<UnitReport>,
    pub warnings: Vec<String>,
    pub summary: Summary,
}

#[derive(Debug, Clone)]
pub struct ArtifactPlan {
    pub store: ArtifactStore,
    pub fields: Vec<ResultField>,
}

/// Everything one run needs once inputs are resolved into work units.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub algorithm: Algorithm,
    pub units: Vec<WorkUnit>,
    pub mode: DedupMode,
    /// Collection scanned for `BATCH_IDENTIFIER` tags before submitting.
    pub dedup_collection: Option<String>,
    /// Identifiers known to be done before the scan.
    pub known: DedupIndex,
    pub target_collection: Option<String>,
    pub poll: PollOptions,
    pub artifacts: Option<ArtifactPlan>,
    pub warnings: Vec<String>,
}

impl BatchPlan {
    pub fn new(
        algorithm: Algorithm,
        units: Vec<WorkUnit>,
        mode: DedupMode,
        poll: PollOptions,
    ) -> Self {
        Self {
            algorithm,
            units,
            mode,
            dedup_collection: None,
            known: DedupIndex::default(),
            target_collection: None,
            poll,
            artifacts: None,
            warnings: Vec::new(),
        }
    }
}

pub struct App<S: JobStore, C: Clock> {
    store: S,
    clock: C,
    options: RunOptions,
}

impl<S: JobStore, C: Clock> App<S, C> {
    pub fn new(store: S, clock: C) -> Self {
        Self {
            store,
            clock,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn image_to_video(
        &self,
        config: &ResolvedImageToVideo,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, BatchError> {
        let images = list_images(&config.image_dir)?;
        emit(sink, format!("found {} image(s)", images.len()));
        let units = image_to_video_units(&images, config);

        let mut warnings = Vec::new();
        let collection = self.resolve_collection(&config.collection, &mut warnings, sink)?;
        let collection_id = collection.map(|collection| collection.id);

        let mut plan =
            BatchPlan::new(Algorithm::WanI2v, units, DedupMode::Identifier, config.poll);
        plan.dedup_collection = collection_id.clone();
        plan.target_collection = collection_id;
        plan.warnings = warnings;
        self.run(plan, sink)
    }

    pub fn image_generation(
        &self,
        config: &ResolvedImageGeneration,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, BatchError> {
        let units = image_generation_units(config);
        let artifacts = ArtifactStore::new(
            config.output_dir.clone(),
            config.output_filename.clone(),
            "png",
            config.num_generations,
        );
        if !self.options.dry_run {
            artifacts.ensure_root()?;
        }
        emit(sink, format!("output directory: {}", artifacts.root()));

        let mut plan = BatchPlan::new(
            Algorithm::QwenImage,
            units,
            DedupMode::Identifier,
            config.poll,
        );
        plan.dedup_collection = config.collection_id.clone();
        plan.target_collection = config.collection_id.clone();
        plan.artifacts = Some(ArtifactPlan {
            store: artifacts,
            fields: IMAGE_ARTIFACT_FIELDS.to_vec(),
        });
        self.run(plan, sink)
    }

    pub fn uprez(
        &self,
        config: &ResolvedUprez,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, BatchError> {
        let mut warnings = Vec::new();
        let output = self.resolve_collection(&config.output, &mut warnings, sink)?;

        emit(
            sink,
            format!("fetching dreams from source playlist {}", config.source_collection),
        );
        let scan = scan_collection(&self.store, &config.source_collection, self.options.page_size);
        if let Some(error) = &scan.error {
            warnings.push(format!(
                "listing of source collection {} incomplete: {error}",
                config.source_collection
            ));
        }
        let sources = scan
            .items
            .iter()
            .filter_map(|item| item.job())
            .map(|job| (job.id.clone(), job.display_name().to_string()))
            .collect::<Vec<_>>();
        emit(sink, format!("found {} dream(s)", sources.len()));
        if sources.is_empty() && scan.error.is_some() {
            return Err(BatchError::EmptyInput(format!(
                "could not list source collection {}",
                config.source_collection
            )));
        }

        emit(
            sink,
            format!("scanning for already processed dreams (marker: '{}')", config.marker),
        );
        let units = uprez_units(&sources, config);
        let mut known = DedupIndex::default();
        for (unit, (source_id, _)) in units.iter().zip(&sources) {
            if is_processed(&self.store, source_id, &config.marker) {
                known.insert(unit.identifier.clone());
            }
        }

        let mut plan = BatchPlan::new(
            Algorithm::Uprez,
            units,
            DedupMode::Marker(config.marker.clone()),
            config.poll,
        );
        plan.known = known;
        plan.target_collection = output.map(|collection| collection.id);
        plan.warnings = warnings;
        self.run(plan, sink)
    }

    /// Returns the existing collection when it can be read, otherwise creates
    /// one from `target.create`. In a dry run nothing is created.
    pub fn resolve_collection(
        &self,
        target: &CollectionTarget,
        warnings: &mut Vec<String>,
        sink: &dyn ProgressSink,
    ) -> Result<Option<Collection>, BatchError> {
        if let Some(id) = &target.existing {
            match self.store.get_collection(id, false) {
                Ok(collection) => {
                    emit(
                        sink,
                        format!(
                            "using playlist: {}",
                            collection.name.as_deref().unwrap_or("Unnamed")
                        ),
                    );
                    return Ok(Some(collection));
                }
                Err(err) => {
                    tracing::warn!(collection = %id, error = %err, "cannot access collection");
                    warnings.push(format!("collection {id} not accessible: {err}"));
                }
            }
        }

        let Some(spec) = &target.create else {
            return Err(BatchError::InvalidConfig(
                "no usable playlist and no playlist config to create one".to_string(),
            ));
        };
        if self.options.dry_run {
            emit(sink, format!("would create playlist: {}", spec.name));
            return Ok(None);
        }

        emit(sink, format!("creating playlist: {}", spec.name));
        let collection = self.store.create_collection(&CreateCollectionRequest {
            name: spec.name.clone(),
            description: spec.description.clone(),
            nsfw: spec.nsfw,
        })?;
        tracing::info!(collection = %collection.id, "collection created");
        Ok(Some(collection))
    }

    /// Reconcile, submit, poll, fetch.
    pub fn run(&self, plan: BatchPlan, sink: &dyn ProgressSink) -> Result<RunReport, BatchError> {
        let started_at = iso_timestamp();
        let mut warnings = plan.warnings;

        let mut index = plan.known;
        if let Some(collection_id) = &plan.dedup_collection {
            let scan = scan_collection(&self.store, collection_id, self.options.page_size);
            if let Some(error) = &scan.error {
                warnings.push(format!(
                    "dedup scan of collection {collection_id} incomplete, duplicates possible: {error}"
                ));
            }
            let found = DedupIndex::build(&scan.items);
            emit(
                sink,
                format!("found {} existing job(s) in playlist", found.len()),
            );
            index.merge(found);
        }

        let mut submit_options = SubmitOptions::new(plan.algorithm, plan.mode);
        submit_options.target_collection = plan.target_collection.clone();
        submit_options.dry_run = self.options.dry_run;
        let mut submitter = Submitter::new(&self.store, &self.clock, submit_options);
        let submission = submitter.submit_all(&plan.units, &mut index, sink);
        warnings.extend(submission.warnings.iter().cloned());

        let mut states = submission
            .outcomes
            .iter()
            .map(|outcome| match outcome {
                SubmissionOutcome::Planned => UnitState::Planned,
                SubmissionOutcome::SkippedDuplicate => UnitState::SkippedDuplicate,
                SubmissionOutcome::Failed(error) => UnitState::FailedToSubmit {
                    error: error.clone(),
                },
                SubmissionOutcome::Submitted(job) => UnitState::Submitted {
                    job_id: job.id.clone(),
                },
            })
            .collect::<Vec<_>>();
        let mut artifacts = vec![None; plan.units.len()];

        let positions = submission
            .submitted()
            .map(|(position, job)| (job.id.clone(), position))
            .collect::<HashMap<_, _>>();
        if !positions.is_empty() {
            let ids = submission
                .submitted()
                .map(|(_, job)| job.id.clone())
                .collect::<Vec<_>>();
            emit(sink, format!("polling {} active job(s)", ids.len()));
            let outcome = poll_until_terminal(&self.store, &self.clock, &ids, plan.poll, sink);

            for job in &outcome.failed {
                if let Some(&position) = positions.get(&job.id) {
                    states[position] = UnitState::Failed {
                        job_id: job.id.clone(),
                        error: job.error.clone(),
                    };
                }
            }
            for id in &outcome.timed_out {
                if let Some(&position) = positions.get(id) {
                    states[position] = UnitState::TimedOut { job_id: id.clone() };
                }
            }
            for job in &outcome.succeeded {
                let Some(&position) = positions.get(&job.id) else {
                    continue;
                };
                states[position] = UnitState::Succeeded {
                    job_id: job.id.clone(),
                };
                let Some(artifact_plan) = &plan.artifacts else {
                    continue;
                };
                let unit = &plan.units[position];
                match fetch_artifact(
                    &self.store,
                    job,
                    &artifact_plan.fields,
                    &artifact_plan.store,
                    unit.index,
                ) {
                    Ok(FetchOutcome::Downloaded { path, .. }) => {
                        emit(sink, format!("  downloaded to {path}"));
                        artifacts[position] = Some(path.to_string());
                    }
                    Ok(FetchOutcome::NoUrl) => {
                        emit(sink, "  warning: no artifact URL found on job");
                        warnings.push(format!("job {} has no artifact URL", job.id));
                    }
                    Err(err) => {
                        tracing::warn!(job = %job.id, error = %err, "artifact download failed");
                        emit(sink, format!("  download failed: {err}"));
                        warnings.push(format!("download for job {} failed: {err}", job.id));
                    }
                }
            }

            if outcome.is_complete() {
                emit(sink, "all jobs accounted for");
            }
        }

        let units = plan
            .units
            .iter()
            .zip(states)
            .zip(artifacts)
            .map(|((unit, state), artifact)| UnitReport {
                identifier: unit.identifier.to_string(),
                name: unit.name.clone(),
                index: unit.index,
                state,
                artifact,
            })
            .collect::<Vec<_>>();
        let summary = Summary::from_units(&units, warnings.len());

        Ok(RunReport {
            algorithm: plan.algorithm,
            collection_id: plan.target_collection,
            dry_run: self.options.dry_run,
            started_at,
            finished_at: iso_timestamp(),
            units,
            warnings,
            summary,
        })
    }
}

/// One unit per image and combo, images outermost.
pub fn image_to_video_units(
    images: &[PathBuf],
    config: &ResolvedImageToVideo,
) -> Vec<WorkUnit> {
    let mut units = Vec::with_capacity(images.len() * config.combos.len());
    for image in images {
        let file_name = image
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem = image
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();

        for (combo_idx, combo) in config.combos.iter().enumerate() {
            let mut params = config.params.clone();
            let prompt = format!("{} {combo}", config.prompt).trim().to_string();
            params.insert("prompt".to_string(), Value::String(prompt));

            units.push(WorkUnit {
                identifier: derive(&file_name, &ParamsFingerprint::of_text(combo)),
                input: InputRef::LocalFile(image.clone()),
                params,
                name: format!("{stem}_combo-{}", combo_idx + 1),
                description: None,
                index: units.len() + 1,
            });
        }
    }
    units
}

pub fn image_generation_units(config: &ResolvedImageGeneration) -> Vec<WorkUnit> {
    let fingerprint = ParamsFingerprint::of_payload(&config.params);
    (1..=config.num_generations)
        .map(|idx| WorkUnit {
            identifier: derive(
                &format!("{}_{idx:04}", config.output_filename),
                &fingerprint,
            ),
            input: InputRef::None,
            params: config.params.clone(),
            name: format!("Qwen Image {idx}"),
            description: Some(format!("Generated image {idx}")),
            index: idx,
        })
        .collect()
}

/// `sources` are `(item id, display name)` pairs of the source collection.
pub fn uprez_units(sources: &[(String, String)], config: &ResolvedUprez) -> Vec<WorkUnit> {
    let fingerprint = ParamsFingerprint::of_payload(&config.params);
    sources
        .iter()
        .enumerate()
        .map(|(position, (id, name))| WorkUnit {
            identifier: derive(id, &fingerprint),
            input: InputRef::RemoteItem(id.clone()),
            params: config.params.clone(),
            name: format!("{name} (Uprez)"),
            description: Some(format!("Uprez of {id}")),
            index: position + 1,
        })
        .collect()
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_report(state: UnitState, artifact: Option<&str>) -> UnitReport {
        UnitReport {
            identifier: "a:1".to_string(),
            name: "a".to_string(),
            index: 1,
            state,
            artifact: artifact.map(str::to_string),
        }
    }

    #[test]
    fn summary_counts_each_outcome() {
        let units = vec![
            unit_report(UnitState::SkippedDuplicate, None),
            unit_report(
                UnitState::FailedToSubmit {
                    error: "rejected".to_string(),
                },
                None,
            ),
            unit_report(
                UnitState::Succeeded {
                    job_id: "j1".to_string(),
                },
                Some("out/a.png"),
            ),
            unit_report(
                UnitState::Failed {
                    job_id: "j2".to_string(),
                    error: None,
                },
                None,
            ),
            unit_report(
                UnitState::TimedOut {
                    job_id: "j3".to_string(),
                },
                None,
            ),
        ];
        let summary = Summary::from_units(&units, 2);
        assert_eq!(
            summary,
            Summary {
                total: 5,
                planned: 0,
                submitted: 3,
                skipped: 1,
                failed_to_submit: 1,
                succeeded: 1,
                failed: 1,
                timed_out: 1,
                downloaded: 1,
                warnings: 2,
            }
        );
    }

    #[test]
    fn unit_state_serializes_with_tag() {
        let value = serde_json::to_value(unit_report(
            UnitState::TimedOut {
                job_id: "j3".to_string(),
            },
            None,
        ))
        .unwrap();
        assert_eq!(value["state"], "timed_out");
        assert_eq!(value["job_id"], "j3");
    }
}
