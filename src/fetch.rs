use camino::Utf8PathBuf;

use crate::client::JobStore;
use crate::domain::{RemoteJob, ResultField};
use crate::error::BatchError;
use crate::store::ArtifactStore;

/// Result fields tried for image artifacts: the rendered frame first, the
/// video as fallback.
pub const IMAGE_ARTIFACT_FIELDS: [ResultField; 2] =
    [ResultField::Thumbnail, ResultField::Video];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded { path: Utf8PathBuf, bytes: u64 },
    NoUrl,
}

pub fn resolve_result_url<'a>(job: &'a RemoteJob, fields: &[ResultField]) -> Option<&'a str> {
    fields.iter().find_map(|field| job.field(*field))
}

/// Downloads the artifact of a succeeded job to the file named for `index`.
/// A job without any usable URL yields `FetchOutcome::NoUrl`.
pub fn fetch_artifact<S: JobStore + ?Sized>(
    store: &S,
    job: &RemoteJob,
    fields: &[ResultField],
    artifacts: &ArtifactStore,
    index: usize,
) -> Result<FetchOutcome, BatchError> {
    let Some(url) = resolve_result_url(job, fields) else {
        tracing::warn!(job = %job.id, "no artifact URL on job record");
        return Ok(FetchOutcome::NoUrl);
    };

    let path = artifacts.artifact_path(index);
    let bytes = artifacts.write_atomic(&path, |temp| store.download(url, temp))?;
    tracing::info!(job = %job.id, path = %path, bytes, "artifact saved");
    Ok(FetchOutcome::Downloaded { path, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_resolution_follows_field_order() {
        let job = RemoteJob {
            id: "j".to_string(),
            thumbnail: Some(String::new()),
            video: Some("https://cdn/v.mp4".to_string()),
            original_video: Some("https://cdn/o.mp4".to_string()),
            ..RemoteJob::default()
        };
        assert_eq!(
            resolve_result_url(&job, &IMAGE_ARTIFACT_FIELDS),
            Some("https://cdn/v.mp4")
        );
        assert_eq!(
            resolve_result_url(&job, &[ResultField::OriginalVideo, ResultField::Video]),
            Some("https://cdn/o.mp4")
        );
        assert_eq!(resolve_result_url(&job, &[ResultField::Thumbnail]), None);
    }
}
