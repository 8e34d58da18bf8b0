#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use edream_batch::app::{ProgressEvent, ProgressSink};
use edream_batch::client::{
    CreateCollectionRequest, CreateJobRequest, JobStore, UpdateJobRequest, UploadKind,
    UploadOptions,
};
use edream_batch::clock::Clock;
use edream_batch::domain::{
    Collection, CollectionItem, CollectionPage, ItemKind, JobStatus, RemoteJob,
};
use edream_batch::error::BatchError;

/// In-memory job store. Created jobs take `default_status` immediately,
/// unless their name is listed in `failing_names`.
pub struct MockStore {
    pub state: Mutex<MockState>,
}

pub struct MockState {
    pub jobs: BTreeMap<String, RemoteJob>,
    pub collections: BTreeMap<String, Vec<String>>,
    pub next_id: usize,
    pub created: Vec<CreateJobRequest>,
    pub updates: Vec<(String, UpdateJobRequest)>,
    pub uploads: Vec<PathBuf>,
    pub created_collections: Vec<String>,
    pub list_calls: usize,
    pub get_calls: HashMap<String, usize>,
    pub downloads: Vec<String>,
    pub default_status: JobStatus,
    pub failing_names: Vec<String>,
    pub fail_list: bool,
    /// Number of listing calls that succeed before every later one fails.
    pub fail_list_after: Option<usize>,
    pub fail_attach: bool,
    pub fail_upload: bool,
    pub upload_url: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            jobs: BTreeMap::new(),
            collections: BTreeMap::new(),
            next_id: 0,
            created: Vec::new(),
            updates: Vec::new(),
            uploads: Vec::new(),
            created_collections: Vec::new(),
            list_calls: 0,
            get_calls: HashMap::new(),
            downloads: Vec::new(),
            default_status: JobStatus::Succeeded,
            failing_names: Vec::new(),
            fail_list: false,
            fail_list_after: None,
            fail_attach: false,
            fail_upload: false,
            upload_url: true,
        }
    }
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with(configure: impl FnOnce(&mut MockState)) -> Self {
        let store = Self::new();
        configure(&mut store.state.lock().unwrap());
        store
    }

    /// Seeds a job directly into a collection, as if made by an earlier run.
    pub fn seed_job(&self, collection_id: &str, id: &str, name: &str, description: &str) {
        let mut state = self.state.lock().unwrap();
        state.jobs.insert(
            id.to_string(),
            RemoteJob {
                id: id.to_string(),
                name: Some(name.to_string()),
                description: Some(description.to_string()),
                status: Some(JobStatus::Succeeded),
                ..RemoteJob::default()
            },
        );
        state
            .collections
            .entry(collection_id.to_string())
            .or_default()
            .push(id.to_string());
    }

    pub fn seed_collection(&self, collection_id: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .collections
            .entry(collection_id.to_string())
            .or_default();
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().unwrap().created.len()
    }

    pub fn get_calls(&self, id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .get_calls
            .get(id)
            .copied()
            .unwrap_or(0)
    }
}

impl JobStore for MockStore {
    fn create_job(&self, request: &CreateJobRequest) -> Result<RemoteJob, BatchError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("job-{}", state.next_id);
        let status = if state.failing_names.contains(&request.name) {
            JobStatus::Failed
        } else {
            state.default_status
        };
        let job = RemoteJob {
            id: id.clone(),
            name: Some(request.name.clone()),
            description: Some(request.description.clone()),
            status: Some(status),
            error: (status == JobStatus::Failed).then(|| "render crashed".to_string()),
            original_video: None,
            video: Some(format!("https://cdn.example/{id}.mp4")),
            thumbnail: Some(format!("https://cdn.example/{id}.png")),
        };
        state.jobs.insert(id, job.clone());
        state.created.push(request.clone());
        // The service answers creation before the job starts.
        Ok(RemoteJob {
            status: Some(JobStatus::Pending),
            ..job
        })
    }

    fn get_job(&self, id: &str) -> Result<RemoteJob, BatchError> {
        let mut state = self.state.lock().unwrap();
        *state.get_calls.entry(id.to_string()).or_default() += 1;
        state.jobs.get(id).cloned().ok_or(BatchError::Status {
            status: 404,
            message: format!("no job {id}"),
        })
    }

    fn update_job(&self, id: &str, update: &UpdateJobRequest) -> Result<(), BatchError> {
        let mut state = self.state.lock().unwrap();
        let job = state.jobs.get_mut(id).ok_or(BatchError::Status {
            status: 404,
            message: format!("no job {id}"),
        })?;
        if let Some(description) = &update.description {
            job.description = Some(description.clone());
        }
        state.updates.push((id.to_string(), update.clone()));
        Ok(())
    }

    fn upload_file(
        &self,
        path: &Path,
        _kind: UploadKind,
        _options: &UploadOptions,
    ) -> Result<RemoteJob, BatchError> {
        let mut state = self.state.lock().unwrap();
        state.uploads.push(path.to_path_buf());
        if state.fail_upload {
            return Err(BatchError::Status {
                status: 500,
                message: "storage unavailable".to_string(),
            });
        }
        state.next_id += 1;
        let id = format!("upload-{}", state.next_id);
        let item = RemoteJob {
            id: id.clone(),
            original_video: state
                .upload_url
                .then(|| format!("https://bucket.example/{id}.png?sig=abc")),
            ..RemoteJob::default()
        };
        state.jobs.insert(id, item.clone());
        Ok(RemoteJob {
            original_video: None,
            ..item
        })
    }

    fn list_collection_items(
        &self,
        collection_id: &str,
        skip: usize,
        take: usize,
    ) -> Result<CollectionPage, BatchError> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        let past_limit = state
            .fail_list_after
            .is_some_and(|limit| state.list_calls > limit);
        if state.fail_list || past_limit {
            return Err(BatchError::Http("connection reset".to_string()));
        }
        let ids = state
            .collections
            .get(collection_id)
            .cloned()
            .ok_or(BatchError::Status {
                status: 404,
                message: format!("no playlist {collection_id}"),
            })?;
        let items = ids
            .iter()
            .skip(skip)
            .take(take)
            .map(|id| CollectionItem {
                id: format!("item-{id}"),
                kind: ItemKind::Dream,
                job: state.jobs.get(id).cloned(),
            })
            .collect();
        Ok(CollectionPage {
            items,
            total_count: ids.len(),
        })
    }

    fn create_collection(
        &self,
        request: &CreateCollectionRequest,
    ) -> Result<Collection, BatchError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("playlist-{}", state.next_id);
        state.collections.insert(id.clone(), Vec::new());
        state.created_collections.push(request.name.clone());
        Ok(Collection {
            id,
            name: Some(request.name.clone()),
            items: Vec::new(),
        })
    }

    fn add_item_to_collection(
        &self,
        collection_id: &str,
        _kind: ItemKind,
        item_id: &str,
    ) -> Result<(), BatchError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_attach {
            return Err(BatchError::Status {
                status: 500,
                message: "playlist update failed".to_string(),
            });
        }
        let items = state
            .collections
            .get_mut(collection_id)
            .ok_or(BatchError::Status {
                status: 404,
                message: format!("no playlist {collection_id}"),
            })?;
        items.push(item_id.to_string());
        Ok(())
    }

    fn get_collection(&self, id: &str, _auto_populate: bool) -> Result<Collection, BatchError> {
        let state = self.state.lock().unwrap();
        if !state.collections.contains_key(id) {
            return Err(BatchError::Status {
                status: 404,
                message: format!("no playlist {id}"),
            });
        }
        Ok(Collection {
            id: id.to_string(),
            name: Some(format!("Playlist {id}")),
            items: Vec::new(),
        })
    }

    fn download(&self, url: &str, destination: &Path) -> Result<u64, BatchError> {
        self.state.lock().unwrap().downloads.push(url.to_string());
        fs::write(destination, url.as_bytes())
            .map_err(|err| BatchError::Filesystem(err.to_string()))?;
        Ok(url.len() as u64)
    }
}

/// Clock whose time only moves when something sleeps on it.
pub struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
    pub sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }

    pub fn sleep_count(&self) -> usize {
        self.sleeps.lock().unwrap().len()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *self.offset.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        *self.offset.lock().unwrap() += duration;
        self.sleeps.lock().unwrap().push(duration);
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}
