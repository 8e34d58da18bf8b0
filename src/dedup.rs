use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::client::{JobStore, UpdateJobRequest};
use crate::domain::CollectionItem;
use crate::error::BatchError;
use crate::identity::Identifier;

pub const IDENTIFIER_MARKER: &str = "BATCH_IDENTIFIER:";
pub const DEFAULT_PAGE_SIZE: usize = 100;

static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"{}(\S+)", regex::escape(IDENTIFIER_MARKER)))
        .expect("identifier marker pattern is valid")
});

/// Identifiers already present in a collection. Built fresh every run.
#[derive(Debug, Clone, Default)]
pub struct DedupIndex {
    identifiers: BTreeSet<Identifier>,
}

impl DedupIndex {
    pub fn build(items: &[CollectionItem]) -> Self {
        let identifiers = items
            .iter()
            .filter_map(CollectionItem::job)
            .filter_map(|job| {
                let text = format!(
                    "{} {}",
                    job.description.as_deref().unwrap_or_default(),
                    job.name.as_deref().unwrap_or_default()
                );
                extract_identifier(&text)
            })
            .collect();
        Self { identifiers }
    }

    pub fn is_satisfied(&self, identifier: &Identifier) -> bool {
        self.identifiers.contains(identifier)
    }

    pub fn insert(&mut self, identifier: Identifier) {
        self.identifiers.insert(identifier);
    }

    pub fn merge(&mut self, other: DedupIndex) {
        self.identifiers.extend(other.identifiers);
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }
}

/// First token following `BATCH_IDENTIFIER:` in `text`.
pub fn extract_identifier(text: &str) -> Option<Identifier> {
    IDENTIFIER_RE
        .captures(text)
        .and_then(|captures| captures.get(1))
        .and_then(|token| token.as_str().parse().ok())
}

pub fn identifier_tag(identifier: &Identifier) -> String {
    format!("{IDENTIFIER_MARKER}{identifier}")
}

/// Items read from a collection. `error` is set when listing stopped early;
/// the items gathered up to that point are still returned.
#[derive(Debug, Clone, Default)]
pub struct CollectionScan {
    pub items: Vec<CollectionItem>,
    pub calls: usize,
    pub error: Option<String>,
}

impl CollectionScan {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

pub fn scan_collection<S: JobStore + ?Sized>(
    store: &S,
    collection_id: &str,
    page_size: usize,
) -> CollectionScan {
    let take = page_size.max(1);
    let mut scan = CollectionScan::default();
    let mut skip = 0usize;

    loop {
        scan.calls += 1;
        let page = match store.list_collection_items(collection_id, skip, take) {
            Ok(page) => page,
            Err(err) => {
                tracing::warn!(
                    collection = collection_id,
                    skip,
                    error = %err,
                    "collection listing failed; continuing with partial index"
                );
                scan.error = Some(err.to_string());
                break;
            }
        };

        let received = page.items.len();
        if received == 0 {
            break;
        }
        scan.items.extend(page.items);
        if scan.items.len() >= page.total_count || received < take {
            break;
        }
        skip += received;
    }

    tracing::debug!(
        collection = collection_id,
        items = scan.items.len(),
        calls = scan.calls,
        "collection scanned"
    );
    scan
}

/// Case-insensitive substring test used by the coarse "already processed"
/// mode.
pub fn has_marker(description: &str, marker: &str) -> bool {
    description
        .to_lowercase()
        .contains(&marker.to_lowercase())
}

/// Re-reads `item_id` and checks its description for `marker`. A failed
/// read counts as "not processed".
pub fn is_processed<S: JobStore + ?Sized>(store: &S, item_id: &str, marker: &str) -> bool {
    match store.get_job(item_id) {
        Ok(job) => has_marker(job.description.as_deref().unwrap_or_default(), marker),
        Err(err) => {
            tracing::debug!(item = item_id, error = %err, "marker check failed");
            false
        }
    }
}

/// Appends `marker` to the item's description unless it is already there.
/// Returns whether an update was sent.
pub fn mark_processed<S: JobStore + ?Sized>(
    store: &S,
    item_id: &str,
    marker: &str,
) -> Result<bool, BatchError> {
    let job = store.get_job(item_id)?;
    let current = job.description.unwrap_or_default();
    if has_marker(&current, marker) {
        return Ok(false);
    }
    let description = if current.is_empty() {
        marker.to_string()
    } else {
        format!("{current} {marker}")
    };
    store.update_job(
        item_id,
        &UpdateJobRequest {
            description: Some(description),
        },
    )?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ItemKind, RemoteJob};

    fn dream(id: &str, name: &str, description: &str) -> CollectionItem {
        CollectionItem {
            id: format!("item-{id}"),
            kind: ItemKind::Dream,
            job: Some(RemoteJob {
                id: id.to_string(),
                name: Some(name.to_string()),
                description: Some(description.to_string()),
                ..RemoteJob::default()
            }),
        }
    }

    #[test]
    fn extracts_token_after_marker() {
        let id = extract_identifier("Batch generation. BATCH_IDENTIFIER:cat.png:1a2b3c4d more");
        assert_eq!(id.unwrap().as_str(), "cat.png:1a2b3c4d");
        assert!(extract_identifier("no marker here").is_none());
        assert!(extract_identifier("BATCH_IDENTIFIER: ").is_none());
    }

    #[test]
    fn index_reads_description_and_name() {
        let items = vec![
            dream("1", "cat", "Batch generation. BATCH_IDENTIFIER:cat.png:aaaaaaaa"),
            dream("2", "BATCH_IDENTIFIER:dog.png:bbbbbbbb", ""),
            dream("3", "plain", "hand made"),
            CollectionItem {
                id: "item-4".to_string(),
                kind: ItemKind::Playlist,
                job: None,
            },
        ];
        let index = DedupIndex::build(&items);
        assert_eq!(index.len(), 2);
        assert!(index.is_satisfied(&"cat.png:aaaaaaaa".parse().unwrap()));
        assert!(index.is_satisfied(&"dog.png:bbbbbbbb".parse().unwrap()));
        assert!(!index.is_satisfied(&"cat.png:cccccccc".parse().unwrap()));
    }

    #[test]
    fn non_dream_items_are_ignored() {
        let mut item = dream("1", "x", "BATCH_IDENTIFIER:cat.png:aaaaaaaa");
        item.kind = ItemKind::Other;
        assert!(DedupIndex::build(&[item]).is_empty());
    }

    #[test]
    fn marker_match_is_case_insensitive() {
        assert!(has_marker("Great clip UPREZ", "uprez"));
        assert!(has_marker("uprez", "UpRez"));
        assert!(!has_marker("", "uprez"));
    }
}
