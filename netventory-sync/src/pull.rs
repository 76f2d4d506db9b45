//! Pull processor (C5).
//!
//! Delivers rows changed since a cursor for a requested set of model
//! kinds, tombstones included. Replies are capped; a truncated reply
//! carries a resume cursor so the caller can page through without
//! skipping rows that share an `updated_at` boundary.

use netventory_core::{PullBatch, PullCursor, PullRequest, PullSyncState, StoredRecord, SyncResult};

use crate::store::RecordStore;

/// Tunables for a pull call.
#[derive(Debug, Clone)]
pub struct PullOptions {
    /// Maximum rows per reply.
    pub page_size: usize,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self { page_size: 1000 }
    }
}

/// Resume cursor pointing just past the last delivered row.
fn cursor_after(last: &StoredRecord) -> PullCursor {
    PullCursor {
        since: last.updated_at,
        model: Some(last.model),
        uuid: Some(last.uuid),
    }
}

/// Serve a pull request. Reads only; the caller owns transaction scope.
pub async fn process_pull<S: RecordStore>(
    store: &S,
    request: &PullRequest,
    options: &PullOptions,
) -> SyncResult<PullBatch> {
    let cursor = request
        .cursor
        .clone()
        .unwrap_or_else(|| PullCursor::at(request.since));

    // Fetch one row past the cap to detect truncation.
    let mut rows = store
        .changed_since(&request.models, &cursor, options.page_size + 1)
        .await?;

    let truncated = rows.len() > options.page_size;
    rows.truncate(options.page_size);

    let next_cursor = if truncated {
        rows.last().map(cursor_after)
    } else {
        None
    };

    tracing::debug!(
        models = request.models.len(),
        rows = rows.len(),
        truncated,
        "pull served"
    );

    Ok(PullBatch {
        records: rows.iter().map(StoredRecord::to_wire).collect(),
        sync_state: PullSyncState {
            truncated,
            cursor: next_cursor,
        },
    })
}
