//! Paginated extraction of search results into the raw store.

use std::path::Path;

use async_trait::async_trait;
use docpipe_core::{ApiSettings, Pagination, QueryWindow, SettingsError};
use docpipe_storage::{
    append_json, write_json_array, FetchError, SearchClient, SearchPage, SearchRequest, StoreError,
};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

/// Returned by [`extract`] when at least one page of items was stored.
pub const EXTRACTED: u8 = 1;
/// Returned by [`extract`] when the first page came back empty.
pub const NOTHING_EXTRACTED: u8 = 0;

#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn fetch_page(&self, request: &SearchRequest) -> Result<SearchPage, FetchError>;
}

#[async_trait]
impl SearchApi for SearchClient {
    async fn fetch_page(&self, request: &SearchRequest) -> Result<SearchPage, FetchError> {
        SearchClient::fetch_page(self, request).await
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("response at offset {offset} carries items but no `total-results`")]
    MissingTotalResults { offset: u64 },
}

/// Fetch every page for `window` into `destination`.
///
/// The first non-empty page overwrites the file, later pages are appended in
/// fetch order. Returns [`EXTRACTED`] or [`NOTHING_EXTRACTED`]; this is a
/// success flag, not an item count.
pub async fn extract(
    window: &QueryWindow,
    destination: &Path,
    settings: &ApiSettings,
    api: &dyn SearchApi,
) -> Result<u8, ExtractError> {
    let Pagination { mut offset, rows } = settings.pagination()?;
    let span = info_span!("extract", %window, destination = %destination.display());

    async move {
        let first = api
            .fetch_page(&SearchRequest::for_page(settings, window, offset))
            .await?;
        if first.items.is_empty() {
            info!("first page is empty, raw store left untouched");
            return Ok(NOTHING_EXTRACTED);
        }

        let total_results = first
            .total_results
            .ok_or(ExtractError::MissingTotalResults { offset })?;
        write_json_array(&first.items, destination).await?;
        let mut stored = first.items.len();
        let mut pages = 1usize;

        while offset + rows <= total_results {
            offset += rows;
            let page = api
                .fetch_page(&SearchRequest::for_page(settings, window, offset))
                .await?;
            debug!(offset, items = page.items.len(), "fetched page");
            if !page.items.is_empty() {
                stored = append_json(&page.items, destination).await?;
                pages += 1;
            }
        }

        info!(pages, items = stored, total_results, "extraction finished");
        Ok::<_, ExtractError>(EXTRACTED)
    }
    .instrument(span)
    .await
}
