//! Paged export of a logbook and the streaming JSON array writer that
//! serializes it.

use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::models::LogEntry;
use crate::storage::{LogEntryQuery, LogEntryRepository};

/// Which entries an export covers and in what order.
pub type ExportFilter = LogEntryQuery;

pub struct ExportStreamer<S> {
    store: Arc<S>,
    page_size: usize,
}

impl<S> ExportStreamer<S>
where
    S: LogEntryRepository + 'static,
{
    pub fn new(store: Arc<S>, config: &PipelineConfig) -> Self {
        Self {
            store,
            page_size: config.export_page_size.max(1),
        }
    }

    /// Entries matching `filter`, one page fetched per `exportPageSize`
    /// entries consumed. Ends after the first short page. A failed page
    /// query is yielded as the final item.
    pub fn begin_export(
        &self,
        filter: ExportFilter,
    ) -> impl Stream<Item = Result<LogEntry>> + Send + 'static {
        let store = Arc::clone(&self.store);
        let page_size = self.page_size;

        stream! {
            let mut skip = 0;
            loop {
                let page = match store.list_log_entries(&filter, skip, page_size).await {
                    Ok(page) => page,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };
                let fetched = page.len();
                debug!(owner = %filter.owner, skip, fetched, "export page fetched");
                for entry in page {
                    yield Ok(entry);
                }
                if fetched < page_size {
                    break;
                }
                skip += fetched;
            }
        }
    }
}

/// Writes `items` to `out` as one JSON array, an element at a time.
///
/// On an item error the error is returned immediately and the closing `]` is
/// never written, so a consumer sees a truncated document rather than a
/// complete-looking one. Returns the number of elements written.
#[instrument(skip_all)]
pub async fn write_json_array<W, T, St>(items: St, out: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
    St: Stream<Item = Result<T>>,
{
    let mut items = std::pin::pin!(items);
    let mut written = 0u64;

    out.write_all(b"[").await?;
    while let Some(item) = items.next().await {
        let item = match item {
            Ok(item) => item,
            Err(err) => {
                warn!(written, error = %err, "export aborted mid-stream");
                return Err(err);
            }
        };
        let json = serde_json::to_vec(&item)?;
        if written > 0 {
            out.write_all(b",").await?;
        }
        out.write_all(&json).await?;
        written += 1;
    }
    out.write_all(b"]").await?;
    out.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::error::LogbookError;

    #[tokio::test]
    async fn writes_a_complete_array() {
        let mut out = Vec::new();
        let items = stream::iter(vec![Ok(1u32), Ok(2), Ok(3)]);
        let written = write_json_array(items, &mut out).await.unwrap();
        assert_eq!(written, 3);
        assert_eq!(String::from_utf8(out).unwrap(), "[1,2,3]");

        let mut out = Vec::new();
        let written = write_json_array(stream::iter(Vec::<Result<u32>>::new()), &mut out)
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(out, b"[]");
    }

    #[tokio::test]
    async fn leaves_the_array_open_on_error() {
        let mut out = Vec::new();
        let items = stream::iter(vec![
            Ok("a".to_string()),
            Err(LogbookError::InvalidState("storage went away".into())),
            Ok("b".to_string()),
        ]);
        let err = write_json_array(items, &mut out).await.unwrap_err();
        assert!(matches!(err, LogbookError::InvalidState(_)));
        assert_eq!(String::from_utf8(out).unwrap(), r#"["a""#);
        assert!(serde_json::from_slice::<serde_json::Value>(br#"["a""#).is_err());
    }
}
