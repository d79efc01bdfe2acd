//! Batch conversion API: emit documents as they complete.
//!
//! Each request is an independent [`crate::convert::convert`] with its own
//! request id and artifacts; a failure in one never affects the others. Up
//! to `config.concurrency` requests run at once and results arrive in
//! completion order (sort by [`BatchItem::index`] if order matters).

use crate::config::ConversionConfig;
use crate::convert::convert;
use crate::error::Html2DocxError;
use crate::output::ConversionOutput;
use crate::request::ConversionRequest;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use tokio_stream::Stream;
use tracing::info;

/// One finished request of a batch.
#[derive(Debug)]
pub struct BatchItem {
    /// Position of the request in the submitted batch.
    pub index: usize,
    /// Upload name of the request, kept for reporting failures.
    pub filename: String,
    pub result: Result<ConversionOutput, Html2DocxError>,
}

/// A boxed stream of batch results.
pub type ConversionStream = Pin<Box<dyn Stream<Item = BatchItem> + Send>>;

/// Convert many uploads concurrently, streaming results as they are ready.
///
/// # Example
/// ```rust,no_run
/// use edgequake_html2docx::{convert_stream, ConversionConfig, ConversionRequest};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() {
/// let requests = vec![
///     ConversionRequest::new("<p>one</p>", "one.html", "text/html"),
///     ConversionRequest::new("<p>two</p>", "two.html", "text/html"),
/// ];
/// let mut results = convert_stream(requests, &ConversionConfig::default());
/// while let Some(item) = results.next().await {
///     match item.result {
///         Ok(doc) => println!("{} -> {}", item.filename, doc.filename),
///         Err(e) => eprintln!("{}: {e}", item.filename),
///     }
/// }
/// # }
/// ```
pub fn convert_stream(
    requests: impl IntoIterator<Item = ConversionRequest>,
    config: &ConversionConfig,
) -> ConversionStream {
    let requests: Vec<ConversionRequest> = requests.into_iter().collect();
    let concurrency = config.concurrency.max(1);
    info!(
        "Starting batch conversion: {} documents, concurrency {}",
        requests.len(),
        concurrency
    );

    let config = config.clone();
    let s = stream::iter(requests.into_iter().enumerate().map(move |(index, request)| {
        let cfg = config.clone();
        async move {
            let filename = request.filename.clone();
            let result = convert(request, &cfg).await;
            BatchItem {
                index,
                filename,
                result,
            }
        }
    }))
    .buffer_unordered(concurrency);

    Box::pin(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::pipeline::engine::{ConversionEngine, EngineInfo, EngineJob};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct ZipStub;

    #[async_trait]
    impl ConversionEngine for ZipStub {
        fn name(&self) -> &str {
            "zip-stub"
        }

        async fn check_available(&self) -> Result<EngineInfo, EngineError> {
            Ok(EngineInfo {
                program: "zip-stub".into(),
                version: "0".into(),
            })
        }

        async fn convert(&self, job: &EngineJob) -> Result<(), EngineError> {
            tokio::fs::write(&job.output, b"PK\x03\x04stub").await.unwrap();
            Ok(())
        }
    }

    #[tokio::test]
    async fn batch_isolates_failures_and_keeps_indices() {
        let dir = TempDir::new().unwrap();
        let config = ConversionConfig::builder()
            .temp_root(dir.path())
            .engine(Arc::new(ZipStub))
            .concurrency(3)
            .build()
            .unwrap();
        let requests = vec![
            ConversionRequest::new("<p>a</p>", "a.html", "text/html"),
            ConversionRequest::new("   ", "blank.html", "text/html"),
            ConversionRequest::new("<p>c</p>", "c.htm", "text/html"),
            ConversionRequest::new("<p>d</p>", "d.pdf", "application/pdf"),
        ];

        let mut items: Vec<BatchItem> = convert_stream(requests, &config).collect().await;
        items.sort_by_key(|i| i.index);

        let ok: Vec<bool> = items.iter().map(|i| i.result.is_ok()).collect();
        assert_eq!(ok, vec![true, false, true, false]);
        assert_eq!(items[1].filename, "blank.html");

        let ids: HashSet<_> = items
            .iter()
            .filter_map(|i| i.result.as_ref().ok())
            .map(|o| o.request_id)
            .collect();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn empty_batch_yields_nothing() {
        let config = ConversionConfig::default();
        let items: Vec<BatchItem> = convert_stream(Vec::new(), &config).collect().await;
        assert!(items.is_empty());
    }
}
