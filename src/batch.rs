//! The batch scheduler (§4.8): per-label sequential workers, cross-label
//! parallelism bounded by a concurrency ceiling, streaming per-item results
//! with full failure isolation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::model::{ExtractionRequest, ExtractionResult, Schema};
use crate::orchestrator::Orchestrator;

pub struct BatchItem {
    pub file_index: usize,
    pub pdf_bytes: Vec<u8>,
    pub label: String,
    pub schema: Schema,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Result { file_index: usize, result: ExtractionResult },
    Complete { stats: BatchStats },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub processing_time_seconds: f64,
    pub by_method: BTreeMap<String, usize>,
    pub labels: Vec<String>,
}

/// Run a heterogeneous batch of requests (§4.8). Returns a receiver that
/// yields one `Result` event per input as it completes and a terminating
/// `Complete` event with aggregate statistics.
pub fn run_batch(
    orchestrator: Arc<Orchestrator>,
    items: Vec<BatchItem>,
    max_workers: usize,
    cancel: CancellationToken,
) -> mpsc::Receiver<BatchEvent> {
    let (tx, rx) = mpsc::channel(items.len().max(1));

    tokio::spawn(async move {
        let start = Instant::now();
        let total = items.len();

        let mut by_label: BTreeMap<String, Vec<BatchItem>> = BTreeMap::new();
        for item in items {
            by_label.entry(item.label.clone()).or_default().push(item);
        }
        let labels: Vec<String> = by_label.keys().cloned().collect();

        let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
        let successful = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let by_method: Arc<std::sync::Mutex<BTreeMap<String, usize>>> =
            Arc::new(std::sync::Mutex::new(BTreeMap::new()));

        let mut workers = Vec::new();
        for (label, group) in by_label {
            let orchestrator = orchestrator.clone();
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let successful = successful.clone();
            let failed = failed.clone();
            let by_method = by_method.clone();

            workers.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                info!("batch worker starting for label {} ({} items)", label, group.len());

                for item in group {
                    if cancel.is_cancelled() {
                        info!("batch worker for label {} stopping: cancelled", label);
                        break;
                    }

                    let schema_for_failure = item.schema.clone();
                    let request = match ExtractionRequest::new(item.pdf_bytes, item.label.clone(), item.schema) {
                        Ok(r) => r,
                        Err(e) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            let result = ExtractionResult::failure(
                                &schema_for_failure,
                                crate::model::Metadata::new(crate::model::Method::Error, 0.0),
                                e.to_string(),
                            );
                            let _ = tx.send(BatchEvent::Result { file_index: item.file_index, result }).await;
                            continue;
                        }
                    };

                    let result = orchestrator.extract(request, cancel.child_token()).await;

                    if result.success {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                    if let Some(method) = result.metadata.method {
                        let mut counts = by_method.lock().unwrap();
                        *counts.entry(method.as_str().to_string()).or_insert(0) += 1;
                    }

                    // A per-item failure never kills the worker (§4.8).
                    let _ = tx
                        .send(BatchEvent::Result {
                            file_index: item.file_index,
                            result,
                        })
                        .await;
                }
            }));
        }

        for worker in workers {
            let _ = worker.await;
        }

        let stats = BatchStats {
            total,
            successful: successful.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
            processing_time_seconds: start.elapsed().as_secs_f64(),
            by_method: by_method.lock().unwrap().clone(),
            labels,
        };
        let _ = tx.send(BatchEvent::Complete { stats }).await;
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::error::ExtractorError;
    use crate::llm::LlmConstraints;
    use crate::parser::{DocumentParser, ParseConstraints, ParsedDocument};
    use crate::template::store::TemplateStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap as StdBTreeMap;

    struct StubParser;
    #[async_trait]
    impl DocumentParser for StubParser {
        fn name(&self) -> &str {
            "stub"
        }
        async fn parse(&self, _: &[u8], _: ParseConstraints) -> Result<ParsedDocument, ExtractorError> {
            Ok(ParsedDocument {
                elements: vec![],
                full_text: "nome joao".to_string(),
                page_count: 1,
            })
        }
    }

    struct StubLlm;
    #[async_trait]
    impl crate::llm::LlmExtractor for StubLlm {
        async fn extract(
            &self,
            _: &str,
            schema: &Schema,
            _: &LlmConstraints,
        ) -> Result<StdBTreeMap<String, Option<String>>, ExtractorError> {
            Ok(schema
                .field_names()
                .into_iter()
                .map(|n| (n, Some("joao".to_string())))
                .collect())
        }
    }

    fn schema() -> Schema {
        Schema::new(vec![("nome".to_string(), "Nome completo".to_string())]).unwrap()
    }

    #[tokio::test]
    async fn batch_emits_one_result_per_item_and_a_complete_event() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let cache = Cache::open(10, dir.path().join("cache").as_path()).unwrap();
        let templates = TemplateStore::open(&db, 16).unwrap();
        let settings = crate::config::Settings::default();
        let orchestrator = Arc::new(Orchestrator::new(
            cache,
            templates,
            Box::new(StubParser),
            Box::new(StubLlm),
            settings,
        ));

        let items = vec![
            BatchItem { file_index: 0, pdf_bytes: b"a".to_vec(), label: "oab".to_string(), schema: schema() },
            BatchItem { file_index: 1, pdf_bytes: b"b".to_vec(), label: "oab".to_string(), schema: schema() },
        ];

        let mut rx = run_batch(orchestrator, items, 2, CancellationToken::new());

        let mut results = 0;
        let mut completed = false;
        while let Some(event) = rx.recv().await {
            match event {
                BatchEvent::Result { .. } => results += 1,
                BatchEvent::Complete { stats } => {
                    completed = true;
                    assert_eq!(stats.total, 2);
                }
            }
        }

        assert_eq!(results, 2);
        assert!(completed);
    }
}
