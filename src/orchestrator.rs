//! The pipeline orchestrator (§4.7): the decision engine tying together the
//! cache, template store, field extractor, and LLM into the 8-step flow,
//! with a per-fingerprint singleflight guarantee so concurrent callers never
//! trigger more than one parse/template/LLM execution for the same
//! (document, label, schema).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{Cache, CacheSource};
use crate::config::Settings;
use crate::error::ExtractorError;
use crate::extract;
use crate::fingerprint::CacheKey;
use crate::llm::{LlmConstraints, LlmExtractor};
use crate::model::{ExtractionRequest, ExtractionResult, Metadata, Method, Schema};
use crate::parser::{DocumentParser, ParseConstraints};
use crate::template::matcher::{best_match, MIN_SAMPLE_COUNT, SIMILARITY_THRESHOLD};
use crate::template::store::TemplateStore;
use crate::template::{learner, Template};

pub struct Orchestrator {
    cache: Cache,
    templates: TemplateStore,
    parser: Box<dyn DocumentParser>,
    llm: Box<dyn LlmExtractor>,
    settings: Settings,
    inflight: StdMutex<HashMap<CacheKey, broadcast::Sender<ExtractionResult>>>,
}

impl Orchestrator {
    pub fn new(
        cache: Cache,
        templates: TemplateStore,
        parser: Box<dyn DocumentParser>,
        llm: Box<dyn LlmExtractor>,
        settings: Settings,
    ) -> Self {
        Self {
            cache,
            templates,
            parser,
            llm,
            settings,
            inflight: StdMutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    /// Run the full decision flow for one request (§4.7), honouring
    /// cancellation via `cancel` at the LLM and parser boundaries.
    pub async fn extract(&self, request: ExtractionRequest, cancel: CancellationToken) -> ExtractionResult {
        let start = Instant::now();
        let key = CacheKey::compute(&request.pdf_bytes, &request.label, &request.schema);

        // Step 1: fingerprint + cache lookup.
        if let Some((mut result, source)) = self.cache.get(&key) {
            result.metadata.method = Some(match source {
                CacheSource::L1 => Method::CacheL1,
                CacheSource::L2 => Method::CacheL2,
            });
            result.metadata.time_seconds = start.elapsed().as_secs_f64();
            return result;
        }

        // Singleflight: at most one step 2-5 execution per fingerprint.
        let receiver_or_leader = {
            let mut inflight = self.inflight.lock().unwrap();
            if let Some(sender) = inflight.get(&key) {
                Some(sender.subscribe())
            } else {
                let (tx, _rx) = broadcast::channel(1);
                inflight.insert(key, tx);
                None
            }
        };

        if let Some(mut receiver) = receiver_or_leader {
            return match receiver.recv().await {
                Ok(mut result) => {
                    result.metadata.coalesced = Some(true);
                    result
                }
                // The guard below always removes its entry and sends a
                // result (real or synthetic) before it disappears, so this
                // is a last-resort fallback rather than the expected path.
                Err(_) => self.run_uncoalesced(request, start, cancel).await,
            };
        }

        // Leader: the guard owns this fingerprint's inflight entry from here
        // on. If `run_pipeline` panics, the guard's `Drop` still removes the
        // entry and broadcasts a synthetic failure so followers waiting on
        // `receiver.recv()` above are released instead of hanging forever.
        let guard = SingleflightGuard::new(self, key, request.schema.clone());
        let result = self.run_pipeline(request, &key, start, cancel).await;
        guard.complete(result)
    }

    /// Fallback used only if a follower ends up with a closed receiver
    /// before ever seeing a value — re-run independently rather than hang
    /// forever.
    async fn run_uncoalesced(&self, request: ExtractionRequest, start: Instant, cancel: CancellationToken) -> ExtractionResult {
        let key = CacheKey::compute(&request.pdf_bytes, &request.label, &request.schema);
        self.run_pipeline(request, &key, start, cancel).await
    }

    async fn run_pipeline(&self, request: ExtractionRequest, key: &CacheKey, start: Instant, cancel: CancellationToken) -> ExtractionResult {
        // Step 2: parse.
        let document = match self
            .parser
            .parse(
                &request.pdf_bytes,
                ParseConstraints {
                    timeout: self.settings.parser_timeout,
                },
            )
            .await
        {
            Ok(doc) => doc,
            Err(e) => {
                return self.error_result(&request, start, Method::Error, e);
            }
        };

        if cancel.is_cancelled() {
            return self.error_result(&request, start, Method::Error, ExtractorError::Internal("cancelled".to_string()));
        }

        // Step 3: template matching.
        let templates = match self.templates.list(&request.label) {
            Ok(t) => t,
            Err(e) => {
                warn!("template store list failed for label {}: {}", request.label, e);
                Vec::new()
            }
        };
        let best = best_match(
            &templates,
            &document,
            &request.schema.field_names(),
            SIMILARITY_THRESHOLD,
            MIN_SAMPLE_COUNT,
        )
        .map(|(t, s)| (t.clone(), s));

        let result = if let Some((template, similarity)) = best {
            self.run_template_or_hybrid(&request, &document, template, similarity, start, &cancel).await
        } else {
            self.run_full_llm(&request, &document, start, &cancel).await
        };

        if result.success {
            self.cache.put(*key, result.clone());
        }
        result
    }

    async fn run_template_or_hybrid(
        &self,
        request: &ExtractionRequest,
        document: &crate::parser::ParsedDocument,
        template: Template,
        similarity: f64,
        start: Instant,
        cancel: &CancellationToken,
    ) -> ExtractionResult {
        let outcome = extract::extract(document, &template, &request.schema);

        let confidence_threshold = self.settings.template_confidence_threshold;
        let template_fields: HashSet<String> = outcome
            .fields_filled
            .iter()
            .filter(|name| template.field_confidence.get(*name).copied().unwrap_or(0.0) >= confidence_threshold)
            .cloned()
            .collect();
        let missing_fields: HashSet<String> = request
            .schema
            .field_names()
            .into_iter()
            .filter(|name| !template_fields.contains(name))
            .collect();

        if missing_fields.is_empty() {
            let mut metadata = Metadata::new(Method::Template, start.elapsed().as_secs_f64());
            metadata.similarity = Some(similarity);
            metadata.template_id = Some(template.template_id.clone());
            metadata.template_fields = Some(template_fields.len());
            return ExtractionResult {
                success: true,
                data: outcome.fields,
                metadata,
                error: None,
            };
        }

        let reduced_schema = request.schema.subset(&missing_fields);
        match self.call_llm(document, &reduced_schema, cancel).await {
            Ok((llm_map, retries)) => {
                let mut data = outcome.fields;
                for (name, value) in llm_map {
                    data.insert(name, value);
                }
                let mut metadata = Metadata::new(Method::Hybrid, start.elapsed().as_secs_f64());
                metadata.similarity = Some(similarity);
                metadata.template_id = Some(template.template_id.clone());
                metadata.template_fields = Some(template_fields.len());
                metadata.llm_fields = Some(missing_fields.len());
                metadata.llm_retries = Some(retries);
                ExtractionResult {
                    success: true,
                    data,
                    metadata,
                    error: None,
                }
            }
            Err(e) => {
                if template_fields.is_empty() {
                    // Full failure on the template side too; fall through to
                    // a full LLM attempt (step 5).
                    self.run_full_llm(request, document, start, cancel).await
                } else {
                    let mut metadata = Metadata::new(Method::Template, start.elapsed().as_secs_f64());
                    metadata.similarity = Some(similarity);
                    metadata.template_id = Some(template.template_id.clone());
                    metadata.template_fields = Some(template_fields.len());
                    metadata.warning = Some(format!("llm fallback failed: {}", e));
                    ExtractionResult {
                        success: true,
                        data: outcome.fields,
                        metadata,
                        error: None,
                    }
                }
            }
        }
    }

    async fn run_full_llm(
        &self,
        request: &ExtractionRequest,
        document: &crate::parser::ParsedDocument,
        start: Instant,
        cancel: &CancellationToken,
    ) -> ExtractionResult {
        match self.call_llm(document, &request.schema, cancel).await {
            Ok((llm_map, retries)) => {
                // Step 6: learn, synchronously, serialised per label. Compare
                // the new sample against every existing sibling for this
                // label (not just the most-trained one) so the closest
                // structural match is the one updated in place.
                let candidates = match self.templates.list(&request.label) {
                    Ok(ts) => ts,
                    Err(e) => {
                        warn!("template store list failed for label {}: {}", request.label, e);
                        Vec::new()
                    }
                };
                let template = learner::select_template(&request.label, &candidates, document, &request.schema.field_names());
                let template = learner::learn(template, document, &llm_map, &request.schema);
                if let Err(e) = self.templates.upsert(&request.label, template).await {
                    warn!("template upsert failed for label {}: {}", request.label, e);
                }

                let mut metadata = Metadata::new(Method::Llm, start.elapsed().as_secs_f64());
                metadata.llm_fields = Some(llm_map.len());
                metadata.llm_retries = Some(retries);
                ExtractionResult {
                    success: true,
                    data: llm_map,
                    metadata,
                    error: None,
                }
            }
            Err(e) => self.error_result(request, start, Method::Error, e),
        }
    }

    /// LLM call with one retry and exponential backoff starting at 1s (§5).
    async fn call_llm(
        &self,
        document: &crate::parser::ParsedDocument,
        schema: &crate::model::Schema,
        cancel: &CancellationToken,
    ) -> Result<(std::collections::BTreeMap<String, Option<String>>, u32), ExtractorError> {
        let constraints = LlmConstraints::default();
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ExtractorError::Internal("cancelled".to_string()));
            }

            let call = self.llm.extract(&document.full_text, schema, &constraints);
            let outcome = tokio::select! {
                res = tokio::time::timeout(self.settings.llm_timeout, call) => res,
                _ = cancel.cancelled() => return Err(ExtractorError::Internal("cancelled".to_string())),
            };

            match outcome {
                Ok(Ok(map)) => return Ok((map, attempt)),
                Ok(Err(e)) if attempt < self.settings.llm_max_retries => {
                    warn!("llm call failed (attempt {}), retrying: {}", attempt, e);
                    tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                    attempt += 1;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) if attempt < self.settings.llm_max_retries => {
                    warn!("llm call timed out (attempt {}), retrying", attempt);
                    tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                    attempt += 1;
                }
                Err(_) => return Err(ExtractorError::Llm("llm call timed out".to_string())),
            }
        }
    }

    fn error_result(&self, request: &ExtractionRequest, start: Instant, last_method: Method, error: ExtractorError) -> ExtractionResult {
        let mut metadata = Metadata::new(Method::Error, start.elapsed().as_secs_f64());
        metadata.last_attempted_method = Some(last_method);
        info!(
            "extraction failed for label {} (kind={}): {}",
            request.label,
            error.method_tag(),
            error
        );
        ExtractionResult::failure(&request.schema, metadata, error.to_string())
    }
}

/// Owns a singleflight leader's entry in `Orchestrator::inflight` for the
/// lifetime of its `run_pipeline` call. `complete` is the normal-completion
/// path: it removes the entry and broadcasts the real result. If the guard
/// is instead dropped without `complete` ever running — the leader's task
/// panicked, or was cancelled/aborted mid-`run_pipeline` — `Drop` performs
/// the same removal and broadcasts a synthetic failure instead, so every
/// follower blocked on `receiver.recv()` is released rather than left
/// waiting forever on a sender that will now never send.
struct SingleflightGuard<'o> {
    orchestrator: &'o Orchestrator,
    key: CacheKey,
    schema: Schema,
    completed: bool,
}

impl<'o> SingleflightGuard<'o> {
    fn new(orchestrator: &'o Orchestrator, key: CacheKey, schema: Schema) -> Self {
        Self {
            orchestrator,
            key,
            schema,
            completed: false,
        }
    }

    fn complete(mut self, result: ExtractionResult) -> ExtractionResult {
        self.completed = true;
        if let Some(sender) = self.orchestrator.inflight.lock().unwrap().remove(&self.key) {
            let _ = sender.send(result.clone());
        }
        result
    }
}

impl<'o> Drop for SingleflightGuard<'o> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(sender) = self.orchestrator.inflight.lock().unwrap().remove(&self.key) {
            let mut metadata = Metadata::new(Method::Error, 0.0);
            metadata.warning = Some("singleflight leader terminated without producing a result".to_string());
            let fallback = ExtractionResult::failure(&self.schema, metadata, "extraction leader task terminated unexpectedly");
            let _ = sender.send(fallback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmConstraints;
    use crate::parser::{ParseConstraints, ParsedDocument};
    use crate::template::matcher::{normalized_prefix, structural_signature, top_token_frequencies};
    use crate::template::{FieldPattern, RegexPattern};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    struct StubParser {
        text: String,
    }

    #[async_trait]
    impl DocumentParser for StubParser {
        fn name(&self) -> &str {
            "stub"
        }
        async fn parse(&self, _: &[u8], _: ParseConstraints) -> Result<ParsedDocument, ExtractorError> {
            Ok(ParsedDocument {
                elements: vec![],
                full_text: self.text.clone(),
                page_count: 1,
            })
        }
    }

    /// Counts invocations and optionally sleeps, to exercise singleflight.
    struct CountingLlm {
        calls: StdArc<AtomicUsize>,
        delay: Duration,
        value: String,
    }

    #[async_trait]
    impl LlmExtractor for CountingLlm {
        async fn extract(
            &self,
            _: &str,
            schema: &crate::model::Schema,
            _: &LlmConstraints,
        ) -> Result<std::collections::BTreeMap<String, Option<String>>, ExtractorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(schema
                .field_names()
                .into_iter()
                .map(|n| (n, Some(self.value.clone())))
                .collect())
        }
    }

    fn schema_one() -> crate::model::Schema {
        crate::model::Schema::new(vec![("nome".to_string(), "Nome completo".to_string())]).unwrap()
    }

    fn build(parser_text: &str, llm: CountingLlm) -> (StdArc<Orchestrator>, StdArc<AtomicUsize>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = crate::cache::Cache::open(10, dir.path().join("cache").as_path()).unwrap();
        let db = sled::open(dir.path().join("templates")).unwrap();
        let templates = TemplateStore::open(&db, 16).unwrap();
        let settings = Settings::default();
        let calls = llm.calls.clone();
        let orchestrator = Orchestrator::new(
            cache,
            templates,
            Box::new(StubParser { text: parser_text.to_string() }),
            Box::new(llm),
            settings,
        );
        (StdArc::new(orchestrator), calls, dir)
    }

    #[tokio::test]
    async fn cold_then_warm_request_hits_cache() {
        let calls = StdArc::new(AtomicUsize::new(0));
        let (orchestrator, _calls, _dir) = build(
            "joao",
            CountingLlm { calls: calls.clone(), delay: Duration::ZERO, value: "João".to_string() },
        );

        let schema = schema_one();
        let req1 = ExtractionRequest::new(b"doc-a".to_vec(), "oab".to_string(), schema.clone()).unwrap();
        let result1 = orchestrator.extract(req1, CancellationToken::new()).await;
        assert!(result1.success);
        assert_eq!(result1.metadata.method, Some(Method::Llm));

        let req2 = ExtractionRequest::new(b"doc-a".to_vec(), "oab".to_string(), schema).unwrap();
        let result2 = orchestrator.extract(req2, CancellationToken::new()).await;
        assert_eq!(result2.metadata.method, Some(Method::CacheL1));
        assert_eq!(result2.data, result1.data);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_call_llm_once() {
        let calls = StdArc::new(AtomicUsize::new(0));
        let (orchestrator, _calls, _dir) = build(
            "joao",
            CountingLlm {
                calls: calls.clone(),
                delay: Duration::from_millis(30),
                value: "João".to_string(),
            },
        );

        let schema = schema_one();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let orchestrator = orchestrator.clone();
            let req = ExtractionRequest::new(b"concurrent-doc".to_vec(), "oab".to_string(), schema.clone()).unwrap();
            handles.push(tokio::spawn(async move { orchestrator.extract(req, CancellationToken::new()).await }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1, "LLM must be invoked at most once per fingerprint");
        let first_data = results[0].data.clone();
        for r in &results {
            assert!(r.success);
            assert_eq!(r.data, first_data);
        }
    }

    #[tokio::test]
    async fn hybrid_path_calls_llm_only_for_missing_fields() {
        let calls = StdArc::new(AtomicUsize::new(0));
        let (orchestrator, _calls, _dir) = build(
            "joao",
            CountingLlm { calls: calls.clone(), delay: Duration::ZERO, value: "preenchido".to_string() },
        );

        let schema = crate::model::Schema::new(vec![
            ("nome".to_string(), "Nome completo".to_string()),
            ("seccional".to_string(), "Seccional da OAB".to_string()),
        ])
        .unwrap();

        let document = ParsedDocument {
            elements: vec![],
            full_text: "joao".to_string(),
            page_count: 1,
        };
        let signature = structural_signature(&document, &schema.field_names());

        let mut template = Template::new("oab", signature);
        template.sample_count = 5;
        template.token_frequencies = top_token_frequencies(&document.full_text);
        template.sample_text_prefix = normalized_prefix(&document.full_text);
        template.field_patterns.insert(
            "nome".to_string(),
            FieldPattern {
                positional: None,
                contextual: None,
                regex: Some(RegexPattern { pattern: r"\w+".to_string() }),
            },
        );
        template.field_confidence.insert("nome".to_string(), 0.9);
        template.field_confidence.insert("seccional".to_string(), 0.5);
        orchestrator.templates().upsert("oab", template).await.unwrap();

        let request = ExtractionRequest::new(b"doc-hybrid".to_vec(), "oab".to_string(), schema).unwrap();
        let result = orchestrator.extract(request, CancellationToken::new()).await;

        assert!(result.success);
        assert_eq!(result.metadata.method, Some(Method::Hybrid));
        assert_eq!(result.metadata.template_fields, Some(1));
        assert_eq!(result.metadata.llm_fields, Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.data.get("seccional").unwrap().as_deref(), Some("preenchido"));
    }
}
