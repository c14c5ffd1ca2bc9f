//! Drives one extraction run: validation, dispatch by mode, the
//! identifier-by-page iteration, aggregation and export.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use engine_logging::{engine_debug, engine_info, engine_warn, RunTag};
use scrape_core::{
    advance, catalog, expand, filter_records, filtering_requested, AnalysisResult, ConfigError,
    DecisionTrace, Expansion, ExtractionRequest, FieldCatalog, Mode, Params, PageSequencer,
    Record, RunEvent, RunPhase, Step, StopReason, TraceEntry, TraceSink,
};
use serde_json::Value;

use crate::decode::{decode_document, is_json_content_type};
use crate::export::{export_records, CsvTableWriter, ExportError, TableWriter};
use crate::extract::{Extractor, SelectorExtractor};
use crate::fetch::{compose_url, Fetcher, GuardedFetcher};
use crate::guard::AddressGuard;
use crate::json_records::find_json_records;
use crate::render::Renderer;
use crate::settings::EngineSettings;
use crate::{FailureKind, FetchError, FetchRequest};

const MAX_LISTED_FIELDS: usize = 10;

pub struct Orchestrator {
    fetcher: Arc<dyn Fetcher>,
    guard: AddressGuard,
    extractor: Arc<dyn Extractor>,
    renderer: Option<Arc<dyn Renderer>>,
    writer: Arc<dyn TableWriter>,
}

impl Orchestrator {
    /// `guard` vets targets before dispatch; it should match the one the
    /// fetcher enforces.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        guard: AddressGuard,
        extractor: Arc<dyn Extractor>,
        writer: Arc<dyn TableWriter>,
    ) -> Self {
        Self {
            fetcher,
            guard,
            extractor,
            renderer: None,
            writer,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Production wiring: guarded reqwest fetcher, scraper extractor, CSV
    /// export into `exports_dir`. No renderer is attached.
    pub fn from_settings(settings: &EngineSettings) -> Self {
        let guard = settings.address_guard();
        let fetcher = GuardedFetcher::new(settings.fetch_settings(), guard.clone());
        Self::new(
            Arc::new(fetcher),
            guard,
            Arc::new(SelectorExtractor),
            Arc::new(CsvTableWriter::new(settings.exports_dir.clone())),
        )
    }

    pub async fn run(&self, request: &ExtractionRequest) -> AnalysisResult {
        let mut run = RunState::new();
        let mode = request.mode;
        engine_info!(
            "{} starting {} run for {}",
            run.tag,
            mode,
            request.address.trim()
        );

        if let Err(err) = request.validate() {
            return run.reject(mode, "validate", err);
        }
        run.note(TraceEntry::ok("validate").detail("mode", mode.as_str()));
        run.advance(RunEvent::Validated);

        // Dispatch
        if mode == Mode::Render && self.renderer.is_none() {
            return run.reject(mode, "dispatch", ConfigError::RendererUnavailable);
        }
        if request.body.is_some() && request.effective_body().is_none() {
            run.note(
                TraceEntry::ok("body_ignored")
                    .detail("reason", "body is only sent for xhr POST requests"),
            );
        }
        let expansions = expand(
            request.address.trim(),
            request.effective_body(),
            &request.params,
            &request.batch,
        );
        run.note(
            TraceEntry::ok("dispatch")
                .detail("mode", mode.as_str())
                .detail("path", acquisition_path(mode))
                .detail("method", request.effective_method().as_str())
                .detail("iterations", expansions.len())
                .detail(
                    "pagination",
                    request.pagination.as_ref().map_or("none", |p| p.kind()),
                ),
        );

        let verdicts = self.preflight(&expansions, &mut run).await;
        if let Some(message) = verdicts.all_blocked() {
            return run.reject(mode, "address_guard", ConfigError::AddressBlocked(message));
        }
        run.advance(RunEvent::Dispatched);

        let mut collected: Vec<Record> = Vec::new();
        for expansion in &expansions {
            if let Some(err) = verdicts.precheck(&expansion.address, mode) {
                run.fail_page(expansion, 0, &expansion.address, err, Duration::ZERO);
                continue;
            }
            let records = self.run_identifier(request, expansion, &mut run).await;
            collected.extend(records);
        }
        run.advance(RunEvent::IterationsFinished);
        run.note(
            TraceEntry::ok("aggregate")
                .detail("records", collected.len())
                .detail("iterations", expansions.len())
                .detail("requests", run.requests),
        );

        let raw_count = collected.len();
        let fields = catalog(&collected, &request.requested_fields);
        let filtering = filtering_requested(&request.requested_fields);
        let records = filter_records(collected, &fields, &request.requested_fields);
        if filtering {
            run.note(
                TraceEntry::ok("field_filter")
                    .detail("requested", request.requested_fields.clone())
                    .detail("matched", fields.selected().len())
                    .detail("unmatched", fields.unmatched.clone())
                    .detail("records_kept", records.len()),
            );
        }

        let started = Instant::now();
        let mut export_failure = None;
        let artifact = match export_records(self.writer.as_ref(), &records) {
            Ok(artifact) => {
                run.note(
                    TraceEntry::ok("export")
                        .elapsed(started.elapsed())
                        .detail("artifact", artifact.url.clone())
                        .detail("records", records.len()),
                );
                Some(artifact.url)
            }
            Err(ExportError::Empty) => {
                run.note(TraceEntry::ok("export").detail("skipped", "empty"));
                None
            }
            Err(err) => {
                run.note(
                    TraceEntry::failed("export")
                        .elapsed(started.elapsed())
                        .detail("error", err.to_string()),
                );
                export_failure = Some(err);
                None
            }
        };
        run.advance(RunEvent::Exported);

        let message = summary_message(
            request,
            raw_count,
            &records,
            &fields,
            filtering,
            export_failure.as_ref(),
            run.trace.failures(),
        );
        engine_info!(
            "{} finished: {} records, {} failed steps",
            run.tag,
            records.len(),
            run.trace.failures()
        );

        AnalysisResult {
            mode_used: mode,
            success: true,
            has_data: artifact.is_some(),
            message,
            artifact,
            record_count: records.len(),
            phase: run.phase,
            decision_trace: run.trace.into_entries(),
            fields,
            records,
        }
    }

    /// Vets each distinct expanded address once.
    async fn preflight(&self, expansions: &[Expansion], run: &mut RunState) -> Verdicts {
        let mut verdicts = Verdicts::default();
        if !self.guard.is_enabled() {
            run.note(TraceEntry::ok("address_guard").detail("enabled", false));
            return verdicts;
        }

        let started = Instant::now();
        for expansion in expansions {
            if verdicts.results.contains_key(&expansion.address) {
                continue;
            }
            let result = self.guard.vet(&expansion.address).await.map(|_| ());
            verdicts.results.insert(expansion.address.clone(), result);
        }
        run.note(
            TraceEntry::ok("address_guard")
                .elapsed(started.elapsed())
                .detail("enabled", true)
                .detail("checked", verdicts.results.len())
                .detail("blocked", verdicts.blocked_count()),
        );
        verdicts
    }

    /// Runs the full page sequence for one identifier.
    async fn run_identifier(
        &self,
        request: &ExtractionRequest,
        expansion: &Expansion,
        run: &mut RunState,
    ) -> Vec<Record> {
        let mut sequencer = PageSequencer::new(request.pagination.as_ref());
        let mut prior: Option<Vec<u8>> = None;
        let mut records = Vec::new();

        loop {
            let mutation = match sequencer.next(prior.as_deref()) {
                Step::Request(mutation) => mutation,
                Step::Done(reason) => {
                    run.note_stop(expansion, &reason, sequencer.emitted());
                    break;
                }
            };
            let mut params = expansion.params.clone();
            mutation.apply(&mut params);

            run.pace(request.delay_ms).await;
            let started = Instant::now();
            match self.acquire(request, expansion, params, run).await {
                Ok(page) => {
                    let empty = page.records.is_empty();
                    let mut entry = TraceEntry::ok("page")
                        .elapsed(started.elapsed())
                        .detail("page", mutation.page_index)
                        .detail("address", page.address)
                        .detail("source", page.source)
                        .detail("records", page.records.len());
                    if let Some(identifier) = &expansion.identifier {
                        entry = entry.detail("identifier", identifier.as_str());
                    }
                    run.note(entry);
                    records.extend(page.records);
                    prior = Some(page.body);

                    if empty && request.stop_on_empty_page {
                        run.note_stop(expansion, &StopReason::EmptyPage, sequencer.emitted());
                        break;
                    }
                }
                Err((address, err)) => {
                    run.fail_page(expansion, mutation.page_index, &address, &err, started.elapsed());
                    prior = None;
                }
            }
        }
        records
    }

    /// One page through the mode's acquisition path.
    async fn acquire(
        &self,
        request: &ExtractionRequest,
        expansion: &Expansion,
        params: Params,
        run: &mut RunState,
    ) -> Result<Page, (String, FetchError)> {
        if request.mode == Mode::Render {
            return self.acquire_rendered(request, expansion, &params).await;
        }

        let fetch_request = FetchRequest {
            address: expansion.address.clone(),
            method: request.effective_method(),
            headers: request.headers.clone(),
            params,
            body: expansion.body.clone(),
            cookies: request.cookies.clone(),
            max_retries: request.effective_max_retries(),
        };
        let display = compose_url(&fetch_request.address, &fetch_request.params)
            .map_or_else(|_| fetch_request.address.clone(), |url| url.to_string());

        let outcome = self
            .fetcher
            .fetch(&fetch_request, &mut run.trace)
            .await
            .map_err(|err| (display, err))?;
        if outcome.truncated {
            let err = FetchError::new(
                FailureKind::SizeExceeded {
                    max_bytes: outcome.bytes.len() as u64,
                    actual: None,
                },
                "response truncated at the byte cap",
            );
            return Err((outcome.url, err));
        }

        let content_type = outcome.content_type().map(str::to_string);
        let decoded = decode_document(&outcome.bytes, content_type.as_deref());
        if decoded.had_errors {
            engine_debug!(
                "{} {} decoded with replacement characters ({})",
                run.tag,
                outcome.url,
                decoded.encoding_label
            );
        }

        let (records, source) = match request.mode {
            Mode::Xhr => self
                .api_records(&decoded.text, content_type.as_deref())
                .map_err(|err| (outcome.url.clone(), err))?,
            _ => {
                let selector = request.selector();
                let records = self
                    .extractor
                    .extract(&decoded.text, selector)
                    .map_err(|err| (outcome.url.clone(), parse_failure(err.to_string())))?;
                (records, structural_source(selector))
            }
        };

        Ok(Page {
            records,
            body: outcome.bytes,
            address: outcome.url,
            source,
        })
    }

    async fn acquire_rendered(
        &self,
        request: &ExtractionRequest,
        expansion: &Expansion,
        params: &Params,
    ) -> Result<Page, (String, FetchError)> {
        let address = compose_url(&expansion.address, params)
            .map_err(|err| (expansion.address.clone(), err))?
            .to_string();
        let renderer = self.renderer.as_ref().ok_or_else(|| {
            (
                address.clone(),
                FetchError::new(FailureKind::InvalidRequest, "no renderer attached"),
            )
        })?;

        let bytes = renderer
            .render(&address, &request.render, &request.cookies)
            .await
            .map_err(|err| (address.clone(), FetchError::new(FailureKind::Network, err.to_string())))?;
        let decoded = decode_document(&bytes, None);
        let selector = request.selector();
        let records = self
            .extractor
            .extract(&decoded.text, selector)
            .map_err(|err| (address.clone(), parse_failure(err.to_string())))?;

        Ok(Page {
            records,
            body: bytes,
            address,
            source: structural_source(selector),
        })
    }

    /// JSON bodies go through record discovery; anything else is treated as
    /// a document unless it claimed to be JSON.
    fn api_records(
        &self,
        text: &str,
        content_type: Option<&str>,
    ) -> Result<(Vec<Record>, String), FetchError> {
        match serde_json::from_str::<Value>(text) {
            Ok(payload) => Ok(match find_json_records(&payload) {
                Some(found) => (found.records, format!("json:{}", found.path)),
                None => (Vec::new(), "json:none".to_string()),
            }),
            Err(err) if is_json_content_type(content_type) => {
                Err(parse_failure(format!("invalid JSON body: {err}")))
            }
            Err(_) => {
                let records = self
                    .extractor
                    .extract(text, None)
                    .map_err(|err| parse_failure(err.to_string()))?;
                Ok((records, "html:table".to_string()))
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("guard", &self.guard)
            .field("renderer", &self.renderer.is_some())
            .finish_non_exhaustive()
    }
}

struct Page {
    records: Vec<Record>,
    body: Vec<u8>,
    address: String,
    source: String,
}

/// Per-run mutable state. Never shared between runs.
struct RunState {
    tag: RunTag,
    phase: RunPhase,
    trace: DecisionTrace,
    /// Network operations issued so far, for pacing.
    requests: u32,
}

impl RunState {
    fn new() -> Self {
        Self {
            tag: RunTag::next(),
            phase: RunPhase::Init,
            trace: DecisionTrace::new(),
            requests: 0,
        }
    }

    fn advance(&mut self, event: RunEvent) {
        let next = advance(self.phase, event);
        if next != self.phase {
            engine_debug!("{} phase {:?} -> {:?}", self.tag, self.phase, next);
        }
        self.phase = next;
    }

    fn note(&mut self, entry: TraceEntry) {
        if entry.ok {
            engine_debug!("{} {} {:?}", self.tag, entry.step, entry.detail);
        } else {
            engine_warn!("{} {} failed {:?}", self.tag, entry.step, entry.detail);
        }
        self.trace.record(entry);
    }

    fn reject(mut self, mode: Mode, step: &str, err: ConfigError) -> AnalysisResult {
        self.note(TraceEntry::failed(step).detail("error", err.to_string()));
        self.advance(RunEvent::Rejected);
        AnalysisResult::failed(mode, err.to_string(), self.trace.into_entries())
    }

    /// Sleeps before every network operation except the run's first.
    async fn pace(&mut self, delay_ms: u64) {
        if self.requests > 0 && delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        self.requests += 1;
    }

    fn fail_page(
        &mut self,
        expansion: &Expansion,
        page_index: u32,
        address: &str,
        err: &FetchError,
        elapsed: Duration,
    ) {
        let mut entry = TraceEntry::failed("page")
            .elapsed(elapsed)
            .detail("page", page_index)
            .detail("address", address)
            .detail("error", err.kind.label())
            .detail("message", err.message.clone());
        if let Some(identifier) = &expansion.identifier {
            entry = entry.detail("identifier", identifier.as_str());
        }
        self.note(entry);
    }

    fn note_stop(&mut self, expansion: &Expansion, reason: &StopReason, pages: u32) {
        let mut entry = TraceEntry::new("pagination_stop", !reason.is_failure())
            .detail("reason", reason.as_str())
            .detail("pages", pages);
        if let StopReason::CursorUnreadable(err) = reason {
            entry = entry.detail("message", err.to_string());
        }
        if let Some(identifier) = &expansion.identifier {
            entry = entry.detail("identifier", identifier.as_str());
        }
        self.note(entry);
    }
}

/// Guard results per distinct expanded address.
#[derive(Default)]
struct Verdicts {
    results: HashMap<String, Result<(), FetchError>>,
}

impl Verdicts {
    fn blocked_count(&self) -> usize {
        self.results
            .values()
            .filter(|r| matches!(r, Err(e) if is_blocked(e)))
            .count()
    }

    /// Message of the first refusal when every checked address was blocked.
    fn all_blocked(&self) -> Option<String> {
        if self.results.is_empty() || self.blocked_count() != self.results.len() {
            return None;
        }
        self.results
            .values()
            .find_map(|r| r.as_ref().err())
            .map(|e| e.message.clone())
    }

    /// Error that settles an iteration without any request. Rendered pages
    /// bypass the fetcher, so any guard failure counts there.
    fn precheck(&self, address: &str, mode: Mode) -> Option<&FetchError> {
        let err = self.results.get(address)?.as_ref().err()?;
        let settled = is_blocked(err) || err.kind == FailureKind::InvalidUrl;
        (settled || mode == Mode::Render).then_some(err)
    }
}

fn is_blocked(err: &FetchError) -> bool {
    matches!(err.kind, FailureKind::BlockedAddress { .. })
}

fn parse_failure(message: String) -> FetchError {
    FetchError::new(FailureKind::Parse, message)
}

fn acquisition_path(mode: Mode) -> &'static str {
    match mode {
        Mode::Document => "fetch+extract",
        Mode::Xhr => "fetch+json",
        Mode::Render => "render+extract",
    }
}

fn structural_source(selector: Option<&str>) -> String {
    match selector {
        Some(_) => "html:selector".to_string(),
        None => "html:table".to_string(),
    }
}

fn summary_message(
    request: &ExtractionRequest,
    raw_count: usize,
    records: &[Record],
    fields: &FieldCatalog,
    filtering: bool,
    export_failure: Option<&ExportError>,
    failed_steps: usize,
) -> String {
    let mut message = if raw_count == 0 {
        empty_hint(request)
    } else if records.is_empty() {
        let listed: Vec<&str> = fields
            .available
            .iter()
            .take(MAX_LISTED_FIELDS)
            .map(String::as_str)
            .collect();
        format!(
            "No records matched the requested fields. Available fields: {}",
            listed.join(", ")
        )
    } else {
        let source = match request.mode {
            Mode::Document => "document(s)",
            Mode::Xhr => "API response(s)",
            Mode::Render => "rendered page(s)",
        };
        let mut text = format!("Extracted {} records from {source}.", records.len());
        if filtering {
            text.push_str(&format!(" Filtered to {} fields.", fields.selected().len()));
        }
        text
    };

    if raw_count == 0 && failed_steps > 0 {
        message.push_str(&format!(
            " {failed_steps} step(s) failed; see the decision trace."
        ));
    }
    if let Some(err) = export_failure {
        message.push_str(&format!(" Export failed: {err}."));
    }
    message
}

fn empty_hint(request: &ExtractionRequest) -> String {
    match (request.mode, request.selector()) {
        (Mode::Document, Some(selector)) => {
            format!("No records found. Selector '{selector}' might be incorrect.")
        }
        (Mode::Document, None) => "No records found. Auto-detection found no table.".to_string(),
        (Mode::Xhr, _) => "API response did not contain extractable records.".to_string(),
        (Mode::Render, selector) => format!(
            "The page rendered, but no elements matching '{}' produced records.",
            selector.unwrap_or_default()
        ),
    }
}
