use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bdbot_adapters::{AdapterContext, AdapterError, FetchOutcome, SourceAdapter};
use bdbot_core::{
    CancelHandle, MatchResult, MatchStore, NewSolicitation, RunContext, Score, Solicitation,
    SolicitationStore, StoreError, User, UserSelector,
};
use bdbot_match::{
    ChatMessage, CompletionClient, LlmMatcher, MatchError, MatchVerdict, Matcher, TransportError,
};
use bdbot_storage::{
    HttpClientConfig, HttpFetcher, MemoryMatchStore, MemorySolicitationStore, MemoryUserDirectory,
};
use bdbot_sync::{
    clear_matches, run_ingest, MatchRunner, RunError, ScrapeEngine, SourceStatus,
};

const PERSIST: Duration = Duration::from_secs(30);

// ---------- sources ----------

struct Listing {
    name: &'static str,
    source_id: &'static str,
    title: &'static str,
}

#[async_trait]
impl SourceAdapter for Listing {
    fn name(&self) -> &str {
        self.name
    }

    async fn fetch(&self, _ctx: &AdapterContext<'_>) -> Result<FetchOutcome, AdapterError> {
        Ok(FetchOutcome {
            listings: vec![NewSolicitation::new(self.source_id, self.title)],
            item_errors: Vec::new(),
        })
    }
}

/// One source publishing `count` listings in a single fetch.
struct Bulk {
    count: usize,
}

#[async_trait]
impl SourceAdapter for Bulk {
    fn name(&self) -> &str {
        "bulk"
    }

    async fn fetch(&self, _ctx: &AdapterContext<'_>) -> Result<FetchOutcome, AdapterError> {
        Ok(FetchOutcome {
            listings: (0..self.count)
                .map(|i| NewSolicitation::new(format!("bulk-{i}"), format!("Listing {i}")))
                .collect(),
            item_errors: Vec::new(),
        })
    }
}

struct Broken;

#[async_trait]
impl SourceAdapter for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn fetch(&self, _ctx: &AdapterContext<'_>) -> Result<FetchOutcome, AdapterError> {
        Err(AdapterError::Message("provider returned maintenance page".into()))
    }
}

struct Panicking;

#[async_trait]
impl SourceAdapter for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn fetch(&self, _ctx: &AdapterContext<'_>) -> Result<FetchOutcome, AdapterError> {
        panic!("selector table changed");
    }
}

/// Records whether the run context was already done when its fetch was dropped.
struct SawDeadline {
    ctx: RunContext,
    flag: Arc<AtomicBool>,
}

impl Drop for SawDeadline {
    fn drop(&mut self) {
        self.flag.store(self.ctx.is_done(), Ordering::SeqCst);
    }
}

struct Slow {
    observed: Arc<AtomicBool>,
}

#[async_trait]
impl SourceAdapter for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn fetch(&self, ctx: &AdapterContext<'_>) -> Result<FetchOutcome, AdapterError> {
        let _guard = SawDeadline {
            ctx: ctx.run.clone(),
            flag: Arc::clone(&self.observed),
        };
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(FetchOutcome::default())
    }
}

fn http() -> Arc<HttpFetcher> {
    Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap())
}

fn ctx(secs: u64) -> RunContext {
    RunContext::with_timeout(Duration::from_secs(secs)).0
}

fn ga(title: &'static str) -> Arc<Listing> {
    Arc::new(Listing {
        name: "georgia-gpr",
        source_id: "ga-1",
        title,
    })
}

// ---------- ingest ----------

#[tokio::test]
async fn failing_source_does_not_block_others() {
    let mut engine = ScrapeEngine::new(http());
    engine.register(ga("A")).unwrap();
    engine.register(Arc::new(Broken)).unwrap();
    let store = MemorySolicitationStore::new();

    let summary = run_ingest(&engine, &store, &ctx(30), PERSIST).await;

    assert_eq!(summary.found, 1);
    assert_eq!(summary.saved, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.source_failures.len(), 1);
    assert_eq!(summary.source_failures[0].source, "broken");
    assert!(!summary.is_aborted());

    let rows = store.list().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].source_id, "ga-1");
    assert_eq!(rows[0].title, "A");
}

#[tokio::test]
async fn reingest_updates_in_place() {
    let store = MemorySolicitationStore::new();

    let mut first = ScrapeEngine::new(http());
    first.register(ga("A")).unwrap();
    run_ingest(&first, &store, &ctx(30), PERSIST).await;
    let before = store.find_by_source_id("ga-1").await.unwrap().unwrap();

    let mut second = ScrapeEngine::new(http());
    second.register(ga("A2")).unwrap();
    let summary = run_ingest(&second, &store, &ctx(30), PERSIST).await;
    assert_eq!(summary.saved, 1);

    let rows = store.list().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].title, "A2");
    assert_eq!(rows[0].id, before.id);
    assert_eq!(rows[0].created_at, before.created_at);
    assert!(rows[0].updated_at >= before.updated_at);
}

#[tokio::test]
async fn panicking_source_is_isolated() {
    let mut engine = ScrapeEngine::new(http()).with_concurrency(2);
    engine.register(Arc::new(Panicking)).unwrap();
    engine.register(ga("A")).unwrap();

    let report = engine.run(&ctx(30)).await;

    assert_eq!(report.listings.len(), 1);
    assert!(matches!(
        &report.sources[0].status,
        SourceStatus::Panicked { reason } if reason.contains("selector table changed")
    ));
    assert_eq!(report.sources[1].status, SourceStatus::Completed);
    let err = report.error().unwrap();
    assert_eq!(err.failures[0].source, "panicking");
}

#[tokio::test(start_paused = true)]
async fn deadline_cuts_off_slow_and_unstarted_sources() {
    let observed = Arc::new(AtomicBool::new(false));
    let mut engine = ScrapeEngine::new(http()).with_concurrency(1);
    engine.register(ga("A")).unwrap();
    engine
        .register(Arc::new(Slow {
            observed: Arc::clone(&observed),
        }))
        .unwrap();
    engine
        .register(Arc::new(Listing {
            name: "late",
            source_id: "tx-9",
            title: "Never fetched",
        }))
        .unwrap();

    let run = ctx(5);
    let started = tokio::time::Instant::now();
    let report = engine.run(&run).await;

    assert!(started.elapsed() <= Duration::from_secs(5));
    assert!(observed.load(Ordering::SeqCst), "adapter saw the deadline");

    let ids = report.listings.iter().map(|l| l.source_id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["ga-1"]);
    assert!(matches!(report.sources[1].status, SourceStatus::Interrupted { .. }));
    assert_eq!(report.sources[2].status, SourceStatus::NotStarted);
    assert_eq!(report.error().unwrap().failures.len(), 2);
}

struct DownSolicitations;

#[async_trait]
impl SolicitationStore for DownSolicitations {
    async fn upsert(
        &self,
        _listing: &NewSolicitation,
    ) -> Result<bdbot_core::Solicitation, StoreError> {
        Err(StoreError::Unavailable("pool closed".into()))
    }

    async fn list(&self) -> Result<Vec<bdbot_core::Solicitation>, StoreError> {
        Err(StoreError::Unavailable("pool closed".into()))
    }

    async fn find_by_source_id(
        &self,
        _source_id: &str,
    ) -> Result<Option<bdbot_core::Solicitation>, StoreError> {
        Ok(None)
    }
}

#[tokio::test]
async fn unavailable_store_aborts_ingest() {
    let mut engine = ScrapeEngine::new(http());
    engine.register(ga("A")).unwrap();
    engine
        .register(Arc::new(Listing {
            name: "second",
            source_id: "tx-2",
            title: "B",
        }))
        .unwrap();

    let summary = run_ingest(&engine, &DownSolicitations, &ctx(30), PERSIST).await;
    assert_eq!(summary.found, 2);
    assert_eq!(summary.saved, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 1);
    assert!(summary.is_aborted());
}

/// Cancels the run from inside its first upsert.
struct CancelOnFirstUpsert {
    inner: MemorySolicitationStore,
    handle: Mutex<Option<CancelHandle>>,
    upserts: AtomicUsize,
}

#[async_trait]
impl SolicitationStore for CancelOnFirstUpsert {
    async fn upsert(&self, listing: &NewSolicitation) -> Result<Solicitation, StoreError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.cancel();
        }
        self.inner.upsert(listing).await
    }

    async fn list(&self) -> Result<Vec<Solicitation>, StoreError> {
        self.inner.list().await
    }

    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<Solicitation>, StoreError> {
        self.inner.find_by_source_id(source_id).await
    }
}

#[tokio::test]
async fn cancellation_stops_remaining_upserts() {
    let mut engine = ScrapeEngine::new(http());
    engine.register(Arc::new(Bulk { count: 50 })).unwrap();
    let (run, handle) = RunContext::with_timeout(Duration::from_secs(30));
    let store = CancelOnFirstUpsert {
        inner: MemorySolicitationStore::new(),
        handle: Mutex::new(Some(handle)),
        upserts: AtomicUsize::new(0),
    };

    let summary = run_ingest(&engine, &store, &run, PERSIST).await;

    assert_eq!(store.upserts.load(Ordering::SeqCst), 1);
    assert_eq!(summary.found, 50);
    assert_eq!(summary.saved, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 49);
    assert_eq!(summary.interrupted.as_deref(), Some("run cancelled"));
    assert!(!summary.is_aborted());
    assert_eq!(store.list().await.unwrap().len(), 1);
}

// ---------- matching ----------

/// Answers every prompt with `reply(prompt_text)`.
struct Scripted(fn(&str) -> String);

#[async_trait]
impl CompletionClient for Scripted {
    async fn complete(
        &self,
        _ctx: &RunContext,
        messages: &[ChatMessage],
    ) -> Result<String, TransportError> {
        let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        Ok((self.0)(prompt))
    }
}

fn user(id: i64, email: &str, narrative: &str) -> User {
    User {
        id,
        email: email.to_string(),
        full_name: String::new(),
        narrative: narrative.to_string(),
    }
}

struct Fixture {
    solicitations: Arc<MemorySolicitationStore>,
    matches: Arc<MemoryMatchStore>,
    users: Arc<MemoryUserDirectory>,
}

async fn fixture(titles: &[&str]) -> Fixture {
    let solicitations = Arc::new(MemorySolicitationStore::new());
    for (i, title) in titles.iter().enumerate() {
        solicitations
            .upsert(&NewSolicitation::new(format!("ga-{i}"), *title))
            .await
            .unwrap();
    }
    Fixture {
        solicitations,
        matches: Arc::new(MemoryMatchStore::new()),
        users: Arc::new(MemoryUserDirectory::with_users([
            user(1, "owner@example.com", "cybersecurity research"),
            user(2, "blank@example.com", "  "),
        ])),
    }
}

impl Fixture {
    fn runner(&self, client: Scripted) -> MatchRunner {
        MatchRunner {
            users: self.users.clone(),
            solicitations: self.solicitations.clone(),
            matches: self.matches.clone(),
            matcher: Arc::new(LlmMatcher::new(client, Duration::from_secs(5))),
            concurrency: 2,
        }
    }

    async fn rows(&self, user_id: i64) -> Vec<MatchResult> {
        self.matches.list_by_user(user_id).await.unwrap()
    }
}

#[tokio::test]
async fn stubbed_llm_score_is_stored() {
    let fx = fixture(&["Cyber Resilience RFP"]).await;
    let runner = fx.runner(Scripted(|prompt| {
        assert!(prompt.contains("cybersecurity research"));
        assert!(prompt.contains("Cyber Resilience RFP"));
        r#"{"score": 85, "explanation": "strong technical fit"}"#.to_string()
    }));

    let summary = runner
        .run(&ctx(30), &UserSelector::from_flags(None, None))
        .await
        .unwrap();
    assert_eq!(summary.user_id, 1);
    assert_eq!(summary.matched, 1);

    let rows = fx.rows(1).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].score.value(), 85);
    assert_eq!(rows[0].explanation, "strong technical fit");
}

#[tokio::test]
async fn scores_are_clamped_and_bad_replies_skipped() {
    let fx = fixture(&["Too Good", "Too Bad", "Gibberish"]).await;
    let runner = fx.runner(Scripted(|prompt| {
        if prompt.contains("Too Good") {
            r#"{"score": 150, "explanation": "x"}"#.to_string()
        } else if prompt.contains("Too Bad") {
            r#"```json
{"score": -10, "explanation": "y"}
```"#
                .to_string()
        } else {
            "I would rate this highly.".to_string()
        }
    }));

    let summary = runner
        .run(&ctx(30), &UserSelector::Email("owner@example.com".into()))
        .await
        .unwrap();
    assert_eq!(summary.matched, 2);
    assert_eq!(summary.protocol_failures, 1);
    assert!(!summary.is_aborted());

    let mut scores = fx.rows(1).await.iter().map(|r| r.score).collect::<Vec<_>>();
    scores.sort();
    assert_eq!(scores, vec![Score::MIN, Score::MAX]);
}

#[tokio::test]
async fn empty_narrative_and_unknown_user_are_rejected() {
    let fx = fixture(&["Cyber Resilience RFP"]).await;
    let runner = fx.runner(Scripted(|_| unreachable!("no prompt expected")));

    let err = runner.run(&ctx(30), &UserSelector::Id(2)).await.unwrap_err();
    assert!(matches!(err, RunError::EmptyNarrative { user_id: 2 }));

    let err = runner
        .run(&ctx(30), &UserSelector::Email("nobody@example.com".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::UserNotFound(_)));
    assert!(fx.rows(1).await.is_empty());
}

struct DownMatches;

#[async_trait]
impl MatchStore for DownMatches {
    async fn upsert(&self, _: i64, _: i64, _: Score, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection reset".into()))
    }

    async fn clear_for_user(&self, _: i64) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection reset".into()))
    }

    async fn list_by_user(&self, _: i64) -> Result<Vec<MatchResult>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn unavailable_match_store_aborts_run() {
    let fx = fixture(&["One", "Two", "Three"]).await;
    let mut runner = fx.runner(Scripted(|_| {
        r#"{"score": 50, "explanation": "ok"}"#.to_string()
    }));
    runner.matches = Arc::new(DownMatches);
    runner.concurrency = 1;

    let summary = runner.run(&ctx(30), &UserSelector::Id(1)).await.unwrap();
    assert!(summary.is_aborted());
    assert_eq!(summary.matched, 0);
    assert_eq!(summary.store_failures, 1);
    assert_eq!(summary.skipped, 2);
}

#[tokio::test]
async fn clear_only_touches_selected_user() {
    let fx = fixture(&["One"]).await;
    let sol = fx.solicitations.find_by_source_id("ga-0").await.unwrap().unwrap();
    fx.matches.upsert(1, sol.id, Score::clamped(70.0), "a").await.unwrap();
    fx.matches.upsert(2, sol.id, Score::clamped(30.0), "b").await.unwrap();

    let cleared = clear_matches(
        fx.users.as_ref(),
        fx.matches.as_ref(),
        &UserSelector::Email("owner@example.com".into()),
    )
    .await
    .unwrap();
    assert_eq!(cleared.user_id, 1);
    assert_eq!(cleared.removed, 1);
    assert!(fx.rows(1).await.is_empty());
    assert_eq!(fx.rows(2).await.len(), 1);
}

fn verdict(score: f64) -> MatchVerdict {
    MatchVerdict {
        score: Score::clamped(score),
        explanation: "stub".to_string(),
        reported_score: score,
    }
}

/// Takes a second for titles starting with "Quick", a minute for the rest.
struct Sluggish;

#[async_trait]
impl Matcher for Sluggish {
    async fn evaluate(
        &self,
        _ctx: &RunContext,
        _narrative: &str,
        solicitation: &Solicitation,
    ) -> Result<MatchVerdict, MatchError> {
        let delay = if solicitation.title.starts_with("Quick") { 1 } else { 60 };
        tokio::time::sleep(Duration::from_secs(delay)).await;
        Ok(verdict(60.0))
    }
}

#[tokio::test(start_paused = true)]
async fn deadline_stops_match_run_promptly() {
    // Listed newest first, so "Quick" is evaluated first.
    let fx = fixture(&["Stalled A", "Stalled B", "Stalled C", "Quick"]).await;
    let mut runner = fx.runner(Scripted(|_| unreachable!("matcher is replaced")));
    runner.matcher = Arc::new(Sluggish);

    let started = tokio::time::Instant::now();
    let summary = runner.run(&ctx(5), &UserSelector::Id(1)).await.unwrap();

    assert!(started.elapsed() <= Duration::from_secs(5));
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.failed(), 0);

    // Abandoned evaluations must not write once their sleep would have ended.
    tokio::time::sleep(Duration::from_secs(120)).await;
    let rows = fx.rows(1).await;
    assert_eq!(rows.len(), 1);
    let quick = fx.solicitations.find_by_source_id("ga-3").await.unwrap().unwrap();
    assert_eq!(rows[0].solicitation_id, quick.id);
}

/// Tracks how many evaluations overlap.
#[derive(Default)]
struct Overlap {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Matcher for Overlap {
    async fn evaluate(
        &self,
        _ctx: &RunContext,
        _narrative: &str,
        _solicitation: &Solicitation,
    ) -> Result<MatchVerdict, MatchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(verdict(40.0))
    }
}

#[tokio::test(start_paused = true)]
async fn evaluations_never_exceed_concurrency() {
    let titles = (0..10).map(|i| format!("RFP {i}")).collect::<Vec<_>>();
    let titles = titles.iter().map(String::as_str).collect::<Vec<_>>();
    let fx = fixture(&titles).await;
    let overlap = Arc::new(Overlap::default());
    let mut runner = fx.runner(Scripted(|_| unreachable!("matcher is replaced")));
    runner.matcher = Arc::clone(&overlap) as Arc<dyn Matcher>;
    runner.concurrency = 3;

    let summary = runner.run(&ctx(60), &UserSelector::Id(1)).await.unwrap();

    assert_eq!(summary.matched, 10);
    let peak = overlap.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak in-flight evaluations was {peak}");
    assert!(peak > 1);
    assert_eq!(fx.rows(1).await.len(), 10);
}
