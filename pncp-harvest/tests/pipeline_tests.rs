//! End-to-end pipeline tests against a scripted transport and an
//! in-memory store.
//!
//! The scripted transport replays canned responses keyed by request, so
//! every stage runs its real code path (client, breaker, cache, gate)
//! without a network. Request logging makes call-count properties (early
//! termination, fail-fast, cached reruns) directly observable.

use chrono::NaiveDate;
use pncp_common::config::{HarvestConfig, QueryWindow};
use pncp_common::db::create_schema;
use pncp_common::db::tenders::tender_count;
use pncp_common::models::VerdictSource;
use pncp_harvest::cache::TieredCache;
use pncp_harvest::client::{
    ApiRequest, BackoffPolicy, RateGovernedClient, RawResponse, Transport, TransportError,
};
use pncp_harvest::events::EventBus;
use pncp_harvest::pipeline::discovery;
use pncp_harvest::pipeline::metrics::{MetricsHub, Stage};
use pncp_harvest::rules::RuleTable;
use pncp_harvest::types::{AbortReason, ShortfallKind};
use pncp_harvest::HarvestPipeline;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------

enum Script {
    Body(String),
    Status(u16),
}

#[derive(Clone, Default)]
struct ScriptedApi {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    scripts: Mutex<HashMap<String, Script>>,
    log: Mutex<Vec<String>>,
}

/// List-page requests are keyed by modality and page; everything else by
/// its exact path.
fn key_of(req: &ApiRequest) -> String {
    if req.path == "/v1/tenders/published" {
        let get = |name: &str| {
            req.query
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };
        format!("list m{} p{}", get("modality"), get("page"))
    } else {
        req.path.clone()
    }
}

impl ScriptedApi {
    fn on_page(&self, modality: u16, page: u32, body: String) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .insert(format!("list m{modality} p{page}"), Script::Body(body));
    }

    fn on_page_status(&self, modality: u16, page: u32, status: u16) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .insert(format!("list m{modality} p{page}"), Script::Status(status));
    }

    fn on_path(&self, path: &str, body: String) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .insert(path.to_string(), Script::Body(body));
    }

    /// Number of requests issued for one key (retries count separately)
    fn count(&self, key: &str) -> usize {
        self.inner
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|k| k.as_str() == key)
            .count()
    }
}

impl Transport for ScriptedApi {
    fn send(
        &self,
        req: ApiRequest,
    ) -> impl std::future::Future<Output = Result<RawResponse, TransportError>> + Send {
        let key = key_of(&req);
        self.inner.log.lock().unwrap().push(key.clone());
        let response = {
            let scripts = self.inner.scripts.lock().unwrap();
            match scripts.get(&key) {
                Some(Script::Body(body)) => RawResponse {
                    status: 200,
                    body: body.clone(),
                },
                Some(Script::Status(status)) => RawResponse {
                    status: *status,
                    body: "{}".to_string(),
                },
                // Unscripted requests behave like a missing resource
                None => RawResponse {
                    status: 404,
                    body: "{}".to_string(),
                },
            }
        };
        async move { Ok(response) }
    }
}

// ---------------------------------------------------------------------
// Fixture builders
// ---------------------------------------------------------------------

fn tender_json(
    cnpj: &str,
    seq: u32,
    org_name: &str,
    description: &str,
    value: f64,
) -> serde_json::Value {
    serde_json::json!({
        "controlNumber": format!("{cnpj}-1-{seq:06}/2024"),
        "orgId": cnpj,
        "orgName": org_name,
        "year": 2024,
        "sequential": seq,
        "modality": 6,
        "publishedDate": "2024-05-10",
        "description": description,
        "totalValue": value,
    })
}

fn control_number(cnpj: &str, seq: u32) -> String {
    format!("{cnpj}-1-{seq:06}/2024")
}

fn items_base(cnpj: &str, seq: u32) -> String {
    format!("/v1/orgs/{cnpj}/tenders/2024/{seq}/items")
}

fn page_body(tenders: &[serde_json::Value], current: u32, total: u32) -> String {
    serde_json::json!({
        "data": tenders,
        "totalRecords": tenders.len(),
        "totalPages": total,
        "currentPage": current,
        "remainingPages": total.saturating_sub(current),
        "empty": tenders.is_empty(),
    })
    .to_string()
}

fn item_body(item_number: u32, description: &str) -> String {
    serde_json::json!({
        "itemNumber": item_number,
        "description": description,
    })
    .to_string()
}

fn listing_body(items: &[(&str, Option<f64>)]) -> String {
    let data: Vec<serde_json::Value> = items
        .iter()
        .enumerate()
        .map(|(i, (description, unit_price))| {
            serde_json::json!({
                "itemNumber": i as u32 + 1,
                "description": description,
                "unitPrice": unit_price,
            })
        })
        .collect();
    serde_json::json!({ "data": data }).to_string()
}

fn test_config() -> HarvestConfig {
    let mut config = HarvestConfig::default();
    config.window = QueryWindow {
        start: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        end: NaiveDate::from_ymd_opt(2024, 5, 7).unwrap(),
    };
    config.modalities = vec![6];
    config.min_value = 0.0;
    config.retry_attempts = 2;
    config.breaker_failure_threshold = 50;
    // Quotas high enough that tests never wait on the limiter
    config.requests_per_minute = 60_000;
    config.requests_per_hour = 1_000_000;
    config
}

fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(1),
        cap: Duration::from_millis(2),
    }
}

async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    create_schema(&pool).await.unwrap();
    pool
}

fn pipeline(
    api: ScriptedApi,
    config: HarvestConfig,
    pool: SqlitePool,
    cache: Arc<TieredCache>,
) -> HarvestPipeline<ScriptedApi> {
    let events = EventBus::new(64);
    HarvestPipeline::new(api, config, pool, cache, RuleTable::builtin(), events.sender())
        .with_client_backoff(fast_policy())
}

// ---------------------------------------------------------------------
// Stage 1: partial-failure preservation
// ---------------------------------------------------------------------

#[tokio::test]
async fn discovery_keeps_earlier_pages_when_one_fails() {
    let api = ScriptedApi::default();
    api.on_page(
        6,
        1,
        page_body(
            &[
                tender_json("11222333000144", 1, "HOSPITAL REGIONAL", "Material hospitalar", 40_000.0),
                tender_json("11222333000144", 2, "HOSPITAL REGIONAL", "Medicamentos", 75_000.0),
            ],
            1,
            3,
        ),
    );
    api.on_page_status(6, 2, 500);
    api.on_page(
        6,
        3,
        page_body(
            &[tender_json("11222333000144", 3, "HOSPITAL REGIONAL", "Curativos", 10_000.0)],
            3,
            3,
        ),
    );

    let config = test_config();
    let hub = Arc::new(MetricsHub::new());
    hub.set_stage(Stage::Discovery);
    let client = RateGovernedClient::new(api.clone(), &config, hub).with_backoff(fast_policy());

    let output = discovery::run(&client, &config).await;

    // Pages before the failure survive; the failed page is named
    assert_eq!(output.tenders.len(), 2);
    assert!(!output.access_denied);
    assert_eq!(output.shortfalls.len(), 1);
    assert_eq!(output.shortfalls[0].modality, 6);
    assert_eq!(output.shortfalls[0].page, 2);
    assert_eq!(output.shortfalls[0].kind, ShortfallKind::RetriesExhausted);

    // The page after the failure was never requested for this modality
    assert_eq!(api.count("list m6 p3"), 0);
    // Two retry attempts went to the failing page
    assert_eq!(api.count("list m6 p2"), 2);
}

// ---------------------------------------------------------------------
// Dedup idempotence
// ---------------------------------------------------------------------

#[tokio::test]
async fn second_run_over_unchanged_store_survives_zero_candidates() {
    let pool = memory_pool().await;

    // Seeded-org issuer, so the candidate confirms without sampling
    let world = || {
        let api = ScriptedApi::default();
        api.on_page(
            6,
            1,
            page_body(
                &[tender_json(
                    "26989715000123",
                    42,
                    "Ministerio da Saude",
                    "Aquisicao de insumos hospitalares",
                    200_000.0,
                )],
                1,
                1,
            ),
        );
        api.on_path(
            &items_base("26989715000123", 42),
            listing_body(&[("Curativo esteril", Some(9.9))]),
        );
        api
    };

    let cache = Arc::new(TieredCache::new(30));
    cache.seed_known_organizations();
    let first = pipeline(world(), test_config(), pool.clone(), cache)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.confirmed.len(), 1);
    assert_eq!(tender_count(&pool).await.unwrap(), 1);

    // Fresh cache isolates the gate: any filtering now is the store's doing
    let cache = Arc::new(TieredCache::new(30));
    cache.seed_known_organizations();
    let second = pipeline(world(), test_config(), pool.clone(), cache)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert!(second.confirmed.is_empty());
    assert_eq!(second.metrics.stage(Stage::Heuristic).unwrap().input, 0);
    assert_eq!(tender_count(&pool).await.unwrap(), 1);
}

// ---------------------------------------------------------------------
// Stage 3: early termination and keyword fallback
// ---------------------------------------------------------------------

#[tokio::test]
async fn code_hit_on_first_item_stops_further_fetches() {
    let pool = memory_pool().await;
    let api = ScriptedApi::default();
    // Score lands between admission (30) and auto-approval (70), with a
    // single strong keyword, so the candidate must be sampled
    api.on_page(
        6,
        1,
        page_body(
            &[tender_json(
                "11222333000144",
                10,
                "PREFEITURA MUNICIPAL DE LAGES",
                "Aquisição de material penso e equipo para unidades",
                50_000.0,
            )],
            1,
            1,
        ),
    );
    let base = items_base("11222333000144", 10);
    api.on_path(
        &format!("{base}/1"),
        item_body(1, "Curativo hidrocoloide esteril CATMAT 651510"),
    );
    api.on_path(&format!("{base}/2"), item_body(2, "Gaze hidrofila"));
    api.on_path(&format!("{base}/3"), item_body(3, "Atadura de crepom"));
    api.on_path(
        &base,
        listing_body(&[("Curativo hidrocoloide esteril CATMAT 651510", Some(3.2))]),
    );

    let cache = Arc::new(TieredCache::new(30));
    let outcome = pipeline(api.clone(), test_config(), pool, cache)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.confirmed.len(), 1);
    assert_eq!(outcome.confirmed[0].source, VerdictSource::ExplicitCode);
    assert_eq!(outcome.confirmed[0].confidence, 95);

    // The first sub-record carried a target-range code; no second fetch
    assert_eq!(api.count(&format!("{base}/1")), 1);
    assert_eq!(api.count(&format!("{base}/2")), 0);
    assert_eq!(api.count(&format!("{base}/3")), 0);
}

#[tokio::test]
async fn missing_subrecords_fall_back_to_keyword_score() {
    let pool = memory_pool().await;
    let api = ScriptedApi::default();
    api.on_page(
        6,
        1,
        page_body(
            &[
                // Score 65: confirmed on keyword score alone when sampling
                // finds no sub-records at all
                tender_json(
                    "55666777000188",
                    20,
                    "PREFEITURA MUNICIPAL DE ITU",
                    "Aquisição de material médico para rede municipal",
                    150_000.0,
                ),
                // Score 40: sampled items carry no signal, falls below the
                // confirmation threshold and is discarded
                tender_json(
                    "99888777000166",
                    30,
                    "PREFEITURA MUNICIPAL DE BAGE",
                    "Aquisição de material penso",
                    120_000.0,
                ),
            ],
            1,
            1,
        ),
    );
    // First candidate: no item scripts registered, so item 1 returns 404
    api.on_path(&items_base("55666777000188", 20), listing_body(&[]));
    // Second candidate: three bland items
    let base = items_base("99888777000166", 30);
    api.on_path(&format!("{base}/1"), item_body(1, "Cadeira giratoria"));
    api.on_path(&format!("{base}/2"), item_body(2, "Mesa de escritorio"));
    api.on_path(&format!("{base}/3"), item_body(3, "Armario de aco"));

    let cache = Arc::new(TieredCache::new(30));
    let outcome = pipeline(api.clone(), test_config(), pool, cache)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.confirmed.len(), 1);
    let confirmed = &outcome.confirmed[0];
    assert_eq!(confirmed.tender.control_number, control_number("55666777000188", 20));
    assert_eq!(confirmed.source, VerdictSource::Keyword);
    assert_eq!(confirmed.confidence, 65);
    assert!(confirmed.items.is_empty());

    // The discarded candidate exhausted its full sample budget
    assert_eq!(api.count(&format!("{base}/1")), 1);
    assert_eq!(api.count(&format!("{base}/2")), 1);
    assert_eq!(api.count(&format!("{base}/3")), 1);
    assert!(outcome.failed.is_empty());
}

#[tokio::test]
async fn org_history_approves_remaining_candidates_and_promotes_org() {
    let pool = memory_pool().await;
    let api = ScriptedApi::default();
    let cnpj = "12345678000199";
    api.on_page(
        6,
        1,
        page_body(
            &[
                tender_json(cnpj, 1, "PREFEITURA MUNICIPAL", "Aquisição de material penso e equipo", 50_000.0),
                tender_json(cnpj, 2, "PREFEITURA MUNICIPAL", "Aquisição de material penso e equipo", 50_000.0),
                tender_json(cnpj, 3, "PREFEITURA MUNICIPAL", "Aquisição de material penso", 120_000.0),
            ],
            1,
            1,
        ),
    );
    for seq in [1u32, 2] {
        let base = items_base(cnpj, seq);
        api.on_path(&format!("{base}/1"), item_body(1, "Curativo esteril CATMAT 651510"));
        api.on_path(&base, listing_body(&[]));
    }
    // The third candidate samples clean and would be discarded on its own
    let base = items_base(cnpj, 3);
    api.on_path(&format!("{base}/1"), item_body(1, "Cadeira giratoria"));
    api.on_path(&format!("{base}/2"), item_body(2, "Mesa de escritorio"));
    api.on_path(&format!("{base}/3"), item_body(3, "Armario de aco"));
    api.on_path(&base, listing_body(&[]));

    let cache = Arc::new(TieredCache::new(30));
    let outcome = pipeline(api, test_config(), pool, Arc::clone(&cache))
        .run(CancellationToken::new())
        .await
        .unwrap();

    // Two explicit-code confirmations corroborate the organization; the
    // sampled-out third candidate rides the org's history
    assert_eq!(outcome.confirmed.len(), 3);
    let third = outcome
        .confirmed
        .iter()
        .find(|t| t.tender.control_number == control_number(cnpj, 3))
        .unwrap();
    assert_eq!(third.source, VerdictSource::OrgHistory);
    assert_eq!(third.confidence, 75);

    // And the organization was promoted into the cache tier
    let entry = cache.organization_verdict(cnpj).unwrap();
    assert_eq!(entry.confidence, 80);
}

// ---------------------------------------------------------------------
// Failure containment at the run level
// ---------------------------------------------------------------------

#[tokio::test]
async fn open_breaker_aborts_at_the_next_barrier() {
    let pool = memory_pool().await;
    let api = ScriptedApi::default();
    api.on_page(
        6,
        1,
        page_body(
            &[tender_json("11222333000144", 1, "HOSPITAL REGIONAL", "Material hospitalar", 40_000.0)],
            1,
            3,
        ),
    );
    api.on_page_status(6, 2, 500);

    let mut config = test_config();
    // Two failed attempts on page 2 open the breaker mid-discovery
    config.breaker_failure_threshold = 2;

    let cache = Arc::new(TieredCache::new(30));
    let outcome = pipeline(api, config, pool, cache)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.aborted, Some(AbortReason::BreakerExhausted));
    assert!(outcome.confirmed.is_empty());
    // The partial discovery result is still reported
    assert_eq!(outcome.shortfalls.len(), 1);
    assert_eq!(outcome.shortfalls[0].page, 2);
}

#[tokio::test]
async fn access_denial_halts_the_run() {
    let pool = memory_pool().await;
    let api = ScriptedApi::default();
    api.on_page_status(6, 1, 403);

    let cache = Arc::new(TieredCache::new(30));
    let outcome = pipeline(api.clone(), test_config(), pool, cache)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.aborted, Some(AbortReason::AccessDenied));
    assert!(outcome.confirmed.is_empty());
    // No retry on 403: one request, then a hard stop
    assert_eq!(api.count("list m6 p1"), 1);
}

#[tokio::test]
async fn cancellation_is_honored_at_stage_barriers() {
    let pool = memory_pool().await;
    let api = ScriptedApi::default();
    api.on_page(
        6,
        1,
        page_body(
            &[tender_json("11222333000144", 1, "HOSPITAL REGIONAL", "Material hospitalar", 40_000.0)],
            1,
            1,
        ),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();

    let cache = Arc::new(TieredCache::new(30));
    let outcome = pipeline(api, test_config(), pool, cache)
        .run(cancel)
        .await
        .unwrap();

    // Discovery completed (the stage drains), later stages never started
    assert_eq!(outcome.aborted, Some(AbortReason::Cancelled));
    assert_eq!(outcome.metrics.stages.len(), 1);
    assert_eq!(outcome.metrics.stages[0].stage, Stage::Discovery);
}

// ---------------------------------------------------------------------
// End to end: all stages, then a fully cached rerun
// ---------------------------------------------------------------------

#[tokio::test]
async fn full_run_then_cached_rerun_needs_no_sampling() {
    let pool = memory_pool().await;

    let world = || {
        let api = ScriptedApi::default();
        api.on_page(
            6,
            1,
            page_body(
                &[
                    // Seeded-org short-circuit, no sampling
                    tender_json(
                        "26989715000123",
                        42,
                        "Ministerio da Saude",
                        "Aquisicao de insumos para atencao basica",
                        200_000.0,
                    ),
                    // Confirmed by a classification code on the first item
                    tender_json(
                        "11222333000144",
                        10,
                        "PREFEITURA MUNICIPAL DE LAGES",
                        "Aquisição de material penso e equipo para unidades",
                        50_000.0,
                    ),
                    // Confirmed on keyword score after a no-sub-records response
                    tender_json(
                        "55666777000188",
                        20,
                        "PREFEITURA MUNICIPAL DE ITU",
                        "Aquisição de material médico para rede municipal",
                        150_000.0,
                    ),
                    // Rejected by the quick filter (disqualifying text)
                    tender_json(
                        "44555666000177",
                        40,
                        "PREFEITURA MUNICIPAL DE CRUZ ALTA",
                        "Pavimentação asfáltica de vias urbanas",
                        900_000.0,
                    ),
                    // Admitted, sampled clean, discarded
                    tender_json(
                        "99888777000166",
                        30,
                        "PREFEITURA MUNICIPAL DE BAGE",
                        "Aquisição de material penso",
                        120_000.0,
                    ),
                ],
                1,
                1,
            ),
        );

        api.on_path(
            &items_base("26989715000123", 42),
            listing_body(&[("Luva de procedimento", Some(0.4)), ("Seringa 10ml", Some(1.1))]),
        );

        let base = items_base("11222333000144", 10);
        api.on_path(
            &format!("{base}/1"),
            item_body(1, "Curativo hidrocoloide esteril CATMAT 651510"),
        );
        api.on_path(&format!("{base}/2"), item_body(2, "Gaze hidrofila"));
        api.on_path(
            &base,
            listing_body(&[("Curativo hidrocoloide esteril CATMAT 651510", Some(3.2))]),
        );

        api.on_path(&items_base("55666777000188", 20), listing_body(&[]));

        let base = items_base("99888777000166", 30);
        api.on_path(&format!("{base}/1"), item_body(1, "Cadeira giratoria"));
        api.on_path(&format!("{base}/2"), item_body(2, "Mesa de escritorio"));
        api.on_path(&format!("{base}/3"), item_body(3, "Armario de aco"));

        api
    };

    // The cache persists across runs, the way the binary reloads it
    let cache = Arc::new(TieredCache::new(30));
    cache.seed_known_organizations();

    let first = pipeline(world(), test_config(), pool.clone(), Arc::clone(&cache))
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.confirmed.len(), 3);
    assert!(first.failed.is_empty());
    assert!(first.shortfalls.is_empty());
    assert!(first.aborted.is_none());

    let source_of = |seq_cnpj: (&str, u32)| {
        first
            .confirmed
            .iter()
            .find(|t| t.tender.control_number == control_number(seq_cnpj.0, seq_cnpj.1))
            .map(|t| t.source)
    };
    assert_eq!(source_of(("26989715000123", 42)), Some(VerdictSource::OrgHistory));
    assert_eq!(source_of(("11222333000144", 10)), Some(VerdictSource::ExplicitCode));
    assert_eq!(source_of(("55666777000188", 20)), Some(VerdictSource::Keyword));

    let metrics = &first.metrics;
    assert_eq!(metrics.stage(Stage::Discovery).unwrap().output, 5);
    assert_eq!(metrics.stage(Stage::Heuristic).unwrap().input, 5);
    assert_eq!(metrics.stage(Stage::Heuristic).unwrap().output, 4);
    assert_eq!(metrics.stage(Stage::Sampling).unwrap().output, 3);
    assert_eq!(metrics.stage(Stage::Materialization).unwrap().output, 3);
    // The quick filter itself made no external calls
    assert_eq!(metrics.stage(Stage::Heuristic).unwrap().api_calls, 0);

    assert_eq!(tender_count(&pool).await.unwrap(), 3);

    // Rerun with the same store and the carried-over cache: the gate
    // removes everything persisted, and the cache settles the rest
    // without a single sampling call
    let second = pipeline(world(), test_config(), pool.clone(), Arc::clone(&cache))
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert!(second.confirmed.is_empty());
    assert_eq!(second.metrics.stage(Stage::Heuristic).unwrap().input, 2);
    assert_eq!(second.metrics.stage(Stage::Heuristic).unwrap().output, 0);
    assert_eq!(second.metrics.stage(Stage::Sampling).unwrap().api_calls, 0);
    assert_eq!(tender_count(&pool).await.unwrap(), 3);
}
