//! End-to-end tests of federated queries over in-memory cores.

use fxjoin::Error;
use fxjoin::config::EngineConfig;
use fxjoin::federation::{FederatedResponse, FederationEngine};
use fxjoin::index::{Document, MemoryCore};
use fxjoin::join::RelationalExpr;
use fxjoin::query::{BoolQuery, ComposedQuery, FacetRequest, MissingValue, Query, SortField, ValueType};
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

static SHARED: OnceLock<FederationEngine> = OnceLock::new();

fn doc(id: &str, key: i64) -> Document {
    Document::new(id).with_int("K", key)
}

fn core(name: &str, segments: Vec<Vec<Document>>) -> MemoryCore {
    let core = MemoryCore::new(name);
    for docs in segments {
        core.add_segment(docs);
    }
    core
}

fn engine_with(concurrency: usize, cores: Vec<MemoryCore>) -> FederationEngine {
    let mut engine = FederationEngine::new(EngineConfig {
        concurrency,
        ..Default::default()
    })
    .unwrap();
    for core in cores {
        engine.register(Arc::new(core)).unwrap();
    }
    engine
}

/// Cores a (results), b and c, all keyed on `K`
fn shared() -> &'static FederationEngine {
    SHARED.get_or_init(|| {
        let a = core(
            "a",
            vec![
                vec![
                    doc("a1", 1).with_str("type", "x").with_str("U", "true"),
                    doc("a2", 2).with_str("type", "x"),
                ],
                vec![
                    doc("a3", 3).with_str("type", "y").with_str("U", "true"),
                    doc("a4", 4).with_str("type", "x"),
                ],
            ],
        );
        let b = core(
            "b",
            vec![
                vec![
                    doc("b1", 1).with_str("color", "red").with_str("title", "zulu"),
                    doc("b2", 2).with_str("color", "blue").with_str("N", "true"),
                ],
                vec![
                    doc("b3", 3).with_str("color", "red").with_str("title", "alpha"),
                    doc("b5", 5).with_str("color", "red"),
                ],
            ],
        );
        let c = core(
            "c",
            vec![vec![
                doc("c1", 1).with_str("size", "big"),
                doc("c3", 3).with_str("size", "small"),
            ]],
        );
        engine_with(3, vec![a, b, c])
    })
}

fn run(query: &ComposedQuery) -> FederatedResponse {
    shared().execute(query).unwrap()
}

#[test]
fn test_exists_in_other_core() {
    let a = core(
        "a",
        vec![
            vec![doc("a1", 1), doc("a2", 2)],
            vec![doc("a3", 3), doc("a4", 4)],
        ],
    );
    let b = core("b", vec![vec![doc("b1", 2)]]);
    let engine = engine_with(2, vec![a, b]);

    let query = ComposedQuery::new("a")
        .query("b", Query::All)
        .join("a", "K", "b", "K");
    let response = engine.execute(&query).unwrap();
    assert_eq!(response.ids(), vec!["a2"]);
    assert_eq!(response.total_hits, 1);
    let phases: Vec<_> = response.timings.iter().map(|t| t.phase).collect();
    assert_eq!(phases, vec!["core_filter", "main"]);
}

#[test]
fn test_concurrency_does_not_change_results() {
    let build = |concurrency| {
        let a = core(
            "a",
            (0..6)
                .map(|s| (1..=5).map(|i| doc(&format!("a{}_{}", s, i), s * 5 + i)).collect())
                .collect(),
        );
        let b = core(
            "b",
            vec![(1..=30).filter(|k| k % 3 == 0).map(|k| doc(&format!("b{}", k), k)).collect()],
        );
        engine_with(concurrency, vec![a, b])
    };
    let query = ComposedQuery::new("a")
        .query("b", Query::All)
        .join("a", "K", "b", "K")
        .page(0, 100)
        .export("K");

    let serial = build(1).execute(&query).unwrap();
    let parallel = build(4).execute(&query).unwrap();
    assert_eq!(serial.total_hits, 10);
    assert_eq!(serial.ids(), parallel.ids());
    assert_eq!(serial.exported_keys, parallel.exported_keys);
}

#[test]
fn test_unite_projects_both_sides() {
    let query = ComposedQuery::new("a")
        .unite("a", Query::term("U", "true"), "b", Query::term("N", "true"))
        .join("a", "K", "b", "K");
    let response = run(&query);
    assert_eq!(response.ids(), vec!["a1", "a2", "a3"]);
    assert_eq!(response.total_hits, 3);
}

#[test]
fn test_unite_within_result_core() {
    let query = ComposedQuery::new("a")
        .unite("a", Query::term("type", "y"), "a", Query::term("U", "true"))
        .join("a", "K", "a", "K");
    let response = run(&query);
    assert_eq!(response.ids(), vec!["a1", "a3"]);
    let phases: Vec<_> = response.timings.iter().map(|t| t.phase).collect();
    assert_eq!(phases, vec!["unite", "main"]);
}

#[test]
fn test_filter_and_exclude_on_other_core() {
    let red = ComposedQuery::new("a")
        .filter("b", Query::term("color", "red"))
        .join("a", "K", "b", "K");
    assert_eq!(run(&red).ids(), vec!["a1", "a3"]);

    let not_red = ComposedQuery::new("a")
        .exclude("b", Query::term("color", "red"))
        .join("a", "K", "b", "K");
    assert_eq!(run(&not_red).ids(), vec!["a2", "a4"]);
}

#[test]
fn test_relational_filter() {
    let expr = RelationalExpr::and(
        RelationalExpr::leaf("b", Query::term("color", "red"), "K"),
        RelationalExpr::not(RelationalExpr::leaf("c", Query::term("size", "big"), "K")),
    );
    let query = ComposedQuery::new("a").relational("K", expr);
    let response = run(&query);
    assert_eq!(response.ids(), vec!["a3"]);
    assert_eq!(response.timings[0].phase, "relational_filter");
}

#[test]
fn test_rank_scores_blend_into_results() {
    let query = ComposedQuery::new("a")
        .rank("c", Query::term("size", "small"))
        .join("a", "K", "c", "K")
        .ratio(0.5);
    let response = run(&query);
    assert_eq!(response.ids(), vec!["a3", "a1", "a2", "a4"]);
    assert!((response.hits[0].score - 1.5).abs() < 1e-3);
    assert!((response.hits[1].score - 1.0).abs() < 1e-3);

    // Out-of-range ratio falls back to an even blend
    let fallback = run(&query.clone().ratio(3.0));
    assert_eq!(fallback.ids(), response.ids());
    assert!((fallback.hits[0].score - 1.5).abs() < 1e-3);
}

#[test]
fn test_oversized_rank_key_aborts() {
    let a = core("a", vec![vec![doc("a1", 1)]]);
    let b = core("b", vec![vec![doc("b1", 1), doc("b_huge", 10_000_000_000)]]);
    let engine = engine_with(2, vec![a, b]);
    let query = ComposedQuery::new("a")
        .rank("b", Query::All)
        .join("a", "K", "b", "K");
    assert!(matches!(
        engine.execute(&query),
        Err(Error::CapacityInvariant(_))
    ));
}

#[test]
fn test_sort_by_other_core_string_last() {
    let title = SortField::new("title", ValueType::String)
        .on_core("b")
        .missing(MissingValue::StringLast);
    let asc = ComposedQuery::new("a")
        .sort_by(title.clone())
        .join("a", "K", "b", "K");
    assert_eq!(run(&asc).ids(), vec!["a3", "a1", "a2", "a4"]);

    let desc = ComposedQuery::new("a")
        .sort_by(title.desc())
        .join("a", "K", "b", "K");
    assert_eq!(run(&desc).ids(), vec!["a1", "a3", "a2", "a4"]);
}

#[test]
fn test_score_sort_on_other_core_rejected() {
    let query = ComposedQuery::new("a")
        .sort_by(SortField::score().on_core("b"))
        .join("a", "K", "b", "K");
    assert!(matches!(shared().execute(&query), Err(Error::InvalidQuery(_))));
}

#[test]
fn test_facets_on_result_and_other_core() {
    let query = ComposedQuery::new("a")
        .query("a", Query::term("type", "x"))
        .facet("a", FacetRequest::new("type"))
        .facet("b", FacetRequest::new("color"))
        .join("a", "K", "b", "K");
    let response = run(&query);
    // Faceting b does not restrict a; a4 has no partner in b
    assert_eq!(response.ids(), vec!["a1", "a2", "a4"]);

    let a = &response.facets["a"][0];
    assert_eq!(a.field, "type");
    assert_eq!(a.counts.len(), 1);
    assert_eq!((a.counts[0].term.as_str(), a.counts[0].count), ("x", 3));

    // Counted over b documents keyed 1, 2 or 4
    let b = &response.facets["b"][0];
    let counts: Vec<_> = b.counts.iter().map(|c| (c.term.as_str(), c.count)).collect();
    assert_eq!(counts, vec![("blue", 1), ("red", 1)]);
}

#[test]
fn test_facet_core_does_not_filter_results() {
    let a = core(
        "a",
        vec![vec![
            doc("a1", 1).with_str("type", "x"),
            doc("a4", 4).with_str("type", "x"),
        ]],
    );
    let b = core("b", vec![vec![doc("b1", 1).with_str("color", "red")]]);
    let engine = engine_with(2, vec![a, b]);

    let query = ComposedQuery::new("a")
        .query("a", Query::term("type", "x"))
        .facet("b", FacetRequest::new("color"))
        .join("a", "K", "b", "K");
    let response = engine.execute(&query).unwrap();
    assert_eq!(response.ids(), vec!["a1", "a4"]);
    let phases: Vec<_> = response.timings.iter().map(|t| t.phase).collect();
    assert!(phases.contains(&"facet"));

    // An explicit primary query on b does restrict
    let restricted = query.query("b", Query::All);
    assert_eq!(engine.execute(&restricted).unwrap().ids(), vec!["a1"]);
}

#[test]
fn test_export_key_of_all_hits() {
    let query = ComposedQuery::new("a")
        .query("a", Query::term("type", "x"))
        .page(0, 1)
        .export("K");
    let response = run(&query);
    assert_eq!(response.ids(), vec!["a1"]);
    let exported = response.exported_keys.unwrap();
    assert_eq!(exported.iter().collect::<Vec<_>>(), vec![1, 2, 4]);
}

#[test]
fn test_paging_window() {
    let query = ComposedQuery::new("a")
        .query("b", Query::All)
        .join("a", "K", "b", "K")
        .page(1, 3);
    let response = run(&query);
    assert_eq!(response.total_hits, 3);
    assert_eq!(response.ids(), vec!["a2", "a3"]);
}

#[test]
fn test_single_core_fast_path() {
    let query = ComposedQuery::new("a")
        .query("a", Query::term("type", "x"))
        .facet("a", FacetRequest::new("type"));
    let response = run(&query);
    assert_eq!(response.ids(), vec!["a1", "a2", "a4"]);
    assert_eq!(response.total_hits, 3);
    assert!(response.exported_keys.is_none());
    let phases: Vec<_> = response.timings.iter().map(|t| t.phase).collect();
    assert_eq!(phases, vec!["main"]);
}

#[test]
fn test_configuration_errors_abort() {
    let unknown = ComposedQuery::new("a")
        .facet("ghost", FacetRequest::new("color"))
        .join("a", "K", "ghost", "K");
    assert!(matches!(
        shared().execute(&unknown),
        Err(Error::UnknownCore(name)) if name == "ghost"
    ));

    let unrelated = ComposedQuery::new("a").participate("c");
    assert!(matches!(
        shared().execute(&unrelated),
        Err(Error::MissingRelation { from, to }) if from == "a" && to == "c"
    ));

    let reversed = ComposedQuery::new("a").page(5, 2);
    assert!(matches!(shared().execute(&reversed), Err(Error::InvalidQuery(_))));
}

#[test]
fn test_collapse_keeps_best_per_key() {
    let a = core(
        "a",
        vec![
            vec![
                Document::new("a1").with_int("G", 7).with_str("type", "x"),
                Document::new("a2")
                    .with_int("G", 7)
                    .with_str("type", "x")
                    .with_str("boost", "1"),
            ],
            vec![
                Document::new("a3").with_int("G", 8).with_str("type", "x"),
                Document::new("a4").with_str("type", "x"),
            ],
        ],
    );
    let engine = engine_with(2, vec![a]);
    let boosted = Query::Bool(BoolQuery {
        should: vec![Query::term("type", "x"), Query::term("boost", "1")],
        ..Default::default()
    });
    let query = ComposedQuery::new("a").query("a", boosted).collapse("G");
    let response = engine.execute(&query).unwrap();
    assert_eq!(response.ids(), vec!["a2", "a3", "a4"]);
    assert_eq!(response.total_hits, 3);
    assert!((response.hits[0].score - 2.0).abs() < 1e-3);
}

#[test]
fn test_collapse_retry_budget_aborts_call() {
    let a = core(
        "a",
        vec![vec![
            Document::new("a1").with_int("G", 7),
            Document::new("a2").with_int("G", 8),
        ]],
    );
    let mut engine = FederationEngine::new(EngineConfig {
        concurrency: 2,
        cas_retry_budget: 0,
        ..Default::default()
    })
    .unwrap();
    engine.register(Arc::new(a)).unwrap();

    let query = ComposedQuery::new("a").collapse("G");
    assert!(matches!(
        engine.execute(&query),
        Err(Error::RetryBudgetExceeded(0))
    ));
}

#[test]
fn test_key_cache_reused_until_segment_changes() {
    let a = core(
        "a",
        vec![vec![doc("a1", 1), doc("a2", 2), doc("a3", 3), doc("a4", 4)]],
    );
    let b = Arc::new(core(
        "b",
        vec![
            vec![
                doc("b1", 1).with_str("color", "red"),
                doc("b2", 2).with_str("color", "blue"),
            ],
            vec![
                doc("b3", 3).with_str("color", "red"),
                doc("b4", 4).with_str("color", "red"),
            ],
        ],
    ));
    let mut engine = engine_with(2, vec![a]);
    engine.register(b.clone()).unwrap();

    let query = ComposedQuery::new("a")
        .filter("b", Query::term("color", "red"))
        .join("a", "K", "b", "K");
    let stats = || {
        let stats = &engine.caches().bitsets.stats;
        (stats.hits.load(Ordering::Relaxed), stats.misses.load(Ordering::Relaxed))
    };

    assert_eq!(engine.execute(&query).unwrap().ids(), vec!["a1", "a3", "a4"]);
    assert_eq!(stats(), (0, 2));
    assert_eq!(engine.execute(&query).unwrap().ids(), vec!["a1", "a3", "a4"]);
    assert_eq!(stats(), (2, 2));

    assert_eq!(b.delete("b4"), 1);
    assert_eq!(engine.execute(&query).unwrap().ids(), vec!["a1", "a3"]);
    assert_eq!(stats(), (3, 3));
}

#[test]
fn test_json_request_and_response() {
    let query: ComposedQuery = serde_json::from_str(
        r#"{
            "results_from": "a",
            "cores": {
                "a": {},
                "b": {"filter_queries": [{"type": "term", "field": "color", "value": "red"}]}
            },
            "matches": [{"from": "a", "to": "b", "key_field": "K"},
                        {"from": "b", "to": "a", "key_field": "K"}],
            "stop": 1,
            "export_key": "K"
        }"#,
    )
    .unwrap();
    let response = run(&query);
    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["total_hits"], 2);
    assert_eq!(json["hits"][0]["id"], "a1");
    assert!(json.get("exported_keys").is_some());
}
