//! Enrichment engine: ordering, conflicts, cycles, gating and observers.

use std::sync::{Arc, Mutex};

use serde_json::json;
use trustflow::enrichment::graph::GroupPlan;
use trustflow::enrichment::{
    Enricher, EnricherOutput, EnricherRegistry, EnrichmentEngine, EnrichmentError,
    EnrichmentErrorKind, EnrichmentGroup, EnrichmentObserver, EnrichmentResult,
};
use trustflow::types::SignalMap;

/// Request context handed to every enricher.
#[derive(Debug)]
struct Request {
    ip: &'static str,
}

fn ip() -> Enricher<Request> {
    Enricher::new("ip", |req: &Request, _: &SignalMap| {
        EnricherOutput::default().signal("ip", json!(req.ip))
    })
    .provides(["ip"])
}

fn geo() -> Enricher<Request> {
    Enricher::new("geo", |_: &Request, signals: &SignalMap| {
        let country = match signals.get("ip").and_then(|v| v.as_str()) {
            Some(ip) if ip.starts_with("10.") => "internal",
            _ => "NL",
        };
        EnricherOutput::default().signal("country", json!(country))
    })
    .provides(["country"])
    .depends_on(["ip"])
}

fn risk() -> Enricher<Request> {
    Enricher::new("risk", |_: &Request, signals: &SignalMap| {
        let score = if signals.get("country") == Some(&json!("internal")) {
            0
        } else {
            5
        };
        EnricherOutput::default().signal("risk", json!({ "score": score }))
    })
    .provides(["risk"])
    .depends_on(["country"])
}

fn record_order(log: &Arc<Mutex<Vec<String>>>, name: &str) -> Enricher<Request> {
    let log = Arc::clone(log);
    let owned = name.to_owned();
    Enricher::new(name, move |_: &Request, _: &SignalMap| {
        log.lock().expect("test lock").push(owned.clone());
        EnricherOutput::default()
    })
}

// ---------- ordering ----------

#[test]
fn dependency_chain_runs_in_order() {
    let registry = EnricherRegistry::builder()
        .invariant(risk())
        .invariant(geo())
        .invariant(ip())
        .build()
        .expect("registry");
    let result = EnrichmentEngine::new(Arc::new(registry)).run(&Request { ip: "10.0.0.1" });

    assert!(!result.has_errors());
    assert_eq!(result.signals.get("country"), Some(&json!("internal")));
    assert_eq!(result.signals.get("risk"), Some(&json!({"score": 0})));
}

#[test]
fn execution_order_ignores_registration_order() {
    let run = |names: &[&str]| {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = EnricherRegistry::builder();
        for name in names {
            builder = builder.invariant(record_order(&log, name));
        }
        let engine = EnrichmentEngine::new(Arc::new(builder.build().expect("registry")));
        engine.run(&Request { ip: "1.1.1.1" });
        let order = log.lock().expect("test lock").clone();
        order
    };

    let forward = run(&["beta", "alpha", "gamma"]);
    let reverse = run(&["gamma", "beta", "alpha"]);
    assert_eq!(forward, vec!["alpha", "beta", "gamma"]);
    assert_eq!(forward, reverse);
}

#[test]
fn policies_see_invariant_signals() {
    let registry = EnricherRegistry::builder()
        .invariant(ip())
        .invariant(geo())
        .policy(risk())
        .build()
        .expect("registry");
    let result = EnrichmentEngine::new(Arc::new(registry)).run(&Request { ip: "8.8.8.8" });
    assert!(!result.has_errors());
    assert_eq!(result.signals.get("risk"), Some(&json!({"score": 5})));
}

#[test]
fn invariants_do_not_see_policy_signals() {
    let registry = EnricherRegistry::builder()
        .invariant(geo())
        .policy(ip())
        .build()
        .expect("registry");
    let result = EnrichmentEngine::new(Arc::new(registry)).run(&Request { ip: "8.8.8.8" });
    assert!(!result.signals.contains_key("country"));
    assert_eq!(result.signals.get("ip"), Some(&json!("8.8.8.8")));
    assert_eq!(
        result.errors_of(EnrichmentErrorKind::SkippedEnricher).count(),
        1
    );
}

// ---------- missing dependencies ----------

#[test]
fn missing_dependencies_skip_enricher() {
    let needy = Enricher::new("needy", |_: &Request, _: &SignalMap| {
        EnricherOutput::default().signal("out", json!(1))
    })
    .provides(["out"])
    .depends_on(["a", "b"]);
    let registry = EnricherRegistry::builder()
        .policy(needy)
        .build()
        .expect("registry");
    let result = EnrichmentEngine::new(Arc::new(registry)).run(&Request { ip: "" });

    assert!(!result.signals.contains_key("out"));
    assert_eq!(
        result.errors,
        vec![
            EnrichmentError::MissingDependency {
                enricher: "needy".into(),
                signal: "a".into(),
            },
            EnrichmentError::MissingDependency {
                enricher: "needy".into(),
                signal: "b".into(),
            },
            EnrichmentError::SkippedEnricher {
                enricher: "needy".into(),
                missing: vec!["a".into(), "b".into()],
            },
        ]
    );
}

#[test]
fn seeded_signals_satisfy_dependencies() {
    let registry = EnricherRegistry::builder()
        .invariant(geo())
        .build()
        .expect("registry");
    let mut seed = SignalMap::new();
    seed.insert("ip".into(), json!("10.1.2.3"));
    let result =
        EnrichmentEngine::new(Arc::new(registry)).run_with_signals(&Request { ip: "" }, seed);
    assert!(!result.has_errors());
    assert_eq!(result.signals.get("country"), Some(&json!("internal")));
}

// ---------- conflicts ----------

fn writes(name: &str, signal: &str, value: serde_json::Value) -> Enricher<Request> {
    let signal = signal.to_owned();
    Enricher::new(name, move |_: &Request, _: &SignalMap| {
        EnricherOutput::default().signal(signal.clone(), value.clone())
    })
}

#[test]
fn deep_equal_value_is_not_a_conflict() {
    let first: serde_json::Value =
        serde_json::from_str(r#"{"a":1,"b":[1,2]}"#).expect("json");
    let second: serde_json::Value =
        serde_json::from_str(r#"{"b":[1,2],"a":1.0}"#).expect("json");
    let registry = EnricherRegistry::builder()
        .invariant(writes("a_first", "shape", first.clone()).provides(["shape"]))
        .invariant(writes("b_second", "shape", second))
        .build()
        .expect("registry");
    let result = EnrichmentEngine::new(Arc::new(registry)).run(&Request { ip: "" });
    assert!(!result.has_errors());
    assert_eq!(result.signals.get("shape"), Some(&first));
}

#[test]
fn differing_value_reports_one_conflict_and_keeps_first() {
    let registry = EnricherRegistry::builder()
        .invariant(writes("a_first", "shape", json!("circle")).provides(["shape"]))
        .policy(writes("b_second", "shape", json!("square")))
        .build()
        .expect("registry");
    let result = EnrichmentEngine::new(Arc::new(registry)).run(&Request { ip: "" });
    assert_eq!(result.signals.get("shape"), Some(&json!("circle")));
    assert_eq!(
        result.errors,
        vec![EnrichmentError::ConflictingSignals {
            signal: "shape".into(),
            enricher: "b_second".into(),
            first_writer: Some("a_first".into()),
        }]
    );
}

#[test]
fn conflict_with_seed_has_no_first_writer() {
    let registry = EnricherRegistry::builder()
        .invariant(ip())
        .build()
        .expect("registry");
    let mut seed = SignalMap::new();
    seed.insert("ip".into(), json!("127.0.0.1"));
    let result =
        EnrichmentEngine::new(Arc::new(registry)).run_with_signals(&Request { ip: "1.2.3.4" }, seed);
    assert_eq!(result.signals.get("ip"), Some(&json!("127.0.0.1")));
    assert_eq!(
        result.errors,
        vec![EnrichmentError::ConflictingSignals {
            signal: "ip".into(),
            enricher: "ip".into(),
            first_writer: None,
        }]
    );
}

#[test]
fn identical_deeply_nested_values_do_not_conflict() {
    let text = format!("{}0{}", "[".repeat(80), "]".repeat(80));
    let deep: serde_json::Value = serde_json::from_str(&text).expect("json");
    let registry = EnricherRegistry::builder()
        .invariant(writes("a_first", "s", deep.clone()).provides(["s"]))
        .invariant(writes("b_second", "s", deep.clone()))
        .build()
        .expect("registry");
    let result = EnrichmentEngine::new(Arc::new(registry)).run(&Request { ip: "" });
    assert!(!result.has_errors());
    assert_eq!(result.signals.get("s"), Some(&deep));
}

#[test]
fn large_integer_and_nearby_float_conflict() {
    let registry = EnricherRegistry::builder()
        .invariant(writes("a_first", "n", json!(9_007_199_254_740_993_u64)).provides(["n"]))
        .invariant(writes("b_second", "n", json!(9_007_199_254_740_992.0)))
        .build()
        .expect("registry");
    let result = EnrichmentEngine::new(Arc::new(registry)).run(&Request { ip: "" });
    assert_eq!(
        result.errors_of(EnrichmentErrorKind::ConflictingSignals).count(),
        1
    );
    assert_eq!(result.signals.get("n"), Some(&json!(9_007_199_254_740_993_u64)));
}

// ---------- cycles ----------

#[test]
fn cycle_aborts_group_with_one_error() {
    let a = writes("a", "x", json!(1)).provides(["x"]).depends_on(["y"]);
    let b = writes("b", "y", json!(2)).provides(["y"]).depends_on(["x"]);
    let registry = EnricherRegistry::builder()
        .invariant(a)
        .invariant(b)
        .invariant(writes("c", "z", json!(3)).provides(["z"]))
        .policy(writes("p", "w", json!(4)).provides(["w"]))
        .build()
        .expect("registry");
    let engine = EnrichmentEngine::new(Arc::new(registry));
    assert!(matches!(
        engine.plan(EnrichmentGroup::Invariants),
        GroupPlan::Cyclic(_)
    ));

    let result = engine.run(&Request { ip: "" });
    assert_eq!(
        result.errors,
        vec![EnrichmentError::CircularDependency {
            group: EnrichmentGroup::Invariants,
            path: vec!["a".into(), "b".into(), "a".into()],
        }]
    );
    assert!(!result.signals.contains_key("x"));
    assert!(!result.signals.contains_key("y"));
    assert!(!result.signals.contains_key("z"));
    assert_eq!(result.signals.get("w"), Some(&json!(4)));
}

// ---------- errors ----------

#[test]
fn errors_serialize_with_kind_tag() {
    let error = EnrichmentError::SkippedEnricher {
        enricher: "geo".into(),
        missing: vec!["ip".into()],
    };
    let value = serde_json::to_value(&error).expect("serialize");
    assert_eq!(value["kind"], "SKIPPED_ENRICHER");
    assert_eq!(value["enricher"], "geo");
}

// ---------- observer ----------

#[derive(Default)]
struct Recorder {
    categories: Mutex<Vec<&'static str>>,
    all: Mutex<Vec<EnrichmentErrorKind>>,
}

impl EnrichmentObserver for Recorder {
    fn on_missing_dependency(&self, error: &EnrichmentError) {
        self.categories.lock().expect("test lock").push("missing");
        self.on_error(error);
    }

    fn on_error(&self, error: &EnrichmentError) {
        self.all.lock().expect("test lock").push(error.kind());
    }
}

#[test]
fn observer_receives_every_error() {
    let recorder = Arc::new(Recorder::default());
    let registry = EnricherRegistry::builder()
        .invariant(geo())
        .policy(Enricher::new("broken", |_: &Request, _: &SignalMap| {
            EnricherOutput::default().error("lookup failed")
        }))
        .build()
        .expect("registry");
    let engine = EnrichmentEngine::new(Arc::new(registry))
        .with_observer(Arc::clone(&recorder) as Arc<dyn EnrichmentObserver>);
    let result = engine.run(&Request { ip: "" });

    assert_eq!(
        *recorder.categories.lock().expect("test lock"),
        vec!["missing"]
    );
    let seen = recorder.all.lock().expect("test lock").clone();
    let recorded: Vec<_> = result.errors.iter().map(EnrichmentError::kind).collect();
    assert_eq!(seen, recorded);
    assert_eq!(
        seen,
        vec![
            EnrichmentErrorKind::MissingDependency,
            EnrichmentErrorKind::SkippedEnricher,
            EnrichmentErrorKind::EnricherError,
        ]
    );
}

// ---------- determinism ----------

fn mixed_invariants() -> Vec<Enricher<Request>> {
    vec![
        ip(),
        geo(),
        risk(),
        writes("needy", "asn_owner", json!("x"))
            .provides(["asn_owner"])
            .depends_on(["asn"]),
        writes("shadow", "country", json!("XX")),
    ]
}

fn mixed_policies() -> Vec<Enricher<Request>> {
    vec![
        writes("loop_a", "pa", json!(1)).provides(["pa"]).depends_on(["pb"]),
        writes("loop_b", "pb", json!(2)).provides(["pb"]).depends_on(["pa"]),
        writes("bystander", "pc", json!(3)).provides(["pc"]),
    ]
}

fn run_permuted(invariant_order: &[usize], policy_order: &[usize]) -> EnrichmentResult {
    let invariants = mixed_invariants();
    let policies = mixed_policies();
    let mut builder = EnricherRegistry::builder();
    for &i in invariant_order {
        builder = builder.invariant(invariants[i].clone());
    }
    for &i in policy_order {
        builder = builder.policy(policies[i].clone());
    }
    let registry = builder.build().expect("registry");
    EnrichmentEngine::new(Arc::new(registry)).run(&Request { ip: "8.8.8.8" })
}

#[test]
fn results_are_identical_across_registration_orders() {
    let baseline = run_permuted(&[0, 1, 2, 3, 4], &[0, 1, 2]);
    let permutations: [(&[usize], &[usize]); 3] = [
        (&[4, 3, 2, 1, 0], &[2, 1, 0]),
        (&[2, 0, 4, 1, 3], &[1, 2, 0]),
        (&[3, 4, 0, 2, 1], &[0, 2, 1]),
    ];
    for (invariant_order, policy_order) in permutations {
        let result = run_permuted(invariant_order, policy_order);
        assert_eq!(result.signals, baseline.signals);
        assert_eq!(result.errors, baseline.errors);
    }

    assert_eq!(baseline.signals.get("country"), Some(&json!("NL")));
    assert_eq!(baseline.signals.get("risk"), Some(&json!({ "score": 5 })));
    assert!(!baseline.signals.contains_key("asn_owner"));
    assert!(!baseline.signals.contains_key("pc"));
    let kinds: Vec<_> = baseline.errors.iter().map(EnrichmentError::kind).collect();
    assert_eq!(
        kinds,
        vec![
            EnrichmentErrorKind::MissingDependency,
            EnrichmentErrorKind::SkippedEnricher,
            EnrichmentErrorKind::ConflictingSignals,
            EnrichmentErrorKind::CircularDependency,
        ]
    );
}
