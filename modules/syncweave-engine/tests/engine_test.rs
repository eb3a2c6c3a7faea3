//! Integration tests for the sync engine dispatch loop.
//!
//! Every test builds a fresh `Fixture` (five in-memory concepts on one
//! engine) and drives it only through instrumented actions.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use syncweave_engine::testing::{
    demo_syncs, ButtonConcept, Fixture, BUTTON_INCREMENTS, NOTIFY_ON_3, THRESHOLD_MESSAGE,
};
use syncweave_engine::{
    flow_key, mapping, ActionPattern, Concept, EngineConfig, Fields, Frame, Frames, Invocation,
    Logging, Mapping, Methods, SyncDeclaration, SyncEngine, SyncError, Syncs,
};

fn click(kind: &str) -> Mapping {
    mapping(json!({ "kind": kind }))
}

async fn seeded_list(f: &Fixture, items: &[&str]) -> Result<()> {
    for item in items {
        f.add.call(mapping(json!({ "item": item }))).await?;
    }
    Ok(())
}

fn sync_error(err: &anyhow::Error) -> &SyncError {
    err.downcast_ref::<SyncError>()
        .unwrap_or_else(|| panic!("expected SyncError, got {err:#}"))
}

// ===========================================================================
// Demo rules
// ===========================================================================

#[tokio::test]
async fn single_click_increments_counter_once() -> Result<()> {
    let f = Fixture::new()?;
    f.register_demo()?;

    f.clicked.call(click("inc")).await?;

    assert_eq!(f.counter.count(), 1);
    Ok(())
}

#[tokio::test]
async fn three_clicks_in_one_flow_increment_three_times() -> Result<()> {
    let f = Fixture::new()?;
    f.engine.register(Syncs::new().add(BUTTON_INCREMENTS, {
        let (clicked, increment) = (f.clicked.clone(), f.increment.clone());
        move |_| {
            SyncDeclaration::new()
                .when(ActionPattern::new(&clicked).input("kind", "inc").completed())
                .then(ActionPattern::new(&increment))
        }
    }))?;

    for _ in 0..3 {
        f.clicked
            .invoke(Invocation::new(click("inc")).in_flow("flow-a"))
            .await?;
    }

    assert_eq!(f.counter.count(), 3);
    let increments = f.records_of(&f.increment);
    assert_eq!(increments.len(), 3);
    assert!(increments.iter().all(|r| r.flow == "flow-a"));
    Ok(())
}

#[tokio::test]
async fn notify_fires_only_after_the_third_click() -> Result<()> {
    let f = Fixture::new()?;
    f.register_demo()?;

    f.clicked.call(click("inc")).await?;
    f.clicked.call(click("inc")).await?;
    assert!(f.notification.messages().is_empty());

    f.clicked.call(click("inc")).await?;
    assert_eq!(f.notification.messages(), vec![THRESHOLD_MESSAGE.to_string()]);
    Ok(())
}

#[tokio::test]
async fn one_flow_fires_once_per_matching_combination() -> Result<()> {
    let f = Fixture::new()?;
    f.register_demo()?;

    for _ in 0..3 {
        f.clicked
            .invoke(Invocation::new(click("inc")).in_flow("shared"))
            .await?;
    }

    // Three unsynced clicks and three unsynced increments in one flow: every
    // click/increment pair satisfies NotifyOn3 once the count reaches 3.
    assert_eq!(f.notification.messages().len(), 9);
    let notices = f.records_of(&f.notify);
    let then_ids: HashSet<_> = notices.iter().map(|r| r.id.clone()).collect();
    assert_eq!(then_ids.len(), 9);
    Ok(())
}

#[tokio::test]
async fn fanout_over_list_records_once_per_item() -> Result<()> {
    let f = Fixture::new()?;
    f.register_demo()?;
    seeded_list(&f, &["1", "2", "3"]).await?;

    f.clicked.call(click("fanout")).await?;

    assert_eq!(f.recorder.order(), vec!["v:1", "v:2", "v:3"]);
    Ok(())
}

#[tokio::test]
async fn fanout_over_list_with_async_query() -> Result<()> {
    let f = Fixture::new()?;
    f.register_demo()?;
    seeded_list(&f, &["1", "2", "3"]).await?;

    f.clicked.call(click("fanout-async")).await?;

    assert_eq!(f.recorder.order(), vec!["v:1", "v:2", "v:3"]);
    Ok(())
}

#[tokio::test]
async fn chained_rules_each_fire_once() -> Result<()> {
    let f = Fixture::new()?;
    f.register_demo()?;

    f.record.call(mapping(json!({ "tag": "x" }))).await?;

    assert_eq!(f.recorder.order().join(","), "x,x:a,x:done");
    Ok(())
}

#[tokio::test]
async fn where_fanout_composes_with_later_filters() -> Result<()> {
    let f = Fixture::new()?;
    f.register_demo()?;
    seeded_list(&f, &["1", "2", "3"]).await?;

    let record = f.record.clone();
    f.engine.register(Syncs::new().add("OnlyEven", move |vars| {
        let [tag, even] = vars.vars(["tag", "even"]);
        let then_even = even.clone();
        SyncDeclaration::new()
            .when(ActionPattern::new(&record).input("tag", &tag).completed())
            .where_frames(move |frames| {
                frames
                    .filter(|frame| frame.str(&tag).is_some_and(|t| t.starts_with("v:")))
                    .filter(|frame| {
                        frame
                            .str(&tag)
                            .and_then(|t| t.trim_start_matches("v:").parse::<i64>().ok())
                            .is_some_and(|n| n % 2 == 0)
                    })
                    .map(|frame| {
                        let label = format!("even:{}", frame.str(&tag).unwrap_or_default().trim_start_matches("v:"));
                        frame.bind(&even, label)
                    })
            })
            .then(ActionPattern::new(&record).input("tag", &then_even))
    }))?;

    f.clicked.call(click("fanout")).await?;

    let order = f.recorder.order();
    assert_eq!(order.iter().filter(|t| t.starts_with("v:")).count(), 3);
    assert_eq!(order.iter().filter(|t| t.starts_with("even:")).collect::<Vec<_>>(), vec!["even:2"]);
    Ok(())
}

// ===========================================================================
// Flows and synced marks
// ===========================================================================

#[tokio::test]
async fn records_in_different_flows_never_join() -> Result<()> {
    let f = Fixture::new()?;
    let (clicked, record) = (f.clicked.clone(), f.record.clone());
    f.engine.register(Syncs::new().add("BothKinds", move |_| {
        SyncDeclaration::new()
            .when(ActionPattern::new(&clicked).input("kind", "a").completed())
            .when(ActionPattern::new(&clicked).input("kind", "b").completed())
            .then(ActionPattern::new(&record).input("tag", "joined"))
    }))?;

    f.clicked.invoke(Invocation::new(click("a")).in_flow("one")).await?;
    f.clicked.invoke(Invocation::new(click("b")).in_flow("two")).await?;
    assert!(f.recorder.order().is_empty());

    f.clicked.invoke(Invocation::new(click("b")).in_flow("one")).await?;
    assert_eq!(f.recorder.order(), vec!["joined"]);

    let joined = f.records_of(&f.record);
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].flow, "one");
    Ok(())
}

#[tokio::test]
async fn then_records_join_the_triggering_flow_and_mark_evidence() -> Result<()> {
    let f = Fixture::new()?;
    f.register_demo()?;

    f.clicked
        .invoke(Invocation::new(click("inc")).in_flow("traced").with_id("click-1"))
        .await?;

    let records = f.engine.ledger().by_flow("traced");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, "click-1");
    assert_eq!(records[1].action, *f.increment.action_ref());
    assert_eq!(
        records[0].synced.get(BUTTON_INCREMENTS).map(String::as_str),
        Some(records[1].id.as_str())
    );
    assert!(!records[0].is_synced_by(NOTIFY_ON_3));
    Ok(())
}

#[tokio::test]
async fn synchronizing_a_synced_record_again_fires_nothing() -> Result<()> {
    let f = Fixture::new()?;
    f.register_demo()?;

    f.clicked.call(click("inc")).await?;
    let clicks = f.records_of(&f.clicked);
    assert_eq!(clicks.len(), 1);

    f.engine.synchronize(&clicks[0]).await?;
    f.engine.synchronize(&clicks[0]).await?;

    assert_eq!(f.counter.count(), 1);
    assert_eq!(f.records_of(&f.increment).len(), 1);
    Ok(())
}

#[tokio::test]
async fn disjoint_combinations_yield_distinct_consequents() -> Result<()> {
    let f = Fixture::new()?;
    let (clicked, record) = (f.clicked.clone(), f.record.clone());
    f.engine.register(Syncs::new().add("Pair", move |_| {
        SyncDeclaration::new()
            .when(ActionPattern::new(&clicked).input("kind", "pair").completed())
            .then(ActionPattern::new(&record).input("tag", "paired"))
    }))?;

    for _ in 0..2 {
        f.clicked.invoke(Invocation::new(click("pair")).in_flow("pairs")).await?;
    }

    let clicks = f.records_of(&f.clicked);
    let then_ids: Vec<&str> = clicks
        .iter()
        .filter_map(|r| r.synced.get("Pair").map(String::as_str))
        .collect();
    assert_eq!(then_ids.len(), 2);
    assert_ne!(then_ids[0], then_ids[1]);
    assert_eq!(f.recorder.order(), vec!["paired", "paired"]);
    Ok(())
}

#[tokio::test]
async fn reused_id_in_a_new_flow_fires_there() -> Result<()> {
    let f = Fixture::new()?;
    let (clicked, record) = (f.clicked.clone(), f.record.clone());
    f.engine.register(Syncs::new().add("Pair", move |_| {
        SyncDeclaration::new()
            .when(ActionPattern::new(&clicked).input("kind", "pair").completed())
            .then(ActionPattern::new(&record).input("tag", "paired"))
    }))?;

    f.clicked
        .invoke(Invocation::new(click("pair")).in_flow("first").with_id("dup"))
        .await?;
    f.clicked
        .invoke(Invocation::new(click("pair")).in_flow("second").with_id("dup"))
        .await?;

    assert_eq!(f.recorder.order(), vec!["paired", "paired"]);
    let ledger = f.engine.ledger();
    assert!(ledger.by_flow("first").iter().all(|r| r.flow == "first" && r.id != "dup"));
    let second = ledger.by_flow("second");
    assert_eq!(second[0].id, "dup");
    assert!(second[0].is_synced_by("Pair"));
    assert_eq!(second.len(), 2);
    Ok(())
}

// ===========================================================================
// Where clauses
// ===========================================================================

#[tokio::test]
async fn collect_as_groups_query_rows_into_one_firing() -> Result<()> {
    let f = Fixture::new()?;
    seeded_list(&f, &["a", "b", "c"]).await?;

    let (clicked, record, items) = (f.clicked.clone(), f.record.clone(), f.items.clone());
    f.engine.register(Syncs::new().add("Digest", move |vars| {
        let [item, all] = vars.vars(["item", "all"]);
        let then_all = all.clone();
        SyncDeclaration::new()
            .when(ActionPattern::new(&clicked).input("kind", "digest").completed())
            .where_async(move |frames: Frames| {
                let (items, item, all) = (items.clone(), item.clone(), all.clone());
                async move {
                    let frames = frames.query(&items, Fields::new(), &[("item", &item)]).await?;
                    Ok::<_, anyhow::Error>(frames.collect_as(&[item.clone()], &all))
                }
            })
            .then(ActionPattern::new(&record).input("tag", &then_all))
    }))?;

    f.clicked.call(click("digest")).await?;

    let order = f.recorder.order();
    assert_eq!(order.len(), 1);
    let digest: Value = serde_json::from_str(&order[0])?;
    assert_eq!(digest, json!([{ "item": "a" }, { "item": "b" }, { "item": "c" }]));
    Ok(())
}

#[tokio::test]
async fn where_errors_reach_the_original_caller() -> Result<()> {
    let f = Fixture::new()?;
    let (clicked, record) = (f.clicked.clone(), f.record.clone());
    f.engine.register(Syncs::new().add("Broken", move |_| {
        SyncDeclaration::new()
            .when(ActionPattern::new(&clicked).input("kind", "boom").completed())
            .where_async(|_frames: Frames| async { Err(anyhow::anyhow!("lookup failed")) })
            .then(ActionPattern::new(&record).input("tag", "never"))
    }))?;

    let err = f.clicked.call(click("boom")).await.unwrap_err();
    assert_eq!(err.to_string(), "lookup failed");
    assert!(f.recorder.order().is_empty());
    Ok(())
}

// ===========================================================================
// Configuration errors
// ===========================================================================

#[tokio::test]
async fn where_that_drops_record_markers_is_rejected() -> Result<()> {
    let f = Fixture::new()?;
    let (clicked, record) = (f.clicked.clone(), f.record.clone());
    f.engine.register(Syncs::new().add("Rebuilt", move |_| {
        SyncDeclaration::new()
            .when(ActionPattern::new(&clicked).input("kind", "rebuild").completed())
            .where_frames(|frames| {
                frames.map(|frame| {
                    let flow = frame.get(flow_key()).cloned().unwrap_or(Value::Null);
                    Frame::new().bind(flow_key(), flow)
                })
            })
            .then(ActionPattern::new(&record).input("tag", "never"))
    }))?;

    let err = f.clicked.call(click("rebuild")).await.unwrap_err();
    assert!(matches!(sync_error(&err), SyncError::MissingActionMarker(ref sync) if sync == "Rebuilt"));
    assert!(f.recorder.order().is_empty());
    Ok(())
}

#[tokio::test]
async fn when_without_output_pattern_is_rejected() -> Result<()> {
    let f = Fixture::new()?;
    let (clicked, record) = (f.clicked.clone(), f.record.clone());
    f.engine.register(Syncs::new().add("NoOutput", move |_| {
        SyncDeclaration::new()
            .when(ActionPattern::new(&clicked).input("kind", "inc"))
            .then(ActionPattern::new(&record).input("tag", "never"))
    }))?;

    let err = f.clicked.call(click("inc")).await.unwrap_err();
    assert!(matches!(sync_error(&err), SyncError::MissingOutputPattern { .. }));
    Ok(())
}

#[tokio::test]
async fn unbound_then_key_is_rejected() -> Result<()> {
    let f = Fixture::new()?;
    let (clicked, record) = (f.clicked.clone(), f.record.clone());
    f.engine.register(Syncs::new().add("Unbound", move |vars| {
        let [missing] = vars.vars(["missing"]);
        SyncDeclaration::new()
            .when(ActionPattern::new(&clicked).input("kind", "inc").completed())
            .then(ActionPattern::new(&record).input("tag", &missing))
    }))?;

    let err = f.clicked.call(click("inc")).await.unwrap_err();
    assert!(matches!(sync_error(&err), SyncError::UnboundVariable { .. }));
    assert!(f.recorder.order().is_empty());
    Ok(())
}

#[tokio::test]
async fn actions_from_another_engine_are_rejected() -> Result<()> {
    let f = Fixture::new()?;
    let other = Fixture::new()?;
    let (clicked, record) = (f.clicked.clone(), other.record.clone());

    let err = f
        .engine
        .register(Syncs::new().add("Foreign", move |_| {
            SyncDeclaration::new()
                .when(ActionPattern::new(&clicked).completed())
                .then(ActionPattern::new(&record))
        }))
        .unwrap_err();

    assert!(matches!(err, SyncError::NotInstrumented(_)));
    assert!(f.engine.syncs_for(&f.clicked).is_empty());
    Ok(())
}

#[tokio::test]
async fn duplicate_sync_names_are_rejected() -> Result<()> {
    let f = Fixture::new()?;
    f.register_demo()?;

    let err = f.register_demo().unwrap_err();
    assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::DuplicateSync(_))));
    assert_eq!(f.engine.syncs_for(&f.increment), vec![NOTIFY_ON_3.to_string()]);
    Ok(())
}

struct MisnamedConcept;

impl Concept for MisnamedConcept {
    fn name(&self) -> &str {
        "Misnamed"
    }

    fn methods(self: Arc<Self>, methods: &mut Methods) {
        methods.action("_secret", |input| Ok(input));
    }
}

#[test]
fn query_prefixed_action_is_rejected() {
    let engine = SyncEngine::default();
    let err = engine.instrument(Arc::new(MisnamedConcept)).unwrap_err();
    assert!(matches!(err, SyncError::MethodNaming { ref name, .. } if name == "_secret"));
}

#[tokio::test]
async fn dropped_engine_is_reported() -> Result<()> {
    let engine = SyncEngine::default();
    let clicked = engine.instrument(Arc::new(ButtonConcept))?.action("clicked")?;
    drop(engine);

    let err = clicked.call(click("inc")).await.unwrap_err();
    assert!(matches!(sync_error(&err), SyncError::EngineDropped(_)));
    Ok(())
}

// ===========================================================================
// Instrumentation
// ===========================================================================

#[tokio::test]
async fn instrumentation_is_memoized_per_concept() -> Result<()> {
    let f = Fixture::new()?;

    let again = f.engine.instrument(f.counter.clone())?;
    assert!(again.action("increment")?.ptr_eq(&f.increment));
    assert!(again.query("_getCount")?.ptr_eq(&f.get_count));

    let unknown = again.action("reset").unwrap_err();
    assert!(matches!(unknown, SyncError::UnknownMethod { kind: "action", .. }));
    Ok(())
}

#[tokio::test]
async fn queries_are_never_recorded() -> Result<()> {
    let f = Fixture::new()?;
    f.register_demo()?;
    f.clicked.call(click("inc")).await?;
    let before = f.engine.ledger().len();

    let rows = f.get_count.call(Mapping::new()).await?;

    assert_eq!(rows, vec![mapping(json!({ "count": 1 }))]);
    assert_eq!(f.engine.ledger().len(), before);
    assert_eq!(f.get_count.name(), "Counter._getCount");
    Ok(())
}

#[tokio::test]
async fn caller_receives_the_raw_output() -> Result<()> {
    let f = Fixture::with_config(EngineConfig::default().with_logging(Logging::Verbose))?;
    f.register_demo()?;

    let output = f.clicked.call(click("inc")).await?;

    assert_eq!(output, click("inc"));
    assert_eq!(f.counter.count(), 1);
    Ok(())
}

#[tokio::test]
async fn nested_syncs_are_registered_under_qualified_names() -> Result<()> {
    let f = Fixture::new()?;
    let nested = demo_syncs(&f);
    let total = nested.len();

    f.engine.register(Syncs::new().nest("Demo", nested))?;

    assert_eq!(
        f.engine.syncs_for(&f.increment),
        vec![format!("Demo.{NOTIFY_ON_3}")]
    );
    assert_eq!(total, 6);

    f.clicked.call(click("inc")).await?;
    let clicks = f.records_of(&f.clicked);
    assert!(clicks[0].is_synced_by(&format!("Demo.{BUTTON_INCREMENTS}")));
    Ok(())
}
