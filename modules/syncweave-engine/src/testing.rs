// Test concepts and rules for the sync engine.
//
// Five small in-memory concepts, each behind a Mutex or atomic:
// - ButtonConcept: externally triggered clicks
// - CounterConcept: increment/decrement plus a `_getCount` query
// - NotificationConcept: collected messages
// - ListConcept: a seeded list with sync and async item queries
// - RecorderConcept: an ordered trace of recorded tags
//
// Plus `Fixture`, which instruments all five on one engine, and
// `demo_syncs`, the rules exercised by the integration tests and the CLI.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::{json, Value};

use crate::concept::{Action, Concept, Methods, Query};
use crate::config::EngineConfig;
use crate::engine::{SyncDeclaration, SyncEngine, Syncs};
use crate::frames::Frames;
use crate::pattern::{mapping, ActionPattern, Fields};
use crate::vars::Vars;
use crate::{ActionRecord, Mapping};

/// Message the `NotifyOn3` rule sends.
pub const THRESHOLD_MESSAGE: &str = "reached 3";

pub const BUTTON_INCREMENTS: &str = "ButtonIncrements";
pub const NOTIFY_ON_3: &str = "NotifyOn3";
pub const FANOUT_OVER_LIST: &str = "FanoutOverList";
pub const FANOUT_OVER_LIST_ASYNC: &str = "FanoutOverListAsync";
pub const CHAIN_RECORD_A: &str = "ChainRecordA";
pub const PREVENT_DOUBLE_FIRE: &str = "PreventDoubleFire";

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn field_text(input: &Mapping, key: &str) -> String {
    input.get(key).map(value_text).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// ButtonConcept
// ---------------------------------------------------------------------------

/// `clicked({kind}) -> {kind}`. No state.
pub struct ButtonConcept;

impl Concept for ButtonConcept {
    fn name(&self) -> &str {
        "Button"
    }

    fn methods(self: Arc<Self>, methods: &mut Methods) {
        methods.action("clicked", |input| {
            Ok(mapping(json!({ "kind": field_text(&input, "kind") })))
        });
    }
}

// ---------------------------------------------------------------------------
// CounterConcept
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CounterConcept {
    count: AtomicI64,
}

impl CounterConcept {
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Concept for CounterConcept {
    fn name(&self) -> &str {
        "Counter"
    }

    fn methods(self: Arc<Self>, methods: &mut Methods) {
        let this = self.clone();
        methods.action("increment", move |_| {
            let count = this.count.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(mapping(json!({ "count": count })))
        });

        let this = self.clone();
        methods.action("decrement", move |_| {
            let count = this.count.fetch_sub(1, Ordering::SeqCst) - 1;
            Ok(mapping(json!({ "count": count })))
        });

        let this = self;
        methods.query("_getCount", move |_| {
            Ok(vec![mapping(json!({ "count": this.count() }))])
        });
    }
}

// ---------------------------------------------------------------------------
// NotificationConcept
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct NotificationConcept {
    messages: Mutex<Vec<String>>,
}

impl NotificationConcept {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl Concept for NotificationConcept {
    fn name(&self) -> &str {
        "Notification"
    }

    fn methods(self: Arc<Self>, methods: &mut Methods) {
        let this = self.clone();
        methods.action("notify", move |input| {
            let message = field_text(&input, "message");
            let mut messages = this.messages.lock().unwrap();
            messages.push(message.clone());
            Ok(mapping(json!({ "message": message, "sent": messages.len() })))
        });

        let this = self;
        methods.query("_getMessages", move |_| {
            Ok(this
                .messages()
                .into_iter()
                .map(|message| mapping(json!({ "message": message })))
                .collect())
        });
    }
}

// ---------------------------------------------------------------------------
// ListConcept
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ListConcept {
    items: Mutex<Vec<String>>,
}

impl ListConcept {
    pub fn with_items<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            items: Mutex::new(items.into_iter().map(Into::into).collect()),
        }
    }

    pub fn items(&self) -> Vec<String> {
        self.items.lock().unwrap().clone()
    }

    fn item_rows(&self) -> Vec<Mapping> {
        self.items()
            .into_iter()
            .map(|item| mapping(json!({ "item": item })))
            .collect()
    }
}

impl Concept for ListConcept {
    fn name(&self) -> &str {
        "List"
    }

    fn methods(self: Arc<Self>, methods: &mut Methods) {
        let this = self.clone();
        methods.action("add", move |input| {
            let item = field_text(&input, "item");
            let mut items = this.items.lock().unwrap();
            items.push(item.clone());
            Ok(mapping(json!({ "item": item, "size": items.len() })))
        });

        let this = self.clone();
        methods.action("clear", move |_| {
            let mut items = this.items.lock().unwrap();
            let cleared = items.len();
            items.clear();
            Ok(mapping(json!({ "cleared": cleared })))
        });

        let this = self.clone();
        methods.query("_items", move |_| Ok(this.item_rows()));

        let this = self;
        methods.query_async("_itemsAsync", move |_| {
            let this = this.clone();
            async move {
                tokio::task::yield_now().await;
                Ok(this.item_rows())
            }
        });
    }
}

// ---------------------------------------------------------------------------
// RecorderConcept
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecorderConcept {
    order: Mutex<Vec<String>>,
}

impl RecorderConcept {
    pub fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

impl Concept for RecorderConcept {
    fn name(&self) -> &str {
        "Recorder"
    }

    fn methods(self: Arc<Self>, methods: &mut Methods) {
        let this = self.clone();
        methods.action("record", move |input| {
            let tag = field_text(&input, "tag");
            this.order.lock().unwrap().push(tag.clone());
            Ok(mapping(json!({ "tag": tag })))
        });

        let this = self;
        methods.query("_getOrder", move |_| {
            Ok(this
                .order()
                .into_iter()
                .map(|tag| mapping(json!({ "tag": tag })))
                .collect())
        });
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

/// One engine with every test concept instrumented.
pub struct Fixture {
    pub engine: SyncEngine,

    pub button: Arc<ButtonConcept>,
    pub counter: Arc<CounterConcept>,
    pub notification: Arc<NotificationConcept>,
    pub list: Arc<ListConcept>,
    pub recorder: Arc<RecorderConcept>,

    pub clicked: Action,
    pub increment: Action,
    pub decrement: Action,
    pub notify: Action,
    pub add: Action,
    pub clear: Action,
    pub record: Action,

    pub get_count: Query,
    pub get_messages: Query,
    pub items: Query,
    pub items_async: Query,
    pub get_order: Query,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let engine = SyncEngine::new(config);

        let button = Arc::new(ButtonConcept);
        let counter = Arc::new(CounterConcept::default());
        let notification = Arc::new(NotificationConcept::default());
        let list = Arc::new(ListConcept::default());
        let recorder = Arc::new(RecorderConcept::default());

        let button_i = engine.instrument(button.clone())?;
        let counter_i = engine.instrument(counter.clone())?;
        let notification_i = engine.instrument(notification.clone())?;
        let list_i = engine.instrument(list.clone())?;
        let recorder_i = engine.instrument(recorder.clone())?;

        Ok(Self {
            clicked: button_i.action("clicked")?,
            increment: counter_i.action("increment")?,
            decrement: counter_i.action("decrement")?,
            notify: notification_i.action("notify")?,
            add: list_i.action("add")?,
            clear: list_i.action("clear")?,
            record: recorder_i.action("record")?,
            get_count: counter_i.query("_getCount")?,
            get_messages: notification_i.query("_getMessages")?,
            items: list_i.query("_items")?,
            items_async: list_i.query("_itemsAsync")?,
            get_order: recorder_i.query("_getOrder")?,
            engine,
            button,
            counter,
            notification,
            list,
            recorder,
        })
    }

    /// Register [`demo_syncs`] on this fixture's engine.
    pub fn register_demo(&self) -> Result<()> {
        self.engine.register(demo_syncs(self))?;
        Ok(())
    }

    /// Every record in the ledger for `action`, across all flows.
    pub fn records_of(&self, action: &Action) -> Vec<ActionRecord> {
        let ledger = self.engine.ledger();
        ledger
            .flows()
            .iter()
            .flat_map(|flow| ledger.by_flow(flow))
            .filter(|record| record.action == *action.action_ref())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// The demo rule set:
///
/// - `ButtonIncrements`: `Button.clicked{kind:"inc"}` → `Counter.increment`
/// - `NotifyOn3`: click + increment, where the count is 3 → `Notification.notify`
/// - `FanoutOverList` / `FanoutOverListAsync`: click → one `Recorder.record{tag:"v:item"}` per list item
/// - `ChainRecordA`: a base tag `t` → `Recorder.record{tag: "t:a"}`
/// - `PreventDoubleFire`: `t` and `t:a` both recorded → `Recorder.record{tag: "t:done"}`
pub fn demo_syncs(f: &Fixture) -> Syncs {
    let (clicked, increment, notify, record) = (
        f.clicked.clone(),
        f.increment.clone(),
        f.notify.clone(),
        f.record.clone(),
    );
    let (get_count, items, items_async) = (f.get_count.clone(), f.items.clone(), f.items_async.clone());

    Syncs::new()
        .add(BUTTON_INCREMENTS, {
            let (clicked, increment) = (clicked.clone(), increment.clone());
            move |_| {
                SyncDeclaration::new()
                    .when(ActionPattern::new(&clicked).input("kind", "inc").completed())
                    .then(ActionPattern::new(&increment))
            }
        })
        .add(NOTIFY_ON_3, {
            let (clicked, increment) = (clicked.clone(), increment.clone());
            move |vars| {
                let [count] = vars.vars(["count"]);
                SyncDeclaration::new()
                    .when(ActionPattern::new(&clicked).input("kind", "inc").completed())
                    .when(ActionPattern::new(&increment).completed())
                    .where_async(move |frames: Frames| {
                        let (get_count, count) = (get_count.clone(), count.clone());
                        async move {
                            let frames = frames.query(&get_count, Fields::new(), &[("count", &count)]).await?;
                            Ok::<_, anyhow::Error>(frames.filter(|frame| frame.get(&count) == Some(&json!(3))))
                        }
                    })
                    .then(ActionPattern::new(&notify).input("message", THRESHOLD_MESSAGE))
            }
        })
        .add(FANOUT_OVER_LIST, fanout(&clicked, &record, items, "fanout"))
        .add(FANOUT_OVER_LIST_ASYNC, fanout(&clicked, &record, items_async, "fanout-async"))
        .add(CHAIN_RECORD_A, {
            let record = record.clone();
            move |vars| {
                let [base, derived] = vars.vars(["base", "derived"]);
                let then_derived = derived.clone();
                SyncDeclaration::new()
                    .when(ActionPattern::new(&record).input("tag", &base).completed())
                    .where_frames(move |frames| {
                        frames
                            .filter(|frame| frame.str(&base).is_some_and(|tag| !tag.contains(':')))
                            .map(|frame| {
                                let tag = format!("{}:a", frame.str(&base).unwrap_or_default());
                                frame.bind(&derived, tag)
                            })
                    })
                    .then(ActionPattern::new(&record).input("tag", &then_derived))
            }
        })
        .add(PREVENT_DOUBLE_FIRE, move |vars| {
            let [base, derived, done] = vars.vars(["base", "derived", "done"]);
            let then_done = done.clone();
            SyncDeclaration::new()
                .when(ActionPattern::new(&record).input("tag", &base).completed())
                .when(ActionPattern::new(&record).input("tag", &derived).completed())
                .where_frames(move |frames| {
                    frames
                        .filter(|frame| match (frame.str(&base), frame.str(&derived)) {
                            (Some(base), Some(derived)) => !base.contains(':') && derived == format!("{base}:a"),
                            _ => false,
                        })
                        .map(|frame| {
                            let tag = format!("{}:done", frame.str(&base).unwrap_or_default());
                            frame.bind(&done, tag)
                        })
                })
                .then(ActionPattern::new(&record).input("tag", &then_done))
        })
}

fn fanout(
    clicked: &Action,
    record: &Action,
    items: Query,
    kind: &'static str,
) -> impl FnOnce(&Vars) -> SyncDeclaration + Send + 'static {
    let (clicked, record) = (clicked.clone(), record.clone());
    move |vars| {
        let [item, tag] = vars.vars(["item", "tag"]);
        let then_tag = tag.clone();
        SyncDeclaration::new()
            .when(ActionPattern::new(&clicked).input("kind", kind).completed())
            .where_async(move |frames: Frames| {
                let (items, item, tag) = (items.clone(), item.clone(), tag.clone());
                async move {
                    let frames = frames.query(&items, Fields::new(), &[("item", &item)]).await?;
                    Ok::<_, anyhow::Error>(frames.map(|frame| {
                        let value = frame.get(&item).map(value_text).unwrap_or_default();
                        frame.bind(&tag, format!("v:{value}"))
                    }))
                }
            })
            .then(ActionPattern::new(&record).input("tag", &then_tag))
    }
}
