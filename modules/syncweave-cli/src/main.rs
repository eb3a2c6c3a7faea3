//! `syncweave`: run the demo rule set against in-memory concepts and print
//! the resulting ledger, one flow at a time.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use syncweave_engine::testing::Fixture;
use syncweave_engine::{mapping, ActionRecord, EngineConfig, Invocation, Logging};

#[derive(Parser)]
#[command(name = "syncweave")]
#[command(about = "Declarative sync engine playground")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario and print every flow's action trace
    Run {
        scenario: Scenario,

        /// Number of externally triggered clicks
        #[arg(long, default_value_t = 3)]
        clicks: usize,

        /// off, trace or verbose
        #[arg(long, env = "SYNC_LOGGING")]
        logging: Option<Logging>,

        /// Max concurrent query calls per frame set
        #[arg(long, env = "SYNC_QUERY_CONCURRENCY")]
        query_concurrency: Option<usize>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Scenario {
    /// Clicks in one shared flow, each incrementing the counter
    Counter,
    /// Clicks in separate flows; a notification after the third increment
    Notify,
    /// Each click records once per list item
    Fanout,
    /// Same as fanout, through an async query
    FanoutAsync,
    /// One record chaining into `:a` and `:done`
    Chain,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            scenario,
            clicks,
            logging,
            query_concurrency,
        } => {
            let mut config = EngineConfig::from_env()?;
            if let Some(logging) = logging {
                config = config.with_logging(logging);
            }
            if let Some(limit) = query_concurrency {
                config = config.with_query_concurrency(limit);
            }

            let level = if config.logging == Logging::Verbose { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::from_default_env().add_directive(format!("syncweave={level}").parse()?),
                )
                .init();

            config.log_summary();
            run(scenario, clicks, config).await
        }
    }
}

async fn run(scenario: Scenario, clicks: usize, config: EngineConfig) -> Result<()> {
    let f = Fixture::with_config(config)?;
    f.register_demo()?;
    info!(?scenario, clicks, "Running scenario");

    match scenario {
        Scenario::Counter => {
            for _ in 0..clicks {
                f.clicked
                    .invoke(Invocation::new(mapping(json!({ "kind": "inc" }))).in_flow("counter"))
                    .await?;
            }
        }
        Scenario::Notify => {
            for _ in 0..clicks {
                f.clicked.call(mapping(json!({ "kind": "inc" }))).await?;
            }
        }
        Scenario::Fanout | Scenario::FanoutAsync => {
            for item in ["1", "2", "3"] {
                f.add.call(mapping(json!({ "item": item }))).await?;
            }
            let kind = match scenario {
                Scenario::FanoutAsync => "fanout-async",
                _ => "fanout",
            };
            for _ in 0..clicks {
                f.clicked.call(mapping(json!({ "kind": kind }))).await?;
            }
        }
        Scenario::Chain => {
            f.record.call(mapping(json!({ "tag": "x" }))).await?;
        }
    }

    let ledger = f.engine.ledger();
    for flow in ledger.flows() {
        println!("flow {flow}");
        for record in ledger.by_flow(&flow) {
            println!("  {}", describe(&record));
        }
    }

    println!();
    println!("count         {}", f.counter.count());
    println!("notifications {:?}", f.notification.messages());
    println!("recorded      {:?}", f.recorder.order());
    info!(records = ledger.len(), flows = ledger.flows().len(), "Scenario complete");
    Ok(())
}

fn describe(record: &ActionRecord) -> String {
    let output = record
        .output
        .clone()
        .map(Value::Object)
        .unwrap_or(Value::Null);
    let mut line = format!("{} {} => {}", record.action, Value::Object(record.input.clone()), output);
    if !record.synced.is_empty() {
        let marks: Vec<String> = record
            .synced
            .iter()
            .map(|(sync, then_id)| format!("{sync}->{}", short_id(then_id)))
            .collect();
        line.push_str(&format!("  [synced: {}]", marks.join(", ")));
    }
    line
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
