use std::{collections::BTreeSet, process, time::Duration};

use bytes::Bytes;
use serde::Serialize;
use tagstash::{
    cache::{
        CacheConfig, CacheEntry, CacheHandler, EntryClass, GenerationOutcome, LookupHints,
        NewEntry, Payload, request_tags,
    },
    config::{self, ClearArgs, Command, KeyArgs, PutArgs, TagsArgs},
    infra::{error::InfraError, telemetry},
    util::clock::format_ms,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "command failed");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "command failed");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let handler = CacheHandler::open(&CacheConfig::from(&settings))?;
    let result = dispatch(&handler, cli_args.command).await;
    handler.shutdown().await;
    result
}

async fn dispatch(handler: &CacheHandler, command: Command) -> Result<(), InfraError> {
    match command {
        Command::Stats => print_json(&handler.stats().await),
        Command::Get(args) => run_get(handler, args).await,
        Command::Put(args) => run_put(handler, args).await,
        Command::Delete(args) => {
            let deleted = handler.delete(&args.key, class_of(&args)).await;
            print_json(&serde_json::json!({ "key": args.key, "deleted": deleted }))
        }
        Command::Revalidate(TagsArgs { tags }) => {
            let deleted = handler.revalidate_by_tag(&tags).await;
            print_json(&serde_json::json!({ "tags": tags, "deleted": deleted }))
        }
        Command::ExpireTags(TagsArgs { tags }) => {
            handler.update_tags(&tags).await;
            info!(tags = ?tags, "Tags marked expired");
            Ok(())
        }
        Command::Expiration(TagsArgs { tags }) => {
            let at = handler.expiration_for_tags(&tags).await;
            let formatted = (at > 0).then(|| format_ms(at));
            print_json(&serde_json::json!({ "tags": tags, "expired_at": at, "formatted": formatted }))
        }
        Command::Clear(ClearArgs { preserve }) => {
            let preserve: BTreeSet<String> = preserve.into_iter().collect();
            let cleared = handler.clear_all(&preserve).await;
            print_json(&serde_json::json!({ "cleared": cleared, "preserved": preserve }))
        }
        Command::CheckGeneration => {
            let outcome = handler.check_generation().await;
            print_json(&GenerationReport::from(outcome))
        }
    }
}

async fn run_get(handler: &CacheHandler, args: KeyArgs) -> Result<(), InfraError> {
    let class = class_of(&args);
    let (entry, seen_tags) =
        request_tags::run(handler.get(&args.key, class, &LookupHints::default())).await;

    match entry {
        Some(entry) => print_json(&EntryReport::new(&entry, seen_tags)),
        None => print_json(&serde_json::json!({ "key": args.key, "class": class, "found": false })),
    }
}

async fn run_put(handler: &CacheHandler, args: PutArgs) -> Result<(), InfraError> {
    let data = tokio::fs::read(&args.file).await?;
    let size = data.len();
    let mut entry = NewEntry::new(Payload::Binary(Bytes::from(data))).with_tags(args.tags);
    if let Some(secs) = args.revalidate_secs {
        entry = entry.revalidate_after(Duration::from_secs(secs));
    }

    let class = class_of(&args.target);
    let stored = handler.set(&args.target.key, class, entry).await;
    print_json(&serde_json::json!({
        "key": args.target.key,
        "class": class,
        "bytes": size,
        "stored": stored,
    }))
}

fn class_of(args: &KeyArgs) -> EntryClass {
    if args.durable {
        EntryClass::Durable
    } else {
        EntryClass::Ephemeral
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), InfraError> {
    let out = serde_json::to_string_pretty(value)?;
    println!("{out}");
    Ok(())
}

#[derive(Serialize)]
struct EntryReport<'a> {
    key: &'a str,
    class: EntryClass,
    found: bool,
    payload: &'static str,
    tags: &'a BTreeSet<String>,
    created_at: String,
    request_tags: BTreeSet<String>,
}

impl<'a> EntryReport<'a> {
    fn new(entry: &'a CacheEntry, request_tags: BTreeSet<String>) -> Self {
        Self {
            key: &entry.key,
            class: entry.class,
            found: true,
            payload: entry.payload.kind(),
            tags: &entry.tags,
            created_at: format_ms(entry.timing.created_at),
            request_tags,
        }
    }
}

#[derive(Serialize)]
struct GenerationReport {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    wiped: Vec<String>,
}

impl From<GenerationOutcome> for GenerationReport {
    fn from(outcome: GenerationOutcome) -> Self {
        let (outcome, previous, wiped) = match outcome {
            GenerationOutcome::Skipped => ("skipped", None, Vec::new()),
            GenerationOutcome::FirstRun => ("first_run", None, Vec::new()),
            GenerationOutcome::Unchanged => ("unchanged", None, Vec::new()),
            GenerationOutcome::Changed { previous, wiped } => ("changed", previous, wiped),
            GenerationOutcome::Unavailable => ("unavailable", None, Vec::new()),
        };
        Self {
            outcome,
            previous,
            wiped,
        }
    }
}
