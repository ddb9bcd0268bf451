use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use image::DynamicImage;
use serde_json::{json, Map, Value};
use stockscan_contracts::detection::{
    filter_by_confidence, format_search, format_summary, search_detections, Detection,
};
use stockscan_contracts::inventory::{search_items, JsonFileStore, NewInventoryItem};
use stockscan_contracts::journal::ActivityJournal;
use stockscan_contracts::models::{ModelRegistry, ModelSelection, ModelSelector, CAPABILITY_VISION};
use stockscan_engine::config::{parse_model_list, timeout_from_seconds, EngineConfig};
use stockscan_engine::imaging::{prepare_image, save_annotated, Annotator, MAX_UPLOAD_WIDTH};
use stockscan_engine::{
    load_image, AttributeExtractionAdapter, Detector, FixtureDetector, FullFrameDetector,
    GeminiClient, MatchStrategy, RecognitionPipeline, ResilientGenerationCaller, Services,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stockscan", version, about = "Photo-based inventory recognition")]
struct Cli {
    /// Inventory store file (JSON).
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Append activity events to this JSONL file.
    #[arg(long, global = true)]
    journal: Option<PathBuf>,
    /// Model to try, in order; repeat to build the fallback list.
    #[arg(long = "model", global = true)]
    models: Vec<String>,
    /// Per-request deadline in seconds.
    #[arg(long, global = true)]
    timeout: Option<f64>,
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the raw attribute JSON the vision model returns for an image.
    Attributes(ImageArgs),
    /// Detect regions and identify each one against the inventory.
    Analyze(AnalyzeArgs),
    /// Identify the whole image against the inventory.
    Identify(IdentifyArgs),
    /// Extract attributes and store the image as a new inventory item.
    Register(RegisterArgs),
    /// Summarise detector output without calling the vision model.
    Detect(DetectArgs),
    /// Show the resolved model fallback list.
    Models,
    #[command(subcommand)]
    Inventory(InventoryCommand),
}

#[derive(Debug, Args)]
struct ImageArgs {
    #[arg(long)]
    image: PathBuf,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    #[arg(long)]
    image: PathBuf,
    /// JSON array of detections; the whole image is one region when omitted.
    #[arg(long)]
    detections: Option<PathBuf>,
    #[arg(long, default_value_t = 0.5)]
    min_confidence: f32,
    #[arg(long, default_value = "remote-then-local")]
    strategy: MatchStrategy,
    /// Label to highlight in the annotated image.
    #[arg(long)]
    search: Option<String>,
    /// Write a copy of the image with the kept regions outlined.
    #[arg(long)]
    annotate: Option<PathBuf>,
    /// Font file for label text on the annotated image.
    #[arg(long, requires = "annotate")]
    label_font: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct IdentifyArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value = "remote-then-local")]
    strategy: MatchStrategy,
}

#[derive(Debug, Args)]
struct RegisterArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    name: String,
    /// Custom identifier; refused if already taken.
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    quantity: Option<u64>,
}

#[derive(Debug, Args)]
struct DetectArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    detections: PathBuf,
    #[arg(long, default_value_t = 0.5)]
    min_confidence: f32,
    /// Label to look for among the detections.
    #[arg(long)]
    search: Option<String>,
    /// Write a copy of the image with the detections outlined and matches highlighted.
    #[arg(long)]
    annotate: Option<PathBuf>,
    /// Font file for label text on the annotated image.
    #[arg(long, requires = "annotate")]
    label_font: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum InventoryCommand {
    List {
        /// Case-insensitive name filter.
        #[arg(long)]
        search: Option<String>,
    },
    Show {
        id: String,
    },
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        quantity: Option<u64>,
        #[arg(long)]
        analysis: Option<String>,
    },
    Update {
        id: String,
        /// `key=value`; values are parsed as JSON, falling back to plain text.
        #[arg(long = "set", required = true)]
        fields: Vec<String>,
    },
    Remove {
        id: String,
    },
    /// Journal entries about one item, across sessions.
    History {
        id: String,
    },
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("stockscan error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    execute(cli)
}

fn execute(cli: Cli) -> Result<i32> {
    let config = resolve_config(&cli)?;

    match cli.command {
        Command::Attributes(args) => {
            let adapter = vision_adapter(&config)?;
            let image = load_image(&args.image)?;
            let payload = prepare_image(&image, MAX_UPLOAD_WIDTH)?;
            println!("{}", adapter.extract(&payload));
            Ok(0)
        }
        Command::Analyze(args) => {
            let services = open_services(&config)?;
            let pipeline = RecognitionPipeline::new(services, vision_adapter(&config)?)
                .with_strategy(args.strategy);
            let image = load_image(&args.image)?;
            let detector: Box<dyn Detector> = match &args.detections {
                Some(path) => Box::new(FixtureDetector::from_file(path)?),
                None => Box::new(FullFrameDetector),
            };
            let regions = pipeline.analyze_regions(&image, detector.as_ref(), args.min_confidence)?;
            let rows: Vec<Value> = regions
                .iter()
                .map(|region| {
                    json!({
                        "detection": region.detection,
                        "identification": region
                            .identification
                            .as_ref()
                            .map(|found| found.to_value()),
                    })
                })
                .collect();
            print_json(&Value::Array(rows))?;
            if let Some(path) = &args.annotate {
                let detections: Vec<Detection> =
                    regions.into_iter().map(|region| region.detection).collect();
                let target = AnnotationTarget {
                    path,
                    label_font: args.label_font.as_deref(),
                };
                target.write(&image, &detections, args.search.as_deref())?;
            }
            Ok(0)
        }
        Command::Identify(args) => {
            let services = open_services(&config)?;
            let pipeline = RecognitionPipeline::new(services, vision_adapter(&config)?)
                .with_strategy(args.strategy);
            let identification = pipeline.identify(&load_image(&args.image)?)?;
            print_json(&identification.to_value())?;
            Ok(0)
        }
        Command::Register(args) => {
            let services = open_services(&config)?;
            let pipeline = RecognitionPipeline::new(services, vision_adapter(&config)?);
            let (analysis, _digest) = pipeline.analyze(&load_image(&args.image)?)?;
            if let Some(error) = analysis.to_error_record() {
                warn!(error = %error["error"], "registering without attributes");
            }
            let created = pipeline.register_unmatched(
                &args.name,
                analysis.primary(),
                args.id.as_deref(),
                args.quantity,
            )?;
            print_json(&serde_json::to_value(&created)?)?;
            Ok(0)
        }
        Command::Detect(args) => {
            let image = load_image(&args.image)?;
            let detections = filter_by_confidence(
                FixtureDetector::from_file(&args.detections)?.detect(&image)?,
                args.min_confidence,
            );
            print!("{}", format_summary(&detections));
            if let Some(query) = &args.search {
                println!();
                print!("{}", format_search(&search_detections(&detections, query)));
            }
            if let Some(path) = &args.annotate {
                let target = AnnotationTarget {
                    path,
                    label_font: args.label_font.as_deref(),
                };
                target.write(&image, &detections, args.search.as_deref())?;
            }
            Ok(0)
        }
        Command::Models => {
            let selection = select_models(&config)?;
            let registry: Vec<Value> = ModelRegistry::new(None)
                .list()
                .map(|spec| {
                    json!({
                        "name": spec.name,
                        "capabilities": spec.capabilities,
                        "max_output_tokens": spec.max_output_tokens,
                    })
                })
                .collect();
            print_json(&json!({
                "requested": selection.requested,
                "models": selection.models,
                "fallback_reasons": selection.fallback_reasons,
                "registry": registry,
            }))?;
            Ok(0)
        }
        Command::Inventory(command) => run_inventory(&open_services(&config)?, command),
    }
}

fn run_inventory(services: &Services, command: InventoryCommand) -> Result<i32> {
    match command {
        InventoryCommand::List { search } => {
            let items = services.store.get_all()?;
            let shown = search_items(&items, search.as_deref().unwrap_or_default());
            print_json(&serde_json::to_value(shown)?)?;
        }
        InventoryCommand::Show { id } => match services.store.get(&id)? {
            Some(item) => print_json(&serde_json::to_value(&item)?)?,
            None => bail!("no inventory item with id '{id}'"),
        },
        InventoryCommand::Add {
            name,
            id,
            quantity,
            analysis,
        } => {
            let item = NewInventoryItem::named(name)
                .with_analysis(analysis.unwrap_or_default())
                .with_quantity(quantity);
            let created = services.register(item, id.as_deref())?;
            print_json(&serde_json::to_value(&created)?)?;
        }
        InventoryCommand::Update { id, fields } => {
            let updated = services.update(&id, parse_field_assignments(&fields)?)?;
            print_json(&serde_json::to_value(&updated)?)?;
        }
        InventoryCommand::Remove { id } => {
            let removed = services.remove(&id)?;
            print_json(&json!({ "id": id, "removed": removed }))?;
        }
        InventoryCommand::History { id } => {
            let Some(journal) = &services.journal else {
                bail!("item history needs an activity journal (--journal or STOCKSCAN_JOURNAL)");
            };
            print_json(&Value::Array(journal.item_history(&id)?))?;
        }
    }
    Ok(0)
}

struct AnnotationTarget<'a> {
    path: &'a Path,
    label_font: Option<&'a Path>,
}

impl AnnotationTarget<'_> {
    fn write(
        &self,
        image: &DynamicImage,
        detections: &[Detection],
        search: Option<&str>,
    ) -> Result<()> {
        let annotator = match self.label_font {
            Some(font) => Annotator::with_font_file(font)?,
            None => Annotator::default(),
        };
        save_annotated(&annotator.annotate(image, detections, search), self.path)?;
        info!(path = %self.path.display(), boxes = detections.len(), "annotated image written");
        Ok(())
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn resolve_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = EngineConfig::from_env()?;
    if let Some(store) = &cli.store {
        config.store_path = store.clone();
    }
    if let Some(journal) = &cli.journal {
        config.journal_path = Some(journal.clone());
    }
    let models: Vec<String> = cli
        .models
        .iter()
        .flat_map(|raw| parse_model_list(raw))
        .collect();
    if !models.is_empty() {
        config.models = models;
    }
    if cli.timeout.is_some() {
        config.request_timeout = timeout_from_seconds(cli.timeout);
    }
    Ok(config)
}

fn open_services(config: &EngineConfig) -> Result<Services> {
    let store = JsonFileStore::open(&config.store_path).with_context(|| {
        format!("failed to open inventory store {}", config.store_path.display())
    })?;
    let journal = config.journal_path.as_ref().map(|path| {
        let journal = ActivityJournal::new(path, uuid::Uuid::new_v4().simple().to_string());
        info!(
            path = %path.display(),
            session_id = journal.session_id(),
            "activity journal enabled"
        );
        journal
    });
    Ok(Services::new(Arc::new(store), journal))
}

fn select_models(config: &EngineConfig) -> Result<ModelSelection> {
    let selection = ModelSelector::new(None)
        .fallback_chain(&config.models, CAPABILITY_VISION)
        .map_err(|message| anyhow!(message))?;
    for reason in &selection.fallback_reasons {
        info!(reason = %reason, "model selection");
    }
    Ok(selection)
}

fn vision_adapter(config: &EngineConfig) -> Result<AttributeExtractionAdapter> {
    let selection = select_models(config)?;
    let client = GeminiClient::new(config)?;
    let caller = ResilientGenerationCaller::new(Arc::new(client), selection.models)?;
    info!(models = ?caller.models(), "vision fallback chain ready");
    Ok(AttributeExtractionAdapter::new(caller))
}

fn parse_field_assignments(assignments: &[String]) -> Result<Map<String, Value>> {
    let mut fields = Map::new();
    for assignment in assignments {
        let Some((key, raw)) = assignment.split_once('=') else {
            bail!("expected key=value, got '{assignment}'");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("empty field name in '{assignment}'");
        }
        let value = serde_json::from_str::<Value>(raw.trim())
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use serde_json::json;
    use stockscan_engine::MatchStrategy;

    use stockscan_contracts::journal::ActivityJournal;

    use super::{execute, parse_field_assignments, resolve_config, Cli, Command, InventoryCommand};

    #[test]
    fn field_assignments_parse_json_with_text_fallback() -> anyhow::Result<()> {
        let fields = parse_field_assignments(&[
            "quantity=3".to_string(),
            "name=Taza azul".to_string(),
            "tags=[\"cocina\"]".to_string(),
        ])?;
        assert_eq!(fields["quantity"], json!(3));
        assert_eq!(fields["name"], json!("Taza azul"));
        assert_eq!(fields["tags"], json!(["cocina"]));
        assert!(parse_field_assignments(&["quantity".to_string()]).is_err());
        assert!(parse_field_assignments(&["=3".to_string()]).is_err());
        Ok(())
    }

    #[test]
    fn global_flags_override_the_environment_config() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "stockscan",
            "--store",
            "/tmp/inv.json",
            "--model",
            "gemini-2.0-flash",
            "--model",
            "gemini-1.5-pro-latest",
            "--timeout",
            "1",
            "models",
        ])?;
        let config = resolve_config(&cli)?;
        assert_eq!(config.store_path.to_str(), Some("/tmp/inv.json"));
        assert_eq!(config.models, vec!["gemini-2.0-flash", "gemini-1.5-pro-latest"]);
        assert_eq!(config.request_timeout.as_secs(), 5);
        Ok(())
    }

    #[test]
    fn subcommands_parse_strategy_and_inventory_updates() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "stockscan",
            "identify",
            "--image",
            "foto.jpg",
            "--strategy",
            "local",
        ])?;
        match cli.command {
            Command::Identify(args) => assert_eq!(args.strategy, MatchStrategy::Local),
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from([
            "stockscan", "inventory", "update", "abc", "--set", "quantity=2",
        ])?;
        match cli.command {
            Command::Inventory(InventoryCommand::Update { id, fields }) => {
                assert_eq!(id, "abc");
                assert_eq!(fields, vec!["quantity=2".to_string()]);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["stockscan", "inventory", "update", "abc"]).is_err());
        Ok(())
    }

    #[test]
    fn store_is_opened_only_by_commands_that_use_it() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let corrupt = temp.path().join("inventory.json");
        std::fs::write(&corrupt, "not json")?;
        let store = corrupt.to_string_lossy().to_string();

        let models = Cli::try_parse_from(["stockscan", "--store", store.as_str(), "models"])?;
        assert_eq!(execute(models)?, 0);
        let listed = execute(Cli::try_parse_from([
            "stockscan", "--store", store.as_str(), "inventory", "list",
        ])?);
        assert!(listed.is_err());
        Ok(())
    }

    #[test]
    fn inventory_history_reads_the_journal() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = temp.path().join("inventory.json").to_string_lossy().to_string();
        let journal = temp.path().join("activity.jsonl");
        let journal_arg = journal.to_string_lossy().to_string();
        let with_journal = |tail: &[&str]| -> anyhow::Result<i32> {
            let mut argv = vec![
                "stockscan",
                "--store",
                store.as_str(),
                "--journal",
                journal_arg.as_str(),
            ];
            argv.extend_from_slice(tail);
            execute(Cli::try_parse_from(argv)?)
        };

        with_journal(&["inventory", "add", "--name", "Taza", "--id", "t1"])?;
        with_journal(&["inventory", "update", "t1", "--set", "quantity=3"])?;
        assert_eq!(with_journal(&["inventory", "history", "t1"])?, 0);

        let history = ActivityJournal::new(&journal, "reader").item_history("t1")?;
        let events: Vec<&str> = history
            .iter()
            .filter_map(|entry| entry["event"].as_str())
            .collect();
        assert_eq!(events, vec!["item_added", "item_updated"]);
        assert_ne!(history[0]["session_id"], history[1]["session_id"]);

        let without = execute(Cli::try_parse_from([
            "stockscan", "--store", store.as_str(), "inventory", "history", "t1",
        ])?);
        if std::env::var_os("STOCKSCAN_JOURNAL").is_none() {
            assert!(without.is_err());
        }
        Ok(())
    }

    #[test]
    fn detect_and_analyze_accept_an_annotation_target() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "stockscan",
            "detect",
            "--image",
            "estante.jpg",
            "--detections",
            "cajas.json",
            "--search",
            "tornillos",
            "--annotate",
            "marcado.png",
        ])?;
        match cli.command {
            Command::Detect(args) => {
                let target = args.annotate.as_deref().and_then(|path| path.to_str());
                assert_eq!(target, Some("marcado.png"));
                assert_eq!(args.search.as_deref(), Some("tornillos"));
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from([
            "stockscan", "detect", "--image", "a.jpg", "--detections", "b.json", "--label-font",
            "f.ttf",
        ])
        .is_err());

        let cli = Cli::try_parse_from([
            "stockscan", "analyze", "--image", "estante.jpg", "--annotate", "out.png",
        ])?;
        match cli.command {
            Command::Analyze(args) => {
                assert!(args.annotate.is_some());
                assert!(args.search.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
        Ok(())
    }
}
