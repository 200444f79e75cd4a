use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use rule_ledger_core::{RuleRecord, RuleRegistry};
use rule_ledger_correlate::{correlate, HashEmbedder, DEFAULT_THRESHOLD};
use rule_ledger_parser::{parse_documented_rules, RuleDocument};
use rule_ledger_provenance::{
    discover_log_files, link_execution_and_artifacts, list_all_logs, rebuild_sources_and_runs,
};
use rule_ledger_store_json::{
    ModelStore, BUSINESS_RULES_FILE, COMPONENTS_FILE, CORRELATED_RULES_FILE,
    DOCUMENTED_RULES_FILE, TEAMS_FILE,
};

mod backend;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_DIR_ENV: &str = "RULELOG_DIR";
const CATEGORISE_TEMPLATE: &str = "categorise-rule.templ";
const CATEGORISE_OUTPUT_FILE: &str = "categorise-rule/categorise-rule.md";

#[derive(Debug, Parser)]
#[command(name = "rl")]
#[command(about = "RuleLedger business-rule registry")]
struct Cli {
    /// Directory whose .model/ subdirectory holds the registries.
    /// Defaults to the user's home directory.
    #[arg(long)]
    model_home: Option<PathBuf>,

    /// Directory scanned for generation logs. Defaults to
    /// <home>/.rulelog/log, overridable via RULELOG_DIR.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Ingest(IngestArgs),
    ExtractDoc(ExtractDocArgs),
    Correlate(CorrelateArgs),
    Link(LinkArgs),
    Categorise(CategoriseArgs),
    Registry {
        #[command(subcommand)]
        command: RegistryCommand,
    },
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long)]
    input: PathBuf,
    /// Replace existing records regardless of timestamp comparison.
    #[arg(long, default_value_t = false)]
    force: bool,
    /// Team/owner applied to every rule in this batch.
    #[arg(long, default_value = "")]
    owner: String,
    /// Component applied to every rule in this batch.
    #[arg(long, default_value = "")]
    component: String,
}

#[derive(Debug, Args)]
struct ExtractDocArgs {
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct CorrelateArgs {
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: f64,
}

#[derive(Debug, Args)]
struct LinkArgs {
    #[arg(long)]
    artifact: PathBuf,
}

#[derive(Debug, Args)]
struct CategoriseArgs {
    /// Categorise at most this many rules.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum RegistryCommand {
    List(RegistryListArgs),
}

#[derive(Debug, Args)]
struct RegistryListArgs {
    #[arg(long, default_value = BUSINESS_RULES_FILE)]
    file: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let model_home = match cli.model_home.clone() {
        Some(path) => path,
        None => dirs::home_dir().context("cannot determine home directory")?,
    };
    let log_dir = resolve_log_dir(cli.log_dir.clone(), &model_home);
    let store = ModelStore::new(&model_home);

    match cli.command {
        Command::Ingest(args) => run_ingest(&args, &store, &log_dir),
        Command::ExtractDoc(args) => run_extract_doc(&args, &store),
        Command::Correlate(args) => run_correlate(&args, &store),
        Command::Link(args) => run_link(&args, &store, &log_dir),
        Command::Categorise(args) => run_categorise(&args, &store),
        Command::Registry { command } => match command {
            RegistryCommand::List(args) => run_registry_list(&args, &store),
        },
    }
}

fn resolve_log_dir(flag: Option<PathBuf>, home: &Path) -> PathBuf {
    if let Some(path) = flag {
        return path;
    }
    if let Ok(path) = std::env::var(LOG_DIR_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    home.join(".rulelog").join("log")
}

/// Log-scan roots for a document or artifact: the configured log dir, the
/// working directory, and the file's directory plus its parent.
fn log_scan_roots(log_dir: &Path, target: &Path) -> Vec<PathBuf> {
    let mut roots = vec![log_dir.to_path_buf()];
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    if let Some(dir) = target.parent() {
        roots.push(dir.to_path_buf());
        if let Some(parent) = dir.parent() {
            roots.push(parent.to_path_buf());
        }
    }
    roots
}

fn run_ingest(args: &IngestArgs, store: &ModelStore, log_dir: &Path) -> Result<()> {
    let text = std::fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read input document {}", args.input.display()))?;
    let modified = std::fs::metadata(&args.input)
        .and_then(|meta| meta.modified())
        .with_context(|| format!("failed to stat input document {}", args.input.display()))?;
    let batch_timestamp = OffsetDateTime::from(modified);

    let document = RuleDocument::parse(&text);
    let mut batch: Vec<RuleRecord> = document.records().collect();
    for record in &mut batch {
        record.owner.clone_from(&args.owner);
        record.component.clone_from(&args.component);
    }
    let mut registry = RuleRegistry::from_records(store.load_rules(BUSINESS_RULES_FILE));
    let outcome = registry.merge(batch, batch_timestamp, args.force);
    let counts = outcome.counts;

    store.append_unique(TEAMS_FILE, &args.owner)?;
    store.append_unique(COMPONENTS_FILE, &args.component)?;

    // Only rules this batch inserted or updated get attached to a run;
    // skipped records keep whatever attachment they already have.
    let rule_ids: Vec<String> = outcome
        .changed_names
        .iter()
        .filter_map(|name| registry.get(name).map(|record| record.id.to_string()))
        .collect();

    let logs = discover_log_files(&log_scan_roots(log_dir, &args.input));
    let existing_runs = store.load_runs();
    let rebuild =
        rebuild_sources_and_runs(&logs, &existing_runs, &rule_ids, Some(&args.input));

    let registry_count = registry.len();
    store.save(BUSINESS_RULES_FILE, &registry.into_records())?;
    store.save(rule_ledger_store_json::SOURCES_FILE, &rebuild.sources)?;
    store.save(rule_ledger_store_json::RUNS_FILE, &rebuild.runs)?;

    emit_json(serde_json::json!({
        "input": args.input,
        "sections": document.section_count(),
        "considered": counts.considered,
        "new": counts.new,
        "updated": counts.updated,
        "skipped": counts.skipped,
        "registry_count": registry_count,
        "run_attached": rebuild.attached_run.is_some(),
        "scanned_logs": logs.len()
    }))
}

fn run_extract_doc(args: &ExtractDocArgs, store: &ModelStore) -> Result<()> {
    let text = std::fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read input document {}", args.input.display()))?;
    let rules = parse_documented_rules(&text);
    store.save(DOCUMENTED_RULES_FILE, &rules)?;

    emit_json(serde_json::json!({
        "input": args.input,
        "documented_rules": rules.len()
    }))
}

fn run_correlate(args: &CorrelateArgs, store: &ModelStore) -> Result<()> {
    let code_rules = store.load_rules(BUSINESS_RULES_FILE);
    let doc_rules = store.load_documented_rules();

    let embedder = HashEmbedder::default();
    let merged = correlate(&code_rules, &doc_rules, args.threshold, &embedder)
        .context("correlation failed")?;
    let matched = merged.iter().filter(|record| record.doc_rule_id.is_some()).count();
    store.save(CORRELATED_RULES_FILE, &merged)?;

    emit_json(serde_json::json!({
        "threshold": args.threshold,
        "code_rules": code_rules.len(),
        "documented_rules": doc_rules.len(),
        "matched": matched
    }))
}

fn run_link(args: &LinkArgs, store: &ModelStore, log_dir: &Path) -> Result<()> {
    let mut rules = store.load_rules(BUSINESS_RULES_FILE);
    let mut executions = store.load_executions();
    let mut artifacts = store.load_artifacts();

    let logs = list_all_logs(&[log_dir.to_path_buf()]);
    let outcome = link_execution_and_artifacts(
        &logs,
        &args.artifact,
        &mut rules,
        &mut executions,
        &mut artifacts,
        OffsetDateTime::now_utc(),
    )?;

    match outcome {
        Some(summary) => {
            store.save(BUSINESS_RULES_FILE, &rules)?;
            store.save(rule_ledger_store_json::EXECUTIONS_FILE, &executions)?;
            store.save(rule_ledger_store_json::ARTIFACTS_FILE, &artifacts)?;
            emit_json(serde_json::json!({
                "artifact": args.artifact,
                "matched": true,
                "execution_id": summary.execution_id.to_string(),
                "log_path": summary.log_path,
                "rules_annotated": summary.rules_annotated,
                "artifacts_found": summary.artifacts_found
            }))
        }
        None => emit_json(serde_json::json!({
            "artifact": args.artifact,
            "matched": false,
            "scanned_logs": logs.len()
        })),
    }
}

fn needs_category(record: &RuleRecord) -> bool {
    match record.rule_category.as_deref() {
        Some(category) => category.trim().is_empty(),
        None => true,
    }
}

fn run_categorise(args: &CategoriseArgs, store: &ModelStore) -> Result<()> {
    // The categories file is the one strict input: fail before any write.
    let categories = store.load_rule_categories()?;
    let mut rules = store.load_rules(BUSINESS_RULES_FILE);

    let mut targets: Vec<usize> = rules
        .iter()
        .enumerate()
        .filter_map(|(index, record)| needs_category(record).then_some(index))
        .collect();
    if let Some(limit) = args.limit {
        targets.truncate(limit);
    }
    let total = targets.len();

    let stage_dir = std::env::temp_dir().join(format!("rule-ledger-categorise-{}", Ulid::new()));
    std::fs::create_dir_all(&stage_dir)
        .with_context(|| format!("failed to create staging dir {}", stage_dir.display()))?;
    let output_dir = stage_dir.join("out");

    let mut categorised = 0;
    let mut skipped = 0;
    for (position, &index) in targets.iter().enumerate() {
        let rule = &rules[index];

        let categories_path = stage_dir.join("rule_categories.filtered.json");
        let filtered = categories.filtered_for_team(&rule.owner);
        std::fs::write(&categories_path, serde_json::to_vec_pretty(&filtered)?)
            .with_context(|| format!("failed to stage {}", categories_path.display()))?;

        let rule_path = stage_dir.join("rule.json");
        std::fs::write(&rule_path, serde_json::to_vec_pretty(&[rule])?)
            .with_context(|| format!("failed to stage {}", rule_path.display()))?;

        let request = backend::BackendRequest {
            input_file: &categories_path,
            input_file2: Some(&rule_path),
            output_dir: &output_dir,
            output_file: CATEGORISE_OUTPUT_FILE,
            page: Some((position + 1, total)),
            template: CATEGORISE_TEMPLATE,
        };
        let produced = match backend::run_custom_prompt(&request) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(rule = rules[index].rule_name, "skipping rule: {err}");
                skipped += 1;
                continue;
            }
        };

        let Some(category) = read_selected_category(&produced) else {
            tracing::warn!(
                rule = rules[index].rule_name,
                output = %produced.display(),
                "skipping rule: no selected category in backend output"
            );
            skipped += 1;
            continue;
        };
        rules[index].rule_category = Some(category);
        categorised += 1;
    }

    store.save(BUSINESS_RULES_FILE, &rules)?;
    let _ = std::fs::remove_dir_all(&stage_dir);

    emit_json(serde_json::json!({
        "considered": total,
        "categorised": categorised,
        "skipped": skipped
    }))
}

fn read_selected_category(path: &Path) -> Option<String> {
    let raw = std::fs::read(path).ok()?;
    let value: Value = serde_json::from_slice(&raw).ok()?;
    let name = value.get("selectedCategory")?.get("name")?.as_str()?.trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn run_registry_list(args: &RegistryListArgs, store: &ModelStore) -> Result<()> {
    let records = store.load_rules(&args.file);
    emit_json(serde_json::json!({
        "file": args.file,
        "count": records.len(),
        "records": records
    }))
}
