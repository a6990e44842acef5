use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use foundry_core::{
    native_to_time, BehaviorProfiles, Dialect, DialectRegistry, LatencyClass, TemporalDistributor,
    ValidationReport,
};
use foundry_store_sqlite::{validate_path, ArtifactBuilder, ArtifactTarget, BuilderOptions};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

mod config;
mod script;

use config::FoundryConfig;
use script::Script;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV_VAR: &str = "FOUNDRY_LOG";
const DEFAULT_LOG_FILTER: &str = "foundry=info";

#[derive(Debug, Parser)]
#[command(name = "foundry")]
#[command(about = "Synthetic iMessage chat.db artifact foundry")]
struct Cli {
    /// YAML configuration file; falls back to $IMESSAGE_FOUNDRY_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Dialect {
        #[command(subcommand)]
        command: DialectCommand,
    },
    Timestamps(TimestampsArgs),
    Build(BuildArgs),
    Validate(ValidateArgs),
}

#[derive(Debug, Subcommand)]
enum DialectCommand {
    List,
    Show(DialectShowArgs),
    Diff(DialectDiffArgs),
}

#[derive(Debug, Args)]
struct DialectShowArgs {
    /// Dialect name or macOS version; defaults to the configured dialect.
    tag: Option<String>,
    /// Include the rendered CREATE statements.
    #[arg(long, default_value_t = false)]
    sql: bool,
}

#[derive(Debug, Args)]
struct DialectDiffArgs {
    from: String,
    to: String,
}

#[derive(Debug, Args)]
struct TimestampsArgs {
    #[arg(long)]
    count: usize,
    #[arg(long, value_parser = parse_rfc3339)]
    start: OffsetDateTime,
    #[arg(long, value_parser = parse_rfc3339)]
    end: OffsetDateTime,
    #[arg(long)]
    seed: Option<u64>,
    /// Responder profile as `identifier=class`; repeat to alternate responders.
    #[arg(long = "profile")]
    profiles: Vec<String>,
}

#[derive(Debug, Args)]
struct BuildArgs {
    #[arg(long)]
    script: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    dialect: Option<String>,
    /// Pick the dialect for this host macOS version instead of a tag.
    #[arg(long, conflicts_with = "dialect")]
    host_version: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
    /// Build in memory and write the file only on success.
    #[arg(long, default_value_t = false)]
    in_memory: bool,
    #[arg(long)]
    attachment_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    dialect: Option<String>,
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

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| format!("expected an RFC 3339 timestamp: {err}"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();
    let config = FoundryConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Dialect { command } => run_dialect(command, &config),
        Command::Timestamps(args) => run_timestamps(&args, &config),
        Command::Build(args) => run_build(&args, &config),
        Command::Validate(args) => run_validate(&args, &config),
    }
}

fn run_dialect(command: DialectCommand, config: &FoundryConfig) -> Result<ExitCode> {
    let registry = DialectRegistry::builtin();
    match command {
        DialectCommand::List => {
            let summaries = registry.summaries()?;
            emit_json(serde_json::json!({
                "default_dialect": config.dialect,
                "dialects": summaries
            }))?;
        }
        DialectCommand::Show(args) => {
            let dialect = registry.resolve(args.tag.as_deref().unwrap_or(&config.dialect))?;
            let mut payload =
                serde_json::to_value(&dialect).context("failed to serialize dialect")?;
            if let Value::Object(object) = &mut payload {
                let client_version = dialect
                    .client_version()
                    .map_or(Value::Null, |version| Value::String(version.to_string()));
                object.insert("client_version".to_string(), client_version);
                if args.sql {
                    object.insert("sql".to_string(), serde_json::to_value(dialect.schema_sql())?);
                }
            }
            emit_json(payload)?;
        }
        DialectCommand::Diff(args) => {
            let from = registry.resolve(&args.from)?;
            let to = registry.resolve(&args.to)?;
            let diff = from.diff(&to);
            let mut payload =
                serde_json::to_value(&diff).context("failed to serialize dialect diff")?;
            if let Value::Object(object) = &mut payload {
                object.insert("identical".to_string(), Value::Bool(diff.is_empty()));
            }
            emit_json(payload)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_timestamps(args: &TimestampsArgs, config: &FoundryConfig) -> Result<ExitCode> {
    let profiles = config.behavior_profiles()?;
    let mut responders = Vec::with_capacity(args.profiles.len());
    for entry in &args.profiles {
        let Some((_, class)) = entry.split_once('=') else {
            bail!("--profile expects identifier=class, got {entry:?}");
        };
        responders.push(LatencyClass::parse_lenient(class, LatencyClass::default()));
    }
    let responders = responder_classes(args.count, &responders, &profiles);

    let seed = args.seed.unwrap_or(config.seed);
    let stamps = TemporalDistributor::new(config.distributor_config(), seed)?.distribute(
        &responders,
        args.start,
        args.end,
    )?;
    let timestamps = stamps
        .iter()
        .map(|stamp| -> Result<Value> {
            let utc = native_to_time(*stamp)?
                .format(&Rfc3339)
                .context("failed to format timestamp")?;
            Ok(serde_json::json!({ "native": stamp.nanos(), "utc": utc }))
        })
        .collect::<Result<Vec<_>>>()?;

    emit_json(serde_json::json!({
        "count": timestamps.len(),
        "seed": seed,
        "start": args.start.format(&Rfc3339)?,
        "end": args.end.format(&Rfc3339)?,
        "timestamps": timestamps
    }))?;
    Ok(ExitCode::SUCCESS)
}

/// Explicit responders cycle in order; otherwise every configured profile
/// takes a turn, and with none configured the default class is used.
fn responder_classes(
    count: usize,
    explicit: &[LatencyClass],
    profiles: &BehaviorProfiles,
) -> Vec<LatencyClass> {
    let pool = if explicit.is_empty() {
        profiles.iter().map(|(_, class)| class).collect::<Vec<_>>()
    } else {
        explicit.to_vec()
    };
    if pool.is_empty() {
        return vec![LatencyClass::default(); count];
    }
    pool.into_iter().cycle().take(count).collect()
}

fn run_build(args: &BuildArgs, config: &FoundryConfig) -> Result<ExitCode> {
    let script = Script::from_path(&args.script)?;
    let registry = DialectRegistry::builtin();
    let dialect = match (&args.dialect, &args.host_version) {
        (Some(tag), _) => registry.resolve(tag)?,
        (None, Some(host)) => registry.detect_host(Some(host))?,
        (None, None) => registry.resolve(script.dialect.as_deref().unwrap_or(&config.dialect))?,
    };
    let seed = args.seed.or(script.seed).unwrap_or(config.seed);

    let mut options = if args.in_memory {
        let mut options = BuilderOptions::in_memory();
        options.target = ArtifactTarget::InMemory { backup_to: Some(args.out.clone()) };
        options
    } else {
        BuilderOptions::file(&args.out)
    }
    .with_service(config.service())
    .with_country(config.country.clone())
    .with_retry_attempts(config.io_retry_attempts);
    if let Some(dir) = &args.attachment_dir {
        options = options.with_attachment_dir(dir);
    }

    tracing::info!(
        script = %args.script.display(),
        dialect = %dialect.name,
        seed,
        "building artifact"
    );
    let ((threads, report), summary) = ArtifactBuilder::build_with(options, &dialect, |builder| {
        let threads = script::play(&script, builder, config, seed)?;
        let report = builder.validate()?;
        if report.has_errors() {
            bail!(
                "artifact failed validation with {} error(s): {}",
                report.errors().count(),
                first_error(&report)
            );
        }
        Ok((threads, report))
    })?;

    emit_json(serde_json::json!({
        "artifact": summary,
        "seed": seed,
        "threads": threads,
        "report": report
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn first_error(report: &ValidationReport) -> String {
    report.errors().next().map_or_else(String::new, |violation| violation.detail.clone())
}

fn run_validate(args: &ValidateArgs, config: &FoundryConfig) -> Result<ExitCode> {
    let tag = args.dialect.as_deref().unwrap_or(&config.dialect);
    let dialect: Dialect = DialectRegistry::builtin().resolve(tag)?;
    ensure_exists(&args.db)?;
    let report = validate_path(&args.db, &dialect)?;

    let errors = report.errors().count();
    emit_json(serde_json::json!({
        "path": args.db,
        "dialect": dialect.name,
        "valid": report.is_valid(),
        "errors": errors,
        "warnings": report.warnings().count(),
        "report": report
    }))?;
    Ok(if errors > 0 { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn ensure_exists(path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!("artifact {} does not exist", path.display());
    }
    Ok(())
}
