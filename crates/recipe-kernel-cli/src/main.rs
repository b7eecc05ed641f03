use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{ArgMatches, Args, CommandFactory, FromArgMatches, Parser, Subcommand, ValueEnum};
use recipe_kernel_api::{
    AddCategoryRequest, AddItemRequest, AddRecipeRequest, AddSlotsRequest, BestMatchRequest,
    ConfirmRequest, RecipeKernelApi, RemoveSlotsRequest, SlotSpec,
};
use recipe_kernel_core::{
    CategoryId, ItemId, KernelError, LookupStrategy, MatchPolicy, RecipeId, SlotId,
};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rk")]
#[command(about = "Recipe Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./recipe_kernel.sqlite3")]
    db: PathBuf,

    /// Log debug events to stderr.
    #[arg(long, short, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Catalog {
        #[command(subcommand)]
        command: Box<CatalogCommand>,
    },
    Recipe {
        #[command(subcommand)]
        command: Box<RecipeCommand>,
    },
    Match {
        #[command(subcommand)]
        command: Box<MatchCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    AddCategory(AddCategoryArgs),
    AddItem(AddItemArgs),
    List,
}

#[derive(Debug, Args)]
struct AddCategoryArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct AddItemArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    category: String,
}

#[derive(Debug, Subcommand)]
enum RecipeCommand {
    Add(RecipeAddArgs),
    Show(RecipeRefArgs),
    AddSlot(RecipeAddSlotArgs),
    RemoveSlot(RecipeRemoveSlotArgs),
    Clear(RecipeRefArgs),
}

/// Slots are created in the order their flags appear on the command line.
#[derive(Debug, Args)]
struct SlotTargetArgs {
    #[arg(long = "item")]
    items: Vec<String>,
    #[arg(long = "category")]
    categories: Vec<String>,
}

#[derive(Debug, Args)]
struct RecipeAddArgs {
    #[arg(long)]
    name: String,
    #[command(flatten)]
    targets: SlotTargetArgs,
}

#[derive(Debug, Args)]
struct RecipeRefArgs {
    #[arg(long)]
    recipe: String,
}

#[derive(Debug, Args)]
struct RecipeAddSlotArgs {
    #[arg(long)]
    recipe: String,
    #[command(flatten)]
    targets: SlotTargetArgs,
}

#[derive(Debug, Args)]
struct RecipeRemoveSlotArgs {
    #[arg(long)]
    recipe: String,
    #[arg(long = "slot", required = true)]
    slots: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum MatchCommand {
    Confirm(MatchConfirmArgs),
    Best(MatchBestArgs),
}

#[derive(Debug, Args)]
struct MatchConfirmArgs {
    #[arg(long)]
    recipe: String,
    #[arg(long = "item")]
    items: Vec<String>,
    #[arg(long, value_enum, default_value_t = PolicyArg::Greedy)]
    policy: PolicyArg,
}

#[derive(Debug, Args)]
struct MatchBestArgs {
    #[arg(long = "item")]
    items: Vec<String>,
    #[arg(long, value_enum, default_value_t = StrategyArg::Indexed)]
    strategy: StrategyArg,
    #[arg(long, value_enum, default_value_t = PolicyArg::Greedy)]
    policy: PolicyArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Greedy,
    Exhaustive,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    BruteForce,
    Indexed,
}

impl PolicyArg {
    fn into_policy(self) -> MatchPolicy {
        match self {
            Self::Greedy => MatchPolicy::Greedy,
            Self::Exhaustive => MatchPolicy::Exhaustive,
        }
    }
}

impl StrategyArg {
    fn into_strategy(self) -> LookupStrategy {
        match self {
            Self::BruteForce => LookupStrategy::BruteForce,
            Self::Indexed => LookupStrategy::Indexed,
        }
    }
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

fn init_logging(verbose: bool) {
    let fallback = if verbose { "recipe_kernel=debug,info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}

fn main() -> Result<()> {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());
    init_logging(cli.verbose);
    tracing::debug!(db = %cli.db.display(), "opening recipe catalog");

    let api = RecipeKernelApi::new(cli.db);
    let leaf = leaf_matches(&matches);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Catalog { command } => run_catalog(*command, &api),
        Command::Recipe { command } => run_recipe(*command, &api, leaf),
        Command::Match { command } => run_match(*command, &api),
    }
}

fn leaf_matches(matches: &ArgMatches) -> &ArgMatches {
    match matches.subcommand() {
        Some((_, sub)) => leaf_matches(sub),
        None => matches,
    }
}

fn run_db(command: DbCommand, api: &RecipeKernelApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
            }))
        }
        DbCommand::Migrate(args) => emit_serialized(&api.migrate(args.dry_run)?),
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let clean = report.is_clean();
            let mut value =
                serde_json::to_value(&report).context("failed to serialize integrity report")?;
            if let Value::Object(object) = &mut value {
                object.insert("clean".to_string(), Value::Bool(clean));
            }
            emit_json(value)
        }
    }
}

fn run_catalog(command: CatalogCommand, api: &RecipeKernelApi) -> Result<()> {
    match command {
        CatalogCommand::AddCategory(args) => {
            emit_serialized(&api.add_category(AddCategoryRequest { name: args.name })?)
        }
        CatalogCommand::AddItem(args) => {
            let category_id = parse_id::<CategoryId>(&args.category)?;
            emit_serialized(&api.add_item(AddItemRequest { name: args.name, category_id })?)
        }
        CatalogCommand::List => emit_serialized(&api.list_catalog()?),
    }
}

fn run_recipe(command: RecipeCommand, api: &RecipeKernelApi, leaf: &ArgMatches) -> Result<()> {
    match command {
        RecipeCommand::Add(args) => {
            let slots = ordered_slots(&args.targets, leaf)?;
            emit_serialized(&api.add_recipe(AddRecipeRequest { name: args.name, slots })?)
        }
        RecipeCommand::Show(args) => {
            emit_serialized(&api.get_recipe(parse_id::<RecipeId>(&args.recipe)?)?)
        }
        RecipeCommand::AddSlot(args) => {
            let recipe_id = parse_id::<RecipeId>(&args.recipe)?;
            let slots = ordered_slots(&args.targets, leaf)?;
            if slots.is_empty() {
                return Err(anyhow!("at least one --item or --category MUST be provided"));
            }
            emit_serialized(&api.add_slots(AddSlotsRequest { recipe_id, slots })?)
        }
        RecipeCommand::RemoveSlot(args) => {
            let recipe_id = parse_id::<RecipeId>(&args.recipe)?;
            let slot_ids =
                args.slots.iter().map(|raw| parse_id::<SlotId>(raw)).collect::<Result<Vec<_>>>()?;
            emit_serialized(&api.remove_slots(RemoveSlotsRequest { recipe_id, slot_ids })?)
        }
        RecipeCommand::Clear(args) => {
            emit_serialized(&api.clear_slots(parse_id::<RecipeId>(&args.recipe)?)?)
        }
    }
}

fn run_match(command: MatchCommand, api: &RecipeKernelApi) -> Result<()> {
    match command {
        MatchCommand::Confirm(args) => {
            let result = api.confirm(ConfirmRequest {
                recipe_id: parse_id::<RecipeId>(&args.recipe)?,
                item_ids: parse_item_ids(&args.items)?,
                policy: args.policy.into_policy(),
            })?;
            emit_serialized(&result)
        }
        MatchCommand::Best(args) => {
            let result = api.best_match(BestMatchRequest {
                item_ids: parse_item_ids(&args.items)?,
                strategy: args.strategy.into_strategy(),
                policy: args.policy.into_policy(),
            })?;
            emit_json(serde_json::json!({
                "matched_recipe_id": result.matched.as_ref().map(|recipe| recipe.recipe_id()),
                "catalog_snapshot_id": result.catalog_snapshot_id,
                "report": result.report,
            }))
        }
    }
}

fn emit_serialized<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

/// Interleave `--item` and `--category` values by their position on the command line.
fn ordered_slots(args: &SlotTargetArgs, matches: &ArgMatches) -> Result<Vec<SlotSpec>> {
    let mut positioned = Vec::with_capacity(args.items.len() + args.categories.len());
    for (raw, position) in args.items.iter().zip(flag_positions(matches, "items")) {
        positioned.push((position, SlotSpec::item(parse_id(raw)?)));
    }
    for (raw, position) in args.categories.iter().zip(flag_positions(matches, "categories")) {
        positioned.push((position, SlotSpec::category(parse_id(raw)?)));
    }
    if positioned.len() != args.items.len() + args.categories.len() {
        return Err(anyhow!("failed to resolve slot flag positions"));
    }

    positioned.sort_by_key(|(position, _)| *position);
    Ok(positioned.into_iter().map(|(_, spec)| spec).collect())
}

fn flag_positions(matches: &ArgMatches, id: &str) -> Vec<usize> {
    matches.indices_of(id).map(Iterator::collect).unwrap_or_default()
}

fn parse_item_ids(raw_ids: &[String]) -> Result<Vec<ItemId>> {
    raw_ids.iter().map(|raw| parse_id::<ItemId>(raw)).collect()
}

fn parse_id<T>(value: &str) -> Result<T>
where
    T: FromStr<Err = KernelError>,
{
    value.parse::<T>().with_context(|| format!("invalid ULID: {value}"))
}
