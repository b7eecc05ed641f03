use std::path::PathBuf;

use anyhow::Result;
use recipe_kernel_core::{
    confirms_with, explain_best_match, Catalog, Category, CategoryId, Item, ItemId, KernelError,
    LookupStrategy, MatchOptions, MatchPolicy, MatchReport, RecipeId, RecipeTemplate, Slot,
    SlotChange, SlotChangeKind, SlotId, SlotTarget,
};
use recipe_kernel_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddCategoryRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddItemRequest {
    pub name: String,
    pub category_id: CategoryId,
}

/// Wire form of one slot: exactly one of the two fields must be set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SlotSpec {
    #[serde(default)]
    pub item_id: Option<ItemId>,
    #[serde(default)]
    pub category_id: Option<CategoryId>,
}

impl SlotSpec {
    #[must_use]
    pub fn item(item_id: ItemId) -> Self {
        Self { item_id: Some(item_id), category_id: None }
    }

    #[must_use]
    pub fn category(category_id: CategoryId) -> Self {
        Self { item_id: None, category_id: Some(category_id) }
    }

    /// Decode into a slot target.
    ///
    /// # Errors
    /// Returns [`KernelError::MalformedSlot`] when both or neither fields are set.
    pub fn target(self) -> Result<SlotTarget, KernelError> {
        SlotTarget::from_parts(self.item_id, self.category_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddRecipeRequest {
    pub name: String,
    #[serde(default)]
    pub slots: Vec<SlotSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddSlotsRequest {
    pub recipe_id: RecipeId,
    pub slots: Vec<SlotSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoveSlotsRequest {
    pub recipe_id: RecipeId,
    pub slot_ids: Vec<SlotId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotChangeResult {
    pub change: SlotChangeKind,
    pub affected_slot_ids: Vec<SlotId>,
    pub recipe: RecipeTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogListing {
    pub categories: Vec<Category>,
    pub items: Vec<Item>,
    pub recipes: Vec<RecipeTemplate>,
    pub catalog_snapshot_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub recipe_id: RecipeId,
    pub item_ids: Vec<ItemId>,
    #[serde(default)]
    pub policy: MatchPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmResult {
    pub recipe_id: RecipeId,
    pub policy: MatchPolicy,
    pub supplied_count: usize,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BestMatchRequest {
    pub item_ids: Vec<ItemId>,
    #[serde(default)]
    pub strategy: LookupStrategy,
    #[serde(default)]
    pub policy: MatchPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchResult {
    pub matched: Option<RecipeTemplate>,
    pub report: MatchReport,
    pub catalog_snapshot_id: String,
}

/// First [`KernelError`] in the error chain, if any.
#[must_use]
pub fn kernel_error(err: &anyhow::Error) -> Option<&KernelError> {
    err.chain().find_map(|cause| cause.downcast_ref::<KernelError>())
}

#[derive(Debug, Clone)]
pub struct RecipeKernelApi {
    db_path: PathBuf,
}

impl RecipeKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run `SQLite` and catalog integrity checks.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or inspected.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Register one category.
    ///
    /// # Errors
    /// Returns an error when the name is invalid or taken, or persistence fails.
    pub fn add_category(&self, input: AddCategoryRequest) -> Result<Category> {
        let mut store = self.open_migrated()?;
        store.add_category(&input.name)
    }

    /// Register one item in an existing category.
    ///
    /// # Errors
    /// Returns an error when the name is invalid or taken, the category is unknown, or
    /// persistence fails.
    pub fn add_item(&self, input: AddItemRequest) -> Result<Item> {
        let mut store = self.open_migrated()?;
        store.add_item(&input.name, input.category_id)
    }

    /// Create one recipe template with its initial slots.
    ///
    /// # Errors
    /// Returns an error for a malformed slot, too many slots, an invalid or taken name, or a
    /// slot naming an unknown item or category.
    pub fn add_recipe(&self, input: AddRecipeRequest) -> Result<RecipeTemplate> {
        let targets = decode_targets(&input.slots)?;
        let mut store = self.open_migrated()?;
        let recipe = store.add_recipe(&input.name, &targets)?;
        tracing::info!(recipe_id = %recipe.recipe_id(), slots = recipe.slot_total(), "recipe created");
        Ok(recipe)
    }

    /// Add slots to an existing template as one all-or-nothing change.
    ///
    /// # Errors
    /// Returns an error for a malformed slot, a capacity violation, an unknown recipe or target,
    /// or a persistence failure.
    pub fn add_slots(&self, input: AddSlotsRequest) -> Result<SlotChangeResult> {
        let targets = decode_targets(&input.slots)?;
        let change = SlotChange::AddMany(targets.into_iter().map(Slot::new).collect());
        self.apply_slot_change(input.recipe_id, change)
    }

    /// Remove slots from an existing template as one all-or-nothing change.
    ///
    /// # Errors
    /// Returns an error when any slot is not owned by the template, the recipe is unknown, or
    /// persistence fails.
    pub fn remove_slots(&self, input: RemoveSlotsRequest) -> Result<SlotChangeResult> {
        self.apply_slot_change(input.recipe_id, SlotChange::Remove(input.slot_ids))
    }

    /// Remove every slot of an existing template.
    ///
    /// # Errors
    /// Returns an error when the recipe is unknown or persistence fails.
    pub fn clear_slots(&self, recipe_id: RecipeId) -> Result<SlotChangeResult> {
        self.apply_slot_change(recipe_id, SlotChange::Clear)
    }

    fn apply_slot_change(
        &self,
        recipe_id: RecipeId,
        change: SlotChange,
    ) -> Result<SlotChangeResult> {
        let mut store = self.open_migrated()?;
        store.apply_slot_change(recipe_id, &change)?;
        let recipe = require_recipe(&store, recipe_id)?;
        Ok(SlotChangeResult {
            change: change.kind(),
            affected_slot_ids: change.affected_slot_ids(),
            recipe,
        })
    }

    /// Fetch one recipe template.
    ///
    /// # Errors
    /// Returns [`KernelError::Query`] when the recipe does not exist, or a read error.
    pub fn get_recipe(&self, recipe_id: RecipeId) -> Result<RecipeTemplate> {
        let store = self.open_migrated()?;
        require_recipe(&store, recipe_id)
    }

    /// List categories, items and templates in catalog order.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be read.
    pub fn list_catalog(&self) -> Result<CatalogListing> {
        let store = self.open_migrated()?;
        let snapshot = store.read_snapshot()?;
        let recipes = store.list_templates()?;
        let listing = CatalogListing {
            categories: store.list_categories()?,
            items: store.list_items()?,
            catalog_snapshot_id: compute_snapshot_id(&recipes),
            recipes,
        };
        snapshot.finish()?;
        Ok(listing)
    }

    /// Check whether the supplied items exactly fill one template.
    ///
    /// # Errors
    /// Returns an error when the recipe or any item is unknown, or the catalog cannot be read.
    pub fn confirm(&self, input: ConfirmRequest) -> Result<ConfirmResult> {
        let store = self.open_migrated()?;
        let recipe = require_recipe(&store, input.recipe_id)?;
        let supplied = store.get_items(&input.item_ids)?;
        let confirmed = confirms_with(input.policy, &recipe, &supplied);

        tracing::debug!(
            recipe_id = %input.recipe_id,
            policy = input.policy.as_str(),
            supplied = supplied.len(),
            confirmed,
            "recipe confirmation"
        );
        Ok(ConfirmResult {
            recipe_id: input.recipe_id,
            policy: input.policy,
            supplied_count: supplied.len(),
            confirmed,
        })
    }

    /// Find the best exactly-matching template for the supplied items.
    ///
    /// # Errors
    /// Returns an error when any item is unknown or the catalog cannot be read.
    pub fn best_match(&self, input: BestMatchRequest) -> Result<MatchResult> {
        let store = self.open_migrated()?;
        let options = MatchOptions { strategy: input.strategy, policy: input.policy };

        let snapshot = store.read_snapshot()?;
        let supplied = store.get_items(&input.item_ids)?;
        let report = explain_best_match(&store, &supplied, options)?;
        let catalog_snapshot_id = compute_snapshot_id(&store.list_templates()?);
        snapshot.finish()?;

        tracing::info!(
            strategy = options.strategy.as_str(),
            policy = options.policy.as_str(),
            supplied = supplied.len(),
            candidates = report.candidates_considered,
            matched = ?report.matched.as_ref().map(RecipeTemplate::recipe_id),
            snapshot = %catalog_snapshot_id,
            "best match resolved"
        );
        Ok(MatchResult { matched: report.matched.clone(), report, catalog_snapshot_id })
    }
}

fn decode_targets(specs: &[SlotSpec]) -> Result<Vec<SlotTarget>, KernelError> {
    specs.iter().map(|spec| spec.target()).collect()
}

fn require_recipe(store: &SqliteStore, recipe_id: RecipeId) -> Result<RecipeTemplate> {
    store
        .get_recipe(recipe_id)?
        .ok_or_else(|| KernelError::Query(format!("recipe not found: {recipe_id}")).into())
}

fn compute_snapshot_id(templates: &[RecipeTemplate]) -> String {
    let mut sorted_ids = templates
        .iter()
        .flat_map(|template| {
            let header = format!("{}:{}", template.recipe_id(), template.name());
            let slots = template.slots().iter().map(move |slot| {
                let target = match slot.target {
                    SlotTarget::Item(item_id) => format!("item={item_id}"),
                    SlotTarget::Category(category_id) => format!("category={category_id}"),
                };
                format!("{}:{}:{target}", template.recipe_id(), slot.slot_id)
            });
            std::iter::once(header).chain(slots)
        })
        .collect::<Vec<_>>();
    sorted_ids.sort_unstable();

    let mut hasher = Sha256::new();
    for value in sorted_ids {
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("snap_{}", &digest_hex[..16])
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use recipe_kernel_core::MalformedSlotReason;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("recipekernel-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    struct Pantry {
        fruit: Category,
        dairy: Category,
        apple: Item,
        pear: Item,
        milk: Item,
    }

    fn seed(api: &RecipeKernelApi) -> Result<Pantry> {
        let fruit = api.add_category(AddCategoryRequest { name: "fruit".to_string() })?;
        let dairy = api.add_category(AddCategoryRequest { name: "dairy".to_string() })?;
        let apple = api.add_item(AddItemRequest {
            name: "apple".to_string(),
            category_id: fruit.category_id,
        })?;
        let pear =
            api.add_item(AddItemRequest { name: "pear".to_string(), category_id: fruit.category_id })?;
        let milk =
            api.add_item(AddItemRequest { name: "milk".to_string(), category_id: dairy.category_id })?;
        Ok(Pantry { fruit, dairy, apple, pear, milk })
    }

    #[test]
    fn api_add_confirm_and_match_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RecipeKernelApi::new(db_path.clone());
        let pantry = seed(&api)?;

        let recipe = api.add_recipe(AddRecipeRequest {
            name: "apple milk".to_string(),
            slots: vec![SlotSpec::item(pantry.apple.item_id), SlotSpec::item(pantry.milk.item_id)],
        })?;

        let confirmed = api.confirm(ConfirmRequest {
            recipe_id: recipe.recipe_id(),
            item_ids: vec![pantry.milk.item_id, pantry.apple.item_id],
            policy: MatchPolicy::Greedy,
        })?;
        assert!(confirmed.confirmed);

        let rejected = api.confirm(ConfirmRequest {
            recipe_id: recipe.recipe_id(),
            item_ids: vec![pantry.apple.item_id, pantry.apple.item_id],
            policy: MatchPolicy::Exhaustive,
        })?;
        assert!(!rejected.confirmed);

        let found = api.best_match(BestMatchRequest {
            item_ids: vec![pantry.apple.item_id, pantry.milk.item_id],
            strategy: LookupStrategy::Indexed,
            policy: MatchPolicy::Greedy,
        })?;
        assert_eq!(found.matched.map(|template| template.recipe_id()), Some(recipe.recipe_id()));
        assert!(found.catalog_snapshot_id.starts_with("snap_"));
        assert_eq!(found.catalog_snapshot_id.len(), "snap_".len() + 16);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_wildcard_recipe_evolves_through_slot_changes() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RecipeKernelApi::new(db_path.clone());
        let pantry = seed(&api)?;

        let recipe = api.add_recipe(AddRecipeRequest {
            name: "fruit plate".to_string(),
            slots: vec![SlotSpec::category(pantry.fruit.category_id)],
        })?;
        let before = api.list_catalog()?.catalog_snapshot_id;

        let added = api.add_slots(AddSlotsRequest {
            recipe_id: recipe.recipe_id(),
            slots: vec![SlotSpec::category(pantry.dairy.category_id)],
        })?;
        assert_eq!(added.change, SlotChangeKind::AddMany);
        assert_eq!(added.recipe.category_slot_count(), 2);
        let after = api.list_catalog()?.catalog_snapshot_id;
        assert_ne!(before, after);

        for strategy in [LookupStrategy::BruteForce, LookupStrategy::Indexed] {
            let found = api.best_match(BestMatchRequest {
                item_ids: vec![pantry.pear.item_id, pantry.milk.item_id],
                strategy,
                policy: MatchPolicy::Greedy,
            })?;
            assert_eq!(found.matched.map(|template| template.recipe_id()), Some(recipe.recipe_id()));
            assert_eq!(found.catalog_snapshot_id, after);
        }

        let removed = api.remove_slots(RemoveSlotsRequest {
            recipe_id: recipe.recipe_id(),
            slot_ids: added.affected_slot_ids.clone(),
        })?;
        assert_eq!(removed.recipe.slot_total(), 1);

        let cleared = api.clear_slots(recipe.recipe_id())?;
        assert_eq!(cleared.recipe.slot_total(), 0);
        assert_eq!(api.get_recipe(recipe.recipe_id())?.slot_total(), 0);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_rejects_malformed_slots_and_capacity_overflow() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RecipeKernelApi::new(db_path.clone());
        let pantry = seed(&api)?;

        let err = match api.add_recipe(AddRecipeRequest {
            name: "broken".to_string(),
            slots: vec![SlotSpec {
                item_id: Some(pantry.apple.item_id),
                category_id: Some(pantry.fruit.category_id),
            }],
        }) {
            Ok(recipe) => panic!("malformed slot accepted: {recipe:?}"),
            Err(err) => err,
        };
        assert_eq!(
            kernel_error(&err),
            Some(&KernelError::MalformedSlot { slot_id: None, reason: MalformedSlotReason::BothSet })
        );

        let six = vec![SlotSpec::category(pantry.fruit.category_id); 6];
        let err = match api.add_recipe(AddRecipeRequest { name: "crowded".to_string(), slots: six }) {
            Ok(recipe) => panic!("six-slot recipe accepted: {recipe:?}"),
            Err(err) => err,
        };
        assert!(matches!(kernel_error(&err), Some(KernelError::SlotCapacityExceeded { .. })));
        assert!(api.list_catalog()?.recipes.is_empty());

        let missing = api.get_recipe(RecipeId::new());
        assert!(matches!(
            missing.as_ref().map_err(kernel_error),
            Err(Some(KernelError::Query(_)))
        ));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_migrate_dry_run_reports_plan_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RecipeKernelApi::new(db_path.clone());

        let plan = api.migrate(true)?;
        assert!(plan.dry_run);
        assert_eq!(plan.current_version, 0);
        assert_eq!(plan.would_apply_versions, vec![1]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_unknown_supplied_item_is_a_validation_error() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RecipeKernelApi::new(db_path.clone());
        let pantry = seed(&api)?;
        let recipe = api.add_recipe(AddRecipeRequest {
            name: "apple only".to_string(),
            slots: vec![SlotSpec::item(pantry.apple.item_id)],
        })?;

        let stray = ItemId::new();
        let err = match api.best_match(BestMatchRequest {
            item_ids: vec![stray],
            strategy: LookupStrategy::Indexed,
            policy: MatchPolicy::Greedy,
        }) {
            Ok(result) => panic!("unknown item matched: {result:?}"),
            Err(err) => err,
        };
        assert!(matches!(kernel_error(&err), Some(KernelError::Validation(_))));

        let err = match api.confirm(ConfirmRequest {
            recipe_id: recipe.recipe_id(),
            item_ids: vec![stray],
            policy: MatchPolicy::Greedy,
        }) {
            Ok(result) => panic!("unknown item confirmed: {result:?}"),
            Err(err) => err,
        };
        assert!(matches!(kernel_error(&err), Some(KernelError::Validation(_))));

        assert!(api.integrity_check()?.is_clean());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn snapshot_id_ignores_catalog_order() -> Result<()> {
        let first = RecipeTemplate::with_targets("a", [SlotTarget::Item(ItemId::new())])?;
        let second = RecipeTemplate::with_targets("b", [SlotTarget::Category(CategoryId::new())])?;

        let forward = compute_snapshot_id(&[first.clone(), second.clone()]);
        let backward = compute_snapshot_id(&[second, first]);
        assert_eq!(forward, backward);
        assert_ne!(forward, compute_snapshot_id(&[]));
        Ok(())
    }
}
