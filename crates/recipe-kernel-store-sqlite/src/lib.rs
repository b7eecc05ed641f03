use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use recipe_kernel_core::{
    check_capacity, Catalog, Category, CategoryId, Item, ItemId, KernelError, RecipeId,
    RecipeTemplate, Slot, SlotChange, SlotCounts, SlotId, SlotTarget,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS categories (
  category_id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE CHECK (length(name) BETWEEN 1 AND 50),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS items (
  item_id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE CHECK (length(name) BETWEEN 1 AND 50),
  category_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(name, category_id),
  FOREIGN KEY (category_id) REFERENCES categories(category_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS recipe_templates (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  recipe_id TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL UNIQUE CHECK (length(name) BETWEEN 1 AND 50),
  item_slot_count INTEGER NOT NULL DEFAULT 0 CHECK (item_slot_count >= 0),
  category_slot_count INTEGER NOT NULL DEFAULT 0 CHECK (category_slot_count >= 0),
  created_at TEXT NOT NULL,
  CHECK (item_slot_count + category_slot_count <= 5)
);

CREATE TABLE IF NOT EXISTS recipe_slots (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  slot_id TEXT NOT NULL UNIQUE,
  recipe_id TEXT NOT NULL,
  item_id TEXT,
  category_id TEXT,
  CHECK ((item_id IS NULL) <> (category_id IS NULL)),
  FOREIGN KEY (recipe_id) REFERENCES recipe_templates(recipe_id) ON DELETE CASCADE,
  FOREIGN KEY (item_id) REFERENCES items(item_id),
  FOREIGN KEY (category_id) REFERENCES categories(category_id)
);

CREATE INDEX IF NOT EXISTS idx_items_category ON items(category_id);
CREATE INDEX IF NOT EXISTS idx_recipe_slots_recipe ON recipe_slots(recipe_id);
CREATE INDEX IF NOT EXISTS idx_recipe_slots_item ON recipe_slots(item_id);
CREATE INDEX IF NOT EXISTS idx_recipe_slots_category ON recipe_slots(category_id);
CREATE INDEX IF NOT EXISTS idx_recipe_templates_slot_total
  ON recipe_templates((item_slot_count + category_slot_count));
";

const RECOUNT_SLOTS_SQL: &str = r"
UPDATE recipe_templates
SET item_slot_count = (
      SELECT COUNT(*) FROM recipe_slots s
      WHERE s.recipe_id = recipe_templates.recipe_id AND s.item_id IS NOT NULL
    ),
    category_slot_count = (
      SELECT COUNT(*) FROM recipe_slots s
      WHERE s.recipe_id = recipe_templates.recipe_id AND s.category_id IS NOT NULL
    )
";

// ?1 = JSON array of supplied item ids, ?2 = JSON array of their category ids, ?3 = supplied count.
const STRUCTURAL_FILTER_SQL: &str = r"
FROM recipe_templates t
WHERE t.item_slot_count + t.category_slot_count = ?3
  AND NOT EXISTS (
    SELECT 1 FROM recipe_slots s
    WHERE s.recipe_id = t.recipe_id
      AND NOT (s.item_id IS NOT NULL AND s.item_id IN (SELECT value FROM json_each(?1)))
      AND NOT (s.category_id IS NOT NULL AND s.category_id IN (SELECT value FROM json_each(?2)))
  )
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterDrift {
    pub recipe_id: String,
    pub stored: SlotCounts,
    pub live: SlotCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub counter_drift: Vec<CounterDrift>,
    pub malformed_slots: Vec<String>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.counter_drift.is_empty()
            && self.malformed_slots.is_empty()
    }
}

/// One consistent view of the catalog.
///
/// Catalog reads made through the store while a snapshot is open join its transaction, so they
/// all observe the same committed state. Dropping the snapshot without `finish` rolls it back.
pub struct ReadSnapshot<'a> {
    tx: Transaction<'a>,
}

impl ReadSnapshot<'_> {
    /// Close the read transaction.
    ///
    /// # Errors
    /// Returns an error when `SQLite` fails to end the transaction.
    pub fn finish(self) -> Result<()> {
        self.tx.commit().context("failed to finish read snapshot")
    }
}

#[derive(Debug)]
struct TemplateRow {
    recipe_id: RecipeId,
    name: String,
    counts: SlotCounts,
}

impl SqliteStore {
    /// Open a SQLite-backed recipe catalog and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Pin the catalog for several reads.
    ///
    /// # Errors
    /// Returns an error when a transaction is already open or cannot be started.
    pub fn read_snapshot(&self) -> Result<ReadSnapshot<'_>> {
        let tx = self.conn.unchecked_transaction().context("failed to start read snapshot")?;
        Ok(ReadSnapshot { tx })
    }

    fn read_scope(&self) -> Result<Option<Transaction<'_>>> {
        if self.conn.is_autocommit() {
            let tx =
                self.conn.unchecked_transaction().context("failed to start read transaction")?;
            Ok(Some(tx))
        } else {
            Ok(None)
        }
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration_1()?;
            version = current_schema_version(&self.conn)?;
            tracing::info!(version, "applied recipe catalog migration");
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        Ok(())
    }

    /// Persist a new category.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for an invalid or taken name, or a persistence error.
    pub fn add_category(&mut self, name: &str) -> Result<Category> {
        let category = Category::new(name)?;
        if name_taken(&self.conn, "categories", name)? {
            return Err(
                KernelError::Validation(format!("category name `{name}` already exists")).into()
            );
        }

        self.conn
            .execute(
                "INSERT INTO categories(category_id, name, created_at) VALUES (?1, ?2, ?3)",
                params![category.category_id.to_string(), category.name, now_rfc3339()?],
            )
            .context("failed to insert category")?;
        tracing::debug!(category_id = %category.category_id, name = %category.name, "category added");
        Ok(category)
    }

    /// Persist a new item owned by an existing category.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for an invalid or taken name or an unknown category.
    pub fn add_item(&mut self, name: &str, category_id: CategoryId) -> Result<Item> {
        let item = Item::new(name, category_id)?;
        if !target_exists(&self.conn, SlotTarget::Category(category_id))? {
            return Err(KernelError::Validation(format!("unknown category {category_id}")).into());
        }
        if name_taken(&self.conn, "items", name)? {
            return Err(KernelError::Validation(format!("item name `{name}` already exists")).into());
        }

        self.conn
            .execute(
                "INSERT INTO items(item_id, name, category_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    item.item_id.to_string(),
                    item.name,
                    item.category_id.to_string(),
                    now_rfc3339()?
                ],
            )
            .context("failed to insert item")?;
        tracing::debug!(item_id = %item.item_id, category_id = %category_id, "item added");
        Ok(item)
    }

    /// Build and persist a template with one slot per target.
    ///
    /// # Errors
    /// Returns the core validation or capacity error, or an error from [`Self::add_template`].
    pub fn add_recipe(&mut self, name: &str, targets: &[SlotTarget]) -> Result<RecipeTemplate> {
        let template = RecipeTemplate::with_targets(name, targets.iter().copied())?;
        self.add_template(&template)?;
        Ok(template)
    }

    /// Persist one template and its slots in a single transaction.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the template is invalid, its id or name is taken,
    /// or a slot references an unknown item or category.
    pub fn add_template(&mut self, template: &RecipeTemplate) -> Result<()> {
        template.validate()?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        if name_taken(&tx, "recipe_templates", template.name())?
            || stored_counts(&tx, template.recipe_id())?.is_some()
        {
            return Err(KernelError::Validation(format!(
                "recipe `{}` already exists",
                template.name()
            ))
            .into());
        }

        tx.execute(
            "INSERT INTO recipe_templates(recipe_id, name, created_at) VALUES (?1, ?2, ?3)",
            params![template.recipe_id().to_string(), template.name(), now_rfc3339()?],
        )
        .context("failed to insert recipe template")?;

        for slot in template.slots() {
            insert_slot(&tx, template.recipe_id(), slot)?;
        }

        let counts = recount_slots(&tx, template.recipe_id())?;
        if counts != template.counts() {
            return Err(anyhow!(
                "recipe {} counters disagree after insert: expected {:?}, stored {:?}",
                template.recipe_id(),
                template.counts(),
                counts
            ));
        }

        tx.commit().context("failed to commit recipe transaction")?;
        tracing::debug!(
            recipe_id = %template.recipe_id(),
            item_slots = counts.item_slots,
            category_slots = counts.category_slots,
            "recipe added"
        );
        Ok(())
    }

    /// Load one template with its slots in slot insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or a slot row is malformed.
    pub fn get_recipe(&self, recipe_id: RecipeId) -> Result<Option<RecipeTemplate>> {
        let row = self
            .conn
            .query_row(
                "SELECT recipe_id, name, item_slot_count, category_slot_count
                 FROM recipe_templates WHERE recipe_id = ?1",
                params![recipe_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .context("failed to read recipe template")?;

        let Some(raw) = row else {
            return Ok(None);
        };
        let row = template_row(raw)?;
        let slots = load_slots(&self.conn, row.recipe_id)?;
        hydrate(row, slots).map(Some)
    }

    /// List categories in insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_categories(&self) -> Result<Vec<Category>> {
        let mut stmt =
            self.conn.prepare("SELECT category_id, name FROM categories ORDER BY rowid ASC")?;
        let mut rows = stmt.query([])?;
        let mut categories = Vec::new();

        while let Some(row) = rows.next()? {
            categories.push(Category {
                category_id: parse_id(&row.get::<_, String>(0)?)?,
                name: row.get(1)?,
            });
        }

        Ok(categories)
    }

    /// List items in insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_items(&self) -> Result<Vec<Item>> {
        let mut stmt = self
            .conn
            .prepare("SELECT item_id, name, category_id FROM items ORDER BY rowid ASC")?;
        let mut rows = stmt.query([])?;
        let mut items = Vec::new();

        while let Some(row) = rows.next()? {
            items.push(Item {
                item_id: parse_id(&row.get::<_, String>(0)?)?,
                name: row.get(1)?,
                category_id: parse_id(&row.get::<_, String>(2)?)?,
            });
        }

        Ok(items)
    }

    /// Resolve item ids to items, preserving input order and repeats.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for an unknown item id.
    pub fn get_items(&self, item_ids: &[ItemId]) -> Result<Vec<Item>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT name, category_id FROM items WHERE item_id = ?1")?;
        let mut items = Vec::with_capacity(item_ids.len());

        for item_id in item_ids {
            let row = stmt
                .query_row(params![item_id.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .optional()
                .context("failed to read item")?;
            let Some((name, category_id)) = row else {
                return Err(KernelError::Validation(format!("unknown item {item_id}")).into());
            };
            items.push(Item { item_id: *item_id, name, category_id: parse_id(&category_id)? });
        }

        Ok(items)
    }

    /// Delete a template; its slots cascade.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_recipe(&mut self, recipe_id: RecipeId) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM recipe_templates WHERE recipe_id = ?1",
                params![recipe_id.to_string()],
            )
            .context("failed to delete recipe template")?;
        Ok(deleted > 0)
    }

    /// Delete a category and its items. Slots naming the category or any of its items are removed
    /// and every template's counters are recomputed in the same transaction.
    ///
    /// # Errors
    /// Returns an error when any step of the transaction fails.
    pub fn delete_category(&mut self, category_id: CategoryId) -> Result<bool> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let category = category_id.to_string();

        let dropped_slots = tx
            .execute(
                "DELETE FROM recipe_slots
                 WHERE category_id = ?1
                    OR item_id IN (SELECT item_id FROM items WHERE category_id = ?1)",
                params![category],
            )
            .context("failed to delete dependent slots")?;
        tx.execute(RECOUNT_SLOTS_SQL, []).context("failed to recompute slot counters")?;
        let deleted = tx
            .execute("DELETE FROM categories WHERE category_id = ?1", params![category])
            .context("failed to delete category")?;

        tx.commit().context("failed to commit category delete")?;
        tracing::debug!(%category_id, dropped_slots, "category deleted");
        Ok(deleted > 0)
    }

    /// Apply one slot membership change to a stored template.
    ///
    /// Capacity is checked against the stored counters before any row is written, and both
    /// counters are recomputed from live slot rows before the transaction commits. A rejected
    /// change leaves rows and counters untouched.
    ///
    /// # Errors
    /// Returns [`KernelError::Query`] for an unknown recipe,
    /// [`KernelError::SlotCapacityExceeded`], [`KernelError::UnknownSlot`],
    /// [`KernelError::Validation`] for an unknown target or reused slot id, or a persistence error.
    pub fn apply_slot_change(
        &mut self,
        recipe_id: RecipeId,
        change: &SlotChange,
    ) -> Result<SlotCounts> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start slot transaction")?;

        let current = stored_counts(&tx, recipe_id)?
            .ok_or_else(|| KernelError::Query(format!("unknown recipe {recipe_id}")))?;
        if let Err(err) = check_capacity(recipe_id, current, change.pending_additions()) {
            tracing::warn!(
                %recipe_id,
                present = current.total(),
                requested = change.pending_additions(),
                "slot change rejected"
            );
            return Err(err.into());
        }

        match change {
            SlotChange::AddOne(_) | SlotChange::AddMany(_) => {
                for slot in change.added_slots() {
                    insert_slot(&tx, recipe_id, slot)?;
                }
            }
            SlotChange::Remove(slot_ids) => {
                for slot_id in slot_ids.iter().collect::<BTreeSet<_>>() {
                    let removed = tx
                        .execute(
                            "DELETE FROM recipe_slots WHERE recipe_id = ?1 AND slot_id = ?2",
                            params![recipe_id.to_string(), slot_id.to_string()],
                        )
                        .context("failed to delete recipe slot")?;
                    if removed == 0 {
                        return Err(KernelError::UnknownSlot { recipe_id, slot_id: *slot_id }.into());
                    }
                }
            }
            SlotChange::Clear => {
                tx.execute(
                    "DELETE FROM recipe_slots WHERE recipe_id = ?1",
                    params![recipe_id.to_string()],
                )
                .context("failed to clear recipe slots")?;
            }
        }

        let counts = recount_slots(&tx, recipe_id)?;
        tx.commit().context("failed to commit slot transaction")?;

        tracing::debug!(
            %recipe_id,
            change = change.kind().as_str(),
            item_slots = counts.item_slots,
            category_slots = counts.category_slots,
            "slot change applied"
        );
        Ok(counts)
    }

    /// Add one slot for `target`.
    ///
    /// # Errors
    /// See [`Self::apply_slot_change`].
    pub fn add_slot(&mut self, recipe_id: RecipeId, target: SlotTarget) -> Result<Slot> {
        let slot = Slot::new(target);
        self.apply_slot_change(recipe_id, &SlotChange::AddOne(slot))?;
        Ok(slot)
    }

    /// Add one slot per target as a single all-or-nothing change.
    ///
    /// # Errors
    /// See [`Self::apply_slot_change`].
    pub fn add_slots(&mut self, recipe_id: RecipeId, targets: &[SlotTarget]) -> Result<Vec<Slot>> {
        let slots = targets.iter().copied().map(Slot::new).collect::<Vec<_>>();
        self.apply_slot_change(recipe_id, &SlotChange::AddMany(slots.clone()))?;
        Ok(slots)
    }

    /// Remove the named slots as a single all-or-nothing change.
    ///
    /// # Errors
    /// See [`Self::apply_slot_change`].
    pub fn remove_slots(&mut self, recipe_id: RecipeId, slot_ids: &[SlotId]) -> Result<SlotCounts> {
        self.apply_slot_change(recipe_id, &SlotChange::Remove(slot_ids.to_vec()))
    }

    /// Remove every slot of a template.
    ///
    /// # Errors
    /// See [`Self::apply_slot_change`].
    pub fn clear_slots(&mut self, recipe_id: RecipeId) -> Result<SlotCounts> {
        self.apply_slot_change(recipe_id, &SlotChange::Clear)
    }

    /// Count templates passing the structural filter, without loading them.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn count_structural_candidates(&self, supplied: &[Item]) -> Result<usize> {
        let (item_ids, category_ids, supplied_count) = structural_params(supplied)?;
        let count = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) {STRUCTURAL_FILTER_SQL}"),
                params![item_ids, category_ids, supplied_count],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count structural candidates")?;
        sql_count(count)
    }

    /// Run storage health checks: `SQLite` quick check, foreign keys, counter drift and
    /// malformed slot rows.
    ///
    /// # Errors
    /// Returns an error when any check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let (counter_drift, malformed_slots) = if schema_status.pending_versions.is_empty() {
            (self.counter_drift()?, self.malformed_slot_ids()?)
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            counter_drift,
            malformed_slots,
            schema_status,
        })
    }

    fn counter_drift(&self) -> Result<Vec<CounterDrift>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.recipe_id, t.item_slot_count, t.category_slot_count,
                    (SELECT COUNT(*) FROM recipe_slots s
                     WHERE s.recipe_id = t.recipe_id AND s.item_id IS NOT NULL),
                    (SELECT COUNT(*) FROM recipe_slots s
                     WHERE s.recipe_id = t.recipe_id AND s.category_id IS NOT NULL)
             FROM recipe_templates t
             ORDER BY t.id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut drift = Vec::new();

        while let Some(row) = rows.next()? {
            let stored = SlotCounts {
                item_slots: sql_count(row.get(1)?)?,
                category_slots: sql_count(row.get(2)?)?,
            };
            let live = SlotCounts {
                item_slots: sql_count(row.get(3)?)?,
                category_slots: sql_count(row.get(4)?)?,
            };
            if stored != live {
                drift.push(CounterDrift { recipe_id: row.get(0)?, stored, live });
            }
        }

        Ok(drift)
    }

    fn malformed_slot_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT slot_id FROM recipe_slots
             WHERE (item_id IS NULL) = (category_id IS NULL)
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut slot_ids = Vec::new();
        for row in rows {
            slot_ids.push(row?);
        }
        Ok(slot_ids)
    }
}

impl Catalog for SqliteStore {
    type Error = anyhow::Error;

    fn list_templates(&self) -> Result<Vec<RecipeTemplate>> {
        let scope = self.read_scope()?;

        let mut slots_by_recipe: BTreeMap<RecipeId, Vec<Slot>> = BTreeMap::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT recipe_id, slot_id, item_id, category_id FROM recipe_slots ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let recipe_id = parse_id::<RecipeId>(&row.get::<_, String>(0)?)?;
                let slot = slot_row(
                    &row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                )?;
                slots_by_recipe.entry(recipe_id).or_default().push(slot);
            }
        }

        let mut templates = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT recipe_id, name, item_slot_count, category_slot_count
                 FROM recipe_templates ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let header = template_row((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))?;
                let slots = slots_by_recipe.remove(&header.recipe_id).unwrap_or_default();
                templates.push(hydrate(header, slots)?);
            }
        }

        finish_read_scope(scope)?;
        Ok(templates)
    }

    fn list_slots(&self, recipe_id: RecipeId) -> Result<Vec<Slot>> {
        if stored_counts(&self.conn, recipe_id)?.is_none() {
            return Err(KernelError::Query(format!("unknown recipe {recipe_id}")).into());
        }
        load_slots(&self.conn, recipe_id)
    }

    fn structural_candidates(&self, supplied: &[Item]) -> Result<Vec<RecipeTemplate>> {
        let (item_ids, category_ids, supplied_count) = structural_params(supplied)?;
        let scope = self.read_scope()?;

        let mut headers = Vec::new();
        {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT t.recipe_id, t.name, t.item_slot_count, t.category_slot_count
                 {STRUCTURAL_FILTER_SQL}
                 ORDER BY t.item_slot_count DESC, t.id ASC"
            ))?;
            let mut rows = stmt.query(params![item_ids, category_ids, supplied_count])?;
            while let Some(row) = rows.next()? {
                headers.push(template_row((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))?);
            }
        }

        let mut templates = Vec::with_capacity(headers.len());
        for header in headers {
            let slots = load_slots(&self.conn, header.recipe_id)?;
            templates.push(hydrate(header, slots)?);
        }

        finish_read_scope(scope)?;
        tracing::trace!(candidates = templates.len(), supplied = supplied.len(), "structural filter");
        Ok(templates)
    }
}

fn finish_read_scope(scope: Option<Transaction<'_>>) -> Result<()> {
    match scope {
        Some(tx) => tx.commit().context("failed to finish read transaction"),
        None => Ok(()),
    }
}

fn structural_params(supplied: &[Item]) -> Result<(String, String, i64)> {
    let item_ids = supplied.iter().map(|item| item.item_id.to_string()).collect::<Vec<_>>();
    let category_ids =
        supplied.iter().map(|item| item.category_id.to_string()).collect::<BTreeSet<_>>();
    Ok((
        serde_json::to_string(&item_ids).context("failed to encode supplied item ids")?,
        serde_json::to_string(&category_ids).context("failed to encode supplied category ids")?,
        i64::try_from(supplied.len()).context("supplied multiset is too large")?,
    ))
}

fn insert_slot(conn: &Connection, recipe_id: RecipeId, slot: &Slot) -> Result<()> {
    if !target_exists(conn, slot.target)? {
        return Err(KernelError::Validation(format!(
            "slot {} references unknown {}",
            slot.slot_id,
            slot.target.kind().as_str()
        ))
        .into());
    }
    let slot_taken = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM recipe_slots WHERE slot_id = ?1)",
            params![slot.slot_id.to_string()],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to check slot id")?;
    if slot_taken == 1 {
        return Err(KernelError::Validation(format!("slot {} already exists", slot.slot_id)).into());
    }

    conn.execute(
        "INSERT INTO recipe_slots(slot_id, recipe_id, item_id, category_id) VALUES (?1, ?2, ?3, ?4)",
        params![
            slot.slot_id.to_string(),
            recipe_id.to_string(),
            slot.target.item_id().map(|item_id| item_id.to_string()),
            slot.target.category_id().map(|category_id| category_id.to_string()),
        ],
    )
    .context("failed to insert recipe slot")?;
    Ok(())
}

fn recount_slots(conn: &Connection, recipe_id: RecipeId) -> Result<SlotCounts> {
    conn.execute(
        &format!("{RECOUNT_SLOTS_SQL} WHERE recipe_id = ?1"),
        params![recipe_id.to_string()],
    )
    .context("failed to recompute slot counters")?;
    stored_counts(conn, recipe_id)?
        .ok_or_else(|| anyhow!("recipe {recipe_id} disappeared during slot update"))
}

fn stored_counts(conn: &Connection, recipe_id: RecipeId) -> Result<Option<SlotCounts>> {
    let row = conn
        .query_row(
            "SELECT item_slot_count, category_slot_count FROM recipe_templates WHERE recipe_id = ?1",
            params![recipe_id.to_string()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()
        .context("failed to read slot counters")?;

    match row {
        Some((item_slots, category_slots)) => Ok(Some(SlotCounts {
            item_slots: sql_count(item_slots)?,
            category_slots: sql_count(category_slots)?,
        })),
        None => Ok(None),
    }
}

fn load_slots(conn: &Connection, recipe_id: RecipeId) -> Result<Vec<Slot>> {
    let mut stmt = conn.prepare_cached(
        "SELECT slot_id, item_id, category_id FROM recipe_slots WHERE recipe_id = ?1 ORDER BY id ASC",
    )?;
    let mut rows = stmt.query(params![recipe_id.to_string()])?;
    let mut slots = Vec::new();

    while let Some(row) = rows.next()? {
        slots.push(slot_row(
            &row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Option<String>>(2)?,
        )?);
    }

    Ok(slots)
}

fn slot_row(
    slot_id: &str,
    item_id: Option<String>,
    category_id: Option<String>,
) -> Result<Slot> {
    let slot_id = parse_id::<SlotId>(slot_id)?;
    let item_id = item_id.as_deref().map(parse_id::<ItemId>).transpose()?;
    let category_id = category_id.as_deref().map(parse_id::<CategoryId>).transpose()?;
    Ok(Slot::from_parts(slot_id, item_id, category_id)?)
}

fn template_row(raw: (String, String, i64, i64)) -> Result<TemplateRow> {
    let (recipe_id, name, item_slots, category_slots) = raw;
    Ok(TemplateRow {
        recipe_id: parse_id(&recipe_id)?,
        name,
        counts: SlotCounts {
            item_slots: sql_count(item_slots)?,
            category_slots: sql_count(category_slots)?,
        },
    })
}

fn hydrate(row: TemplateRow, slots: Vec<Slot>) -> Result<RecipeTemplate> {
    Ok(RecipeTemplate::from_stored(row.recipe_id, row.name, slots, row.counts)?)
}

fn target_exists(conn: &Connection, target: SlotTarget) -> Result<bool> {
    let exists = match target {
        SlotTarget::Item(item_id) => conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM items WHERE item_id = ?1)",
            params![item_id.to_string()],
            |row| row.get::<_, i64>(0),
        ),
        SlotTarget::Category(category_id) => conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM categories WHERE category_id = ?1)",
            params![category_id.to_string()],
            |row| row.get::<_, i64>(0),
        ),
    }
    .context("failed to check slot target")?;
    Ok(exists == 1)
}

fn name_taken(conn: &Connection, table_name: &str, name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {table_name} WHERE name = ?1)"),
            params![name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check name uniqueness in {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn sql_count(value: i64) -> Result<usize> {
    usize::try_from(value).with_context(|| format!("invalid stored count: {value}"))
}

fn parse_id<T>(raw: &str) -> Result<T>
where
    T: FromStr<Err = KernelError>,
{
    raw.parse::<T>().with_context(|| format!("invalid ULID: {raw}"))
}
