use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_rk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_rk"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "rk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

struct Pantry {
    db: PathBuf,
    fruit: String,
    dairy: String,
    apple: String,
    pear: String,
    milk: String,
}

impl Pantry {
    fn rk(&self, args: &[&str]) -> Value {
        let mut full = vec!["--db", path_str(&self.db)];
        full.extend_from_slice(args);
        run_json(full)
    }

    fn rk_output(&self, args: &[&str]) -> Output {
        let mut full = vec!["--db", path_str(&self.db)];
        full.extend_from_slice(args);
        run_rk(full)
    }
}

fn seeded_pantry(prefix: &str) -> Pantry {
    let dir = unique_temp_dir(prefix);
    let db = dir.join("recipe_kernel.sqlite3");
    let mut pantry = Pantry {
        db,
        fruit: String::new(),
        dairy: String::new(),
        apple: String::new(),
        pear: String::new(),
        milk: String::new(),
    };

    pantry.fruit =
        as_str(&pantry.rk(&["catalog", "add-category", "--name", "fruit"]), "category_id")
            .to_string();
    pantry.dairy =
        as_str(&pantry.rk(&["catalog", "add-category", "--name", "dairy"]), "category_id")
            .to_string();
    let fruit = pantry.fruit.clone();
    let dairy = pantry.dairy.clone();
    pantry.apple = as_str(
        &pantry.rk(&["catalog", "add-item", "--name", "apple", "--category", &fruit]),
        "item_id",
    )
    .to_string();
    pantry.pear = as_str(
        &pantry.rk(&["catalog", "add-item", "--name", "pear", "--category", &fruit]),
        "item_id",
    )
    .to_string();
    pantry.milk = as_str(
        &pantry.rk(&["catalog", "add-item", "--name", "milk", "--category", &dairy]),
        "item_id",
    )
    .to_string();
    pantry
}

fn cleanup(pantry: &Pantry) {
    if let Some(dir) = pantry.db.parent() {
        let _ = fs::remove_dir_all(dir);
    }
}

#[test]
fn cli_schema_version_and_migrate_report_contract() {
    let dir = unique_temp_dir("recipekernel-cli-schema");
    let db = dir.join("recipe_kernel.sqlite3");
    let db_arg = path_str(&db);

    let status = run_json(["--db", db_arg, "db", "schema-version"]);
    assert_eq!(as_str(&status, "contract_version"), "cli.v1");
    assert_eq!(as_i64(&status, "current_version"), 0);

    let plan = run_json(["--db", db_arg, "db", "migrate", "--dry-run"]);
    assert_eq!(plan.get("dry_run"), Some(&Value::Bool(true)));
    assert_eq!(plan.get("would_apply_versions"), Some(&serde_json::json!([1])));

    let applied = run_json(["--db", db_arg, "db", "migrate"]);
    assert_eq!(as_i64(&applied, "after_version"), 1);
    assert_eq!(applied.get("up_to_date"), Some(&Value::Bool(true)));

    let integrity = run_json(["--db", db_arg, "db", "integrity-check"]);
    assert_eq!(integrity.get("clean"), Some(&Value::Bool(true)));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn cli_exact_recipe_confirms_and_rejects_duplicates() {
    let pantry = seeded_pantry("recipekernel-cli-exact");
    let recipe = pantry.rk(&[
        "recipe", "add", "--name", "apple milk", "--item", &pantry.apple, "--item", &pantry.milk,
    ]);
    let recipe_id = as_str(&recipe, "recipe_id").to_string();
    assert_eq!(as_i64(&recipe, "item_slot_count"), 2);
    assert_eq!(as_i64(&recipe, "category_slot_count"), 0);

    let confirmed = pantry.rk(&[
        "match", "confirm", "--recipe", &recipe_id, "--item", &pantry.milk, "--item", &pantry.apple,
    ]);
    assert_eq!(confirmed.get("confirmed"), Some(&Value::Bool(true)));

    let duplicate = pantry.rk(&[
        "match", "confirm", "--recipe", &recipe_id, "--item", &pantry.apple, "--item", &pantry.apple,
    ]);
    assert_eq!(duplicate.get("confirmed"), Some(&Value::Bool(false)));

    let extra = pantry.rk(&[
        "match", "confirm", "--recipe", &recipe_id, "--item", &pantry.apple, "--item", &pantry.milk,
        "--item", &pantry.pear,
    ]);
    assert_eq!(extra.get("confirmed"), Some(&Value::Bool(false)));

    cleanup(&pantry);
}

#[test]
fn cli_best_match_agrees_across_strategies() {
    let pantry = seeded_pantry("recipekernel-cli-best");
    let wildcard = pantry.rk(&[
        "recipe", "add", "--name", "fruit and dairy", "--category", &pantry.fruit, "--category",
        &pantry.dairy,
    ]);
    let wildcard_id = as_str(&wildcard, "recipe_id").to_string();

    for strategy in ["brute-force", "indexed"] {
        let best = pantry.rk(&[
            "match", "best", "--item", &pantry.pear, "--item", &pantry.milk, "--strategy", strategy,
        ]);
        assert_eq!(as_str(&best, "matched_recipe_id"), wildcard_id);
        assert!(as_str(&best, "catalog_snapshot_id").starts_with("snap_"));
        let report = best.get("report").unwrap_or_else(|| panic!("missing report: {best}"));
        assert_eq!(
            report.get("tie_breakers"),
            Some(&serde_json::json!(["item_slot_count desc", "catalog_order asc"]))
        );

        let none = pantry.rk(&[
            "match", "best", "--item", &pantry.apple, "--item", &pantry.pear, "--strategy", strategy,
        ]);
        assert_eq!(none.get("matched_recipe_id"), Some(&Value::Null));
    }

    cleanup(&pantry);
}

#[test]
fn cli_slot_capacity_and_unknown_slot_fail_without_changes() {
    let pantry = seeded_pantry("recipekernel-cli-capacity");
    let recipe = pantry.rk(&[
        "recipe", "add", "--name", "crowded", "--item", &pantry.apple, "--item", &pantry.pear,
        "--item", &pantry.milk, "--category", &pantry.fruit, "--category", &pantry.dairy,
    ]);
    let recipe_id = as_str(&recipe, "recipe_id").to_string();

    let overflow = pantry.rk_output(&["recipe", "add-slot", "--recipe", &recipe_id, "--item", &pantry.apple]);
    assert!(!overflow.status.success());
    let stderr = String::from_utf8_lossy(&overflow.stderr);
    assert!(stderr.contains("slot capacity exceeded"), "unexpected stderr: {stderr}");

    let stray = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    let unknown = pantry.rk_output(&["recipe", "remove-slot", "--recipe", &recipe_id, "--slot", stray]);
    assert!(!unknown.status.success());

    let shown = pantry.rk(&["recipe", "show", "--recipe", &recipe_id]);
    assert_eq!(as_i64(&shown, "item_slot_count"), 3);
    assert_eq!(as_i64(&shown, "category_slot_count"), 2);

    let cleared = pantry.rk(&["recipe", "clear", "--recipe", &recipe_id]);
    assert_eq!(as_str(&cleared, "change"), "clear");
    let recipe = cleared.get("recipe").unwrap_or_else(|| panic!("missing recipe: {cleared}"));
    assert_eq!(recipe.get("slots"), Some(&serde_json::json!([])));
    assert_eq!(as_i64(recipe, "item_slot_count"), 0);

    cleanup(&pantry);
}

#[test]
fn cli_catalog_list_preserves_insertion_order() {
    let pantry = seeded_pantry("recipekernel-cli-list");
    let listing = pantry.rk(&["catalog", "list"]);

    let names = listing
        .get("items")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing items array: {listing}"))
        .iter()
        .map(|item| as_str(item, "name").to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["apple", "pear", "milk"]);
    assert_eq!(listing.get("recipes"), Some(&serde_json::json!([])));

    let bad = pantry.rk_output(&["catalog", "add-item", "--name", "plum", "--category", "not-a-ulid"]);
    assert!(!bad.status.success());

    cleanup(&pantry);
}

#[test]
fn cli_slot_flags_keep_command_line_order() {
    let pantry = seeded_pantry("recipekernel-cli-order");
    let recipe = pantry.rk(&[
        "recipe", "add", "--name", "any fruit then apple", "--category", &pantry.fruit, "--item",
        &pantry.apple,
    ]);
    let recipe_id = as_str(&recipe, "recipe_id").to_string();

    let slots = recipe
        .get("slots")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing slots array: {recipe}"));
    assert_eq!(slots.len(), 2);
    assert_eq!(as_str(&slots[0], "category_id"), pantry.fruit);
    assert_eq!(slots[0].get("item_id"), Some(&Value::Null));
    assert_eq!(as_str(&slots[1], "item_id"), pantry.apple);

    let shown = pantry.rk(&["recipe", "show", "--recipe", &recipe_id]);
    assert_eq!(shown.get("slots"), recipe.get("slots"));

    let greedy = pantry.rk(&[
        "match", "confirm", "--recipe", &recipe_id, "--item", &pantry.apple, "--item", &pantry.pear,
    ]);
    assert_eq!(greedy.get("confirmed"), Some(&Value::Bool(false)));

    let exhaustive = pantry.rk(&[
        "match", "confirm", "--recipe", &recipe_id, "--item", &pantry.apple, "--item", &pantry.pear,
        "--policy", "exhaustive",
    ]);
    assert_eq!(exhaustive.get("confirmed"), Some(&Value::Bool(true)));

    let extended = pantry.rk(&[
        "recipe", "add-slot", "--recipe", &recipe_id, "--item", &pantry.milk, "--category",
        &pantry.dairy, "--item", &pantry.pear,
    ]);
    let added = extended
        .get("recipe")
        .and_then(|recipe| recipe.get("slots"))
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing recipe slots: {extended}"));
    assert_eq!(as_str(&added[2], "item_id"), pantry.milk);
    assert_eq!(as_str(&added[3], "category_id"), pantry.dairy);
    assert_eq!(as_str(&added[4], "item_id"), pantry.pear);

    cleanup(&pantry);
}
