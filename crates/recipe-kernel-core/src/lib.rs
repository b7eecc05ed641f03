use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Upper bound on the number of slots a recipe template may hold.
pub const MAX_SLOTS: usize = 5;

/// Upper bound on category, item, and recipe display names.
pub const MAX_NAME_LEN: usize = 50;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("malformed slot {}: {reason}", describe_slot_id(.slot_id))]
    MalformedSlot { slot_id: Option<SlotId>, reason: MalformedSlotReason },
    #[error(
        "slot capacity exceeded for recipe {recipe_id}: {current} present + {requested} requested > {capacity}"
    )]
    SlotCapacityExceeded { recipe_id: RecipeId, current: usize, requested: usize, capacity: usize },
    #[error("recipe {recipe_id} has no slot {slot_id}")]
    UnknownSlot { recipe_id: RecipeId, slot_id: SlotId },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("query error: {0}")]
    Query(String),
}

fn describe_slot_id(slot_id: &Option<SlotId>) -> String {
    match slot_id {
        Some(slot_id) => slot_id.to_string(),
        None => "<unidentified>".to_string(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MalformedSlotReason {
    BothSet,
    NeitherSet,
}

impl Display for MalformedSlotReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BothSet => f.write_str("only one of item and category can be set"),
            Self::NeitherSet => f.write_str("at least one of item and category must be set"),
        }
    }
}

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = KernelError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(value).map(Self).map_err(|err| {
                    KernelError::Validation(format!("invalid {} `{value}`: {err}", $label))
                })
            }
        }
    };
}

ulid_id!(CategoryId, "category_id");
ulid_id!(ItemId, "item_id");
ulid_id!(RecipeId, "recipe_id");
ulid_id!(SlotId, "slot_id");

/// Validate one catalog display name.
///
/// # Errors
/// Returns [`KernelError::Validation`] when the name is blank or longer than [`MAX_NAME_LEN`].
pub fn validate_name(kind: &str, name: &str) -> Result<(), KernelError> {
    if name.trim().is_empty() {
        return Err(KernelError::Validation(format!("{kind} name MUST be non-empty")));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(KernelError::Validation(format!(
            "{kind} name MUST be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Category {
    pub category_id: CategoryId,
    pub name: String,
}

impl Category {
    /// Build a category with a fresh identifier.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the name is invalid.
    pub fn new(name: impl Into<String>) -> Result<Self, KernelError> {
        let name = name.into();
        validate_name("category", &name)?;
        Ok(Self { category_id: CategoryId::new(), name })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Item {
    pub item_id: ItemId,
    pub name: String,
    pub category_id: CategoryId,
}

impl Item {
    /// Build an item owned by `category_id` with a fresh identifier.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the name is invalid.
    pub fn new(name: impl Into<String>, category_id: CategoryId) -> Result<Self, KernelError> {
        let name = name.into();
        validate_name("item", &name)?;
        Ok(Self { item_id: ItemId::new(), name, category_id })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Item,
    Category,
}

impl SlotKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Item => "item",
            Self::Category => "category",
        }
    }
}

/// What a slot accepts: one specific item, or any item of one category.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum SlotTarget {
    Item(ItemId),
    Category(CategoryId),
}

impl SlotTarget {
    /// Decode a slot target from its two-nullable-column representation.
    ///
    /// # Errors
    /// Returns [`KernelError::MalformedSlot`] when both or neither of the parts are set.
    pub fn from_parts(
        item_id: Option<ItemId>,
        category_id: Option<CategoryId>,
    ) -> Result<Self, KernelError> {
        decode_target(None, item_id, category_id)
    }

    #[must_use]
    pub fn kind(self) -> SlotKind {
        match self {
            Self::Item(_) => SlotKind::Item,
            Self::Category(_) => SlotKind::Category,
        }
    }

    #[must_use]
    pub fn item_id(self) -> Option<ItemId> {
        match self {
            Self::Item(item_id) => Some(item_id),
            Self::Category(_) => None,
        }
    }

    #[must_use]
    pub fn category_id(self) -> Option<CategoryId> {
        match self {
            Self::Item(_) => None,
            Self::Category(category_id) => Some(category_id),
        }
    }

    /// Whether `item` satisfies this slot. Item slots compare identity, never category.
    #[must_use]
    pub fn matches(self, item: &Item) -> bool {
        match self {
            Self::Item(item_id) => item.item_id == item_id,
            Self::Category(category_id) => item.category_id == category_id,
        }
    }
}

fn decode_target(
    slot_id: Option<SlotId>,
    item_id: Option<ItemId>,
    category_id: Option<CategoryId>,
) -> Result<SlotTarget, KernelError> {
    match (item_id, category_id) {
        (Some(item_id), None) => Ok(SlotTarget::Item(item_id)),
        (None, Some(category_id)) => Ok(SlotTarget::Category(category_id)),
        (Some(_), Some(_)) => {
            Err(KernelError::MalformedSlot { slot_id, reason: MalformedSlotReason::BothSet })
        }
        (None, None) => {
            Err(KernelError::MalformedSlot { slot_id, reason: MalformedSlotReason::NeitherSet })
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(try_from = "SlotParts", into = "SlotParts")]
pub struct Slot {
    pub slot_id: SlotId,
    pub target: SlotTarget,
}

impl Slot {
    #[must_use]
    pub fn new(target: SlotTarget) -> Self {
        Self { slot_id: SlotId::new(), target }
    }

    /// Decode a persisted slot row.
    ///
    /// # Errors
    /// Returns [`KernelError::MalformedSlot`] carrying `slot_id` when both or neither parts are set.
    pub fn from_parts(
        slot_id: SlotId,
        item_id: Option<ItemId>,
        category_id: Option<CategoryId>,
    ) -> Result<Self, KernelError> {
        let target = decode_target(Some(slot_id), item_id, category_id)?;
        Ok(Self { slot_id, target })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SlotParts {
    slot_id: SlotId,
    item_id: Option<ItemId>,
    category_id: Option<CategoryId>,
}

impl TryFrom<SlotParts> for Slot {
    type Error = KernelError;

    fn try_from(parts: SlotParts) -> Result<Self, Self::Error> {
        Self::from_parts(parts.slot_id, parts.item_id, parts.category_id)
    }
}

impl From<Slot> for SlotParts {
    fn from(slot: Slot) -> Self {
        Self {
            slot_id: slot.slot_id,
            item_id: slot.target.item_id(),
            category_id: slot.target.category_id(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct SlotCounts {
    pub item_slots: usize,
    pub category_slots: usize,
}

impl SlotCounts {
    #[must_use]
    pub fn from_slots(slots: &[Slot]) -> Self {
        slots.iter().fold(Self::default(), |mut counts, slot| {
            match slot.target.kind() {
                SlotKind::Item => counts.item_slots += 1,
                SlotKind::Category => counts.category_slots += 1,
            }
            counts
        })
    }

    #[must_use]
    pub fn total(self) -> usize {
        self.item_slots + self.category_slots
    }
}

/// Reject an addition of `pending` slots that would push `current` above [`MAX_SLOTS`].
///
/// # Errors
/// Returns [`KernelError::SlotCapacityExceeded`] when the addition does not fit.
pub fn check_capacity(
    recipe_id: RecipeId,
    current: SlotCounts,
    pending: usize,
) -> Result<(), KernelError> {
    if current.total() + pending > MAX_SLOTS {
        return Err(KernelError::SlotCapacityExceeded {
            recipe_id,
            current: current.total(),
            requested: pending,
            capacity: MAX_SLOTS,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SlotChangeKind {
    AddOne,
    AddMany,
    Remove,
    Clear,
}

impl SlotChangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddOne => "add_one",
            Self::AddMany => "add_many",
            Self::Remove => "remove",
            Self::Clear => "clear",
        }
    }
}

/// One membership change to a template's slot collection.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SlotChange {
    AddOne(Slot),
    AddMany(Vec<Slot>),
    Remove(Vec<SlotId>),
    Clear,
}

impl SlotChange {
    #[must_use]
    pub fn kind(&self) -> SlotChangeKind {
        match self {
            Self::AddOne(_) => SlotChangeKind::AddOne,
            Self::AddMany(_) => SlotChangeKind::AddMany,
            Self::Remove(_) => SlotChangeKind::Remove,
            Self::Clear => SlotChangeKind::Clear,
        }
    }

    #[must_use]
    pub fn pending_additions(&self) -> usize {
        match self {
            Self::AddOne(_) => 1,
            Self::AddMany(slots) => slots.len(),
            Self::Remove(_) | Self::Clear => 0,
        }
    }

    /// Slot ids named by the change. `Clear` names none; it affects every slot.
    #[must_use]
    pub fn affected_slot_ids(&self) -> Vec<SlotId> {
        match self {
            Self::AddOne(slot) => vec![slot.slot_id],
            Self::AddMany(slots) => slots.iter().map(|slot| slot.slot_id).collect(),
            Self::Remove(slot_ids) => slot_ids.clone(),
            Self::Clear => Vec::new(),
        }
    }

    #[must_use]
    pub fn added_slots(&self) -> &[Slot] {
        match self {
            Self::AddOne(slot) => std::slice::from_ref(slot),
            Self::AddMany(slots) => slots,
            Self::Remove(_) | Self::Clear => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(try_from = "RecipeTemplateParts")]
pub struct RecipeTemplate {
    recipe_id: RecipeId,
    name: String,
    slots: Vec<Slot>,
    item_slot_count: usize,
    category_slot_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct RecipeTemplateParts {
    recipe_id: RecipeId,
    name: String,
    #[serde(default)]
    slots: Vec<Slot>,
    item_slot_count: Option<usize>,
    category_slot_count: Option<usize>,
}

impl TryFrom<RecipeTemplateParts> for RecipeTemplate {
    type Error = KernelError;

    fn try_from(parts: RecipeTemplateParts) -> Result<Self, Self::Error> {
        let live = SlotCounts::from_slots(&parts.slots);
        let stored = SlotCounts {
            item_slots: parts.item_slot_count.unwrap_or(live.item_slots),
            category_slots: parts.category_slot_count.unwrap_or(live.category_slots),
        };
        Self::from_stored(parts.recipe_id, parts.name, parts.slots, stored)
    }
}

impl RecipeTemplate {
    /// Build an empty template with a fresh identifier.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the name is invalid.
    pub fn new(name: impl Into<String>) -> Result<Self, KernelError> {
        let name = name.into();
        validate_name("recipe", &name)?;
        Ok(Self {
            recipe_id: RecipeId::new(),
            name,
            slots: Vec::new(),
            item_slot_count: 0,
            category_slot_count: 0,
        })
    }

    /// Build a template holding one fresh slot per target, in order.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for an invalid name, or
    /// [`KernelError::SlotCapacityExceeded`] when more than [`MAX_SLOTS`] targets are given.
    pub fn with_targets(
        name: impl Into<String>,
        targets: impl IntoIterator<Item = SlotTarget>,
    ) -> Result<Self, KernelError> {
        let mut template = Self::new(name)?;
        let slots = targets.into_iter().map(Slot::new).collect::<Vec<_>>();
        template.apply_slot_change(SlotChange::AddMany(slots))?;
        Ok(template)
    }

    /// Rehydrate a template read from a store, checking its stored counters against its slots.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the stored counters drift from the live slot
    /// counts or any other template invariant is violated.
    pub fn from_stored(
        recipe_id: RecipeId,
        name: String,
        slots: Vec<Slot>,
        stored: SlotCounts,
    ) -> Result<Self, KernelError> {
        let template = Self {
            recipe_id,
            name,
            slots,
            item_slot_count: stored.item_slots,
            category_slot_count: stored.category_slots,
        };
        template.validate()?;
        Ok(template)
    }

    #[must_use]
    pub fn recipe_id(&self) -> RecipeId {
        self.recipe_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    #[must_use]
    pub fn item_slot_count(&self) -> usize {
        self.item_slot_count
    }

    #[must_use]
    pub fn category_slot_count(&self) -> usize {
        self.category_slot_count
    }

    #[must_use]
    pub fn counts(&self) -> SlotCounts {
        SlotCounts { item_slots: self.item_slot_count, category_slots: self.category_slot_count }
    }

    #[must_use]
    pub fn slot_total(&self) -> usize {
        self.item_slot_count + self.category_slot_count
    }

    /// Check the template invariants: valid name, unique slot ids, counters equal to the
    /// live slot counts, and at most [`MAX_SLOTS`] slots.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] naming the first violated invariant.
    pub fn validate(&self) -> Result<(), KernelError> {
        validate_name("recipe", &self.name)?;

        let mut seen = BTreeSet::new();
        for slot in &self.slots {
            if !seen.insert(slot.slot_id) {
                return Err(KernelError::Validation(format!(
                    "slot {} appears more than once in recipe {}",
                    slot.slot_id, self.recipe_id
                )));
            }
        }

        let live = SlotCounts::from_slots(&self.slots);
        if live != self.counts() {
            return Err(KernelError::Validation(format!(
                "recipe {} counters drifted: stored item={} category={}, live item={} category={}",
                self.recipe_id,
                self.item_slot_count,
                self.category_slot_count,
                live.item_slots,
                live.category_slots
            )));
        }

        if live.total() > MAX_SLOTS {
            return Err(KernelError::Validation(format!(
                "recipe {} holds {} slots; at most {MAX_SLOTS} are allowed",
                self.recipe_id,
                live.total()
            )));
        }

        Ok(())
    }

    /// Apply one membership change and recompute both counters in the same step.
    ///
    /// On error the slot collection and counters are left exactly as they were.
    ///
    /// # Errors
    /// Returns [`KernelError::SlotCapacityExceeded`] when an addition does not fit,
    /// [`KernelError::UnknownSlot`] when a removal names a slot the template does not own, or
    /// [`KernelError::Validation`] when an addition reuses an existing slot id.
    pub fn apply_slot_change(&mut self, change: SlotChange) -> Result<SlotCounts, KernelError> {
        match change {
            SlotChange::AddOne(slot) => self.append(vec![slot])?,
            SlotChange::AddMany(slots) => self.append(slots)?,
            SlotChange::Remove(slot_ids) => {
                for slot_id in &slot_ids {
                    if !self.slots.iter().any(|slot| slot.slot_id == *slot_id) {
                        return Err(KernelError::UnknownSlot {
                            recipe_id: self.recipe_id,
                            slot_id: *slot_id,
                        });
                    }
                }
                self.slots.retain(|slot| !slot_ids.contains(&slot.slot_id));
            }
            SlotChange::Clear => self.slots.clear(),
        }

        let counts = SlotCounts::from_slots(&self.slots);
        self.item_slot_count = counts.item_slots;
        self.category_slot_count = counts.category_slots;
        Ok(counts)
    }

    /// Add one slot for `target`, returning its new id.
    ///
    /// # Errors
    /// Returns [`KernelError::SlotCapacityExceeded`] when the template is full.
    pub fn add_slot(&mut self, target: SlotTarget) -> Result<SlotId, KernelError> {
        let slot = Slot::new(target);
        self.apply_slot_change(SlotChange::AddOne(slot))?;
        Ok(slot.slot_id)
    }

    /// Remove the named slots.
    ///
    /// # Errors
    /// Returns [`KernelError::UnknownSlot`] when any id is not owned by this template.
    pub fn remove_slots(&mut self, slot_ids: &[SlotId]) -> Result<SlotCounts, KernelError> {
        self.apply_slot_change(SlotChange::Remove(slot_ids.to_vec()))
    }

    /// Remove every slot.
    ///
    /// # Errors
    /// Propagates [`RecipeTemplate::apply_slot_change`]; a `Clear` change itself never fails.
    pub fn clear_slots(&mut self) -> Result<SlotCounts, KernelError> {
        self.apply_slot_change(SlotChange::Clear)
    }

    fn append(&mut self, slots: Vec<Slot>) -> Result<(), KernelError> {
        check_capacity(self.recipe_id, self.counts(), slots.len())?;

        let mut seen = self.slots.iter().map(|slot| slot.slot_id).collect::<BTreeSet<_>>();
        for slot in &slots {
            if !seen.insert(slot.slot_id) {
                return Err(KernelError::Validation(format!(
                    "slot {} already belongs to recipe {}",
                    slot.slot_id, self.recipe_id
                )));
            }
        }

        self.slots.extend(slots);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    #[default]
    Greedy,
    Exhaustive,
}

impl MatchPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Greedy => "greedy",
            Self::Exhaustive => "exhaustive",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "greedy" => Some(Self::Greedy),
            "exhaustive" => Some(Self::Exhaustive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LookupStrategy {
    BruteForce,
    #[default]
    Indexed,
}

impl LookupStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BruteForce => "brute_force",
            Self::Indexed => "indexed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "brute_force" => Some(Self::BruteForce),
            "indexed" => Some(Self::Indexed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(default)]
pub struct MatchOptions {
    pub strategy: LookupStrategy,
    pub policy: MatchPolicy,
}

/// Greedy exact-cover check of `supplied` against one template.
///
/// Each supplied item, in input order, consumes the first remaining slot (in slot order) it
/// satisfies; an item with no remaining slot fails the check at once. The check succeeds iff
/// no slot is left over. This is a one-pass assignment without backtracking: when an item could
/// satisfy several open slots it can pick one that a later item needed, see
/// [`confirms_exhaustive`].
#[must_use]
pub fn confirms(template: &RecipeTemplate, supplied: &[Item]) -> bool {
    let mut remaining = template.slots().iter().collect::<Vec<_>>();
    for item in supplied {
        let Some(position) = remaining.iter().position(|slot| slot.target.matches(item)) else {
            return false;
        };
        remaining.remove(position);
    }
    remaining.is_empty()
}

/// Complete exact-cover check: true iff some bijection pairs every supplied item with a slot it
/// satisfies. Runs augmenting-path bipartite matching.
#[must_use]
pub fn confirms_exhaustive(template: &RecipeTemplate, supplied: &[Item]) -> bool {
    let slots = template.slots();
    if slots.len() != supplied.len() {
        return false;
    }

    let mut slot_owner: Vec<Option<usize>> = vec![None; slots.len()];
    for item_index in 0..supplied.len() {
        let mut visited = vec![false; slots.len()];
        if !assign_item(item_index, slots, supplied, &mut slot_owner, &mut visited) {
            return false;
        }
    }
    true
}

fn assign_item(
    item_index: usize,
    slots: &[Slot],
    supplied: &[Item],
    slot_owner: &mut [Option<usize>],
    visited: &mut [bool],
) -> bool {
    for (slot_index, slot) in slots.iter().enumerate() {
        if visited[slot_index] || !slot.target.matches(&supplied[item_index]) {
            continue;
        }
        visited[slot_index] = true;

        let reassigned = match slot_owner[slot_index] {
            None => true,
            Some(owner) => assign_item(owner, slots, supplied, slot_owner, visited),
        };
        if reassigned {
            slot_owner[slot_index] = Some(item_index);
            return true;
        }
    }
    false
}

#[must_use]
pub fn confirms_with(policy: MatchPolicy, template: &RecipeTemplate, supplied: &[Item]) -> bool {
    match policy {
        MatchPolicy::Greedy => confirms(template, supplied),
        MatchPolicy::Exhaustive => confirms_exhaustive(template, supplied),
    }
}

/// Cheap necessary condition for an exact match: the slot total equals the supplied count and
/// every slot is satisfied by at least one supplied item.
#[must_use]
pub fn is_structurally_possible(template: &RecipeTemplate, supplied: &[Item]) -> bool {
    first_unsatisfiable_slot(template, supplied).is_none()
        && template.slot_total() == supplied.len()
}

fn first_unsatisfiable_slot<'a>(template: &'a RecipeTemplate, supplied: &[Item]) -> Option<&'a Slot> {
    template.slots().iter().find(|slot| !supplied.iter().any(|item| slot.target.matches(item)))
}

/// Read access to a recipe catalog.
///
/// `list_templates` returns templates in catalog order, which is the final tie-breaker of
/// [`best_match`]. `structural_candidates` returns the templates passing
/// [`is_structurally_possible`], either in catalog order or already ranked by
/// `item_slot_count desc` then catalog order. Stores that can push the filter into their query
/// layer override it.
pub trait Catalog {
    type Error;

    /// Snapshot of every template with its slots.
    ///
    /// # Errors
    /// Returns the store error when the catalog cannot be read.
    fn list_templates(&self) -> Result<Vec<RecipeTemplate>, Self::Error>;

    /// Slots owned by one template.
    ///
    /// # Errors
    /// Returns the store error when the template is unknown or cannot be read.
    fn list_slots(&self, recipe_id: RecipeId) -> Result<Vec<Slot>, Self::Error>;

    /// Templates that could structurally be satisfied by `supplied`.
    ///
    /// # Errors
    /// Returns the store error when the catalog cannot be read.
    fn structural_candidates(&self, supplied: &[Item]) -> Result<Vec<RecipeTemplate>, Self::Error> {
        Ok(self
            .list_templates()?
            .into_iter()
            .filter(|template| is_structurally_possible(template, supplied))
            .collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CandidateVerdict {
    pub rank: usize,
    pub recipe_id: RecipeId,
    pub name: String,
    pub item_slot_count: usize,
    pub category_slot_count: usize,
    pub accepted: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MatchReport {
    pub matched: Option<RecipeTemplate>,
    pub supplied_count: usize,
    pub strategy: LookupStrategy,
    pub policy: MatchPolicy,
    pub candidates_considered: usize,
    pub evaluations: Vec<CandidateVerdict>,
    pub tie_breakers: Vec<String>,
    pub trace: Vec<String>,
}

#[must_use]
pub fn default_tie_breakers() -> Vec<String> {
    vec!["item_slot_count desc".to_string(), "catalog_order asc".to_string()]
}

fn rank_candidates(lhs: &RecipeTemplate, rhs: &RecipeTemplate) -> Ordering {
    rhs.item_slot_count().cmp(&lhs.item_slot_count())
}

fn judge_candidate(
    rank: usize,
    template: &RecipeTemplate,
    supplied: &[Item],
    policy: MatchPolicy,
) -> CandidateVerdict {
    let (accepted, reason) = if template.slot_total() != supplied.len() {
        (
            false,
            format!(
                "slot total {} differs from supplied count {}",
                template.slot_total(),
                supplied.len()
            ),
        )
    } else if let Some(slot) = first_unsatisfiable_slot(template, supplied) {
        (
            false,
            format!(
                "{} slot {} is not satisfied by any supplied item",
                slot.target.kind().as_str(),
                slot.slot_id
            ),
        )
    } else if confirms_with(policy, template, supplied) {
        (true, format!("exact cover confirmed under {} policy", policy.as_str()))
    } else {
        (false, format!("no exact cover under {} policy", policy.as_str()))
    };

    CandidateVerdict {
        rank,
        recipe_id: template.recipe_id(),
        name: template.name().to_string(),
        item_slot_count: template.item_slot_count(),
        category_slot_count: template.category_slot_count(),
        accepted,
        reason,
    }
}

/// Find the best exactly-matching template for `supplied` and explain how it was chosen.
///
/// Candidates are ranked by `item_slot_count desc`, then catalog order, and verified one by one
/// until the first accepted candidate. Both lookup strategies rank identically and differ only in
/// how many templates they read, so they always pick the same template.
///
/// # Errors
/// Returns the catalog error when templates cannot be read.
pub fn explain_best_match<C>(
    catalog: &C,
    supplied: &[Item],
    options: MatchOptions,
) -> Result<MatchReport, C::Error>
where
    C: Catalog + ?Sized,
{
    let mut report = MatchReport {
        matched: None,
        supplied_count: supplied.len(),
        strategy: options.strategy,
        policy: options.policy,
        candidates_considered: 0,
        evaluations: Vec::new(),
        tie_breakers: default_tie_breakers(),
        trace: Vec::new(),
    };

    if supplied.is_empty() {
        report.trace.push("empty supplied multiset: no match".to_string());
        return Ok(report);
    }

    let mut candidates = match options.strategy {
        LookupStrategy::BruteForce => {
            report.trace.push("scan: every catalog template".to_string());
            catalog.list_templates()?
        }
        LookupStrategy::Indexed => {
            report.trace.push(format!(
                "filter: slot total = {} and every slot satisfiable by a supplied item",
                supplied.len()
            ));
            catalog.structural_candidates(supplied)?
        }
    };
    candidates.sort_by(rank_candidates);
    report.candidates_considered = candidates.len();
    report.trace.push("sort: item_slot_count desc, catalog order asc".to_string());
    report.trace.push(format!("verify: {} exact cover, first accepted wins", options.policy.as_str()));

    for (index, template) in candidates.into_iter().enumerate() {
        let verdict = judge_candidate(index + 1, &template, supplied, options.policy);
        let accepted = verdict.accepted;
        report.evaluations.push(verdict);
        if accepted {
            report.matched = Some(template);
            break;
        }
    }

    tracing::debug!(
        strategy = options.strategy.as_str(),
        policy = options.policy.as_str(),
        supplied = supplied.len(),
        candidates = report.candidates_considered,
        evaluated = report.evaluations.len(),
        matched = ?report.matched.as_ref().map(RecipeTemplate::recipe_id),
        "best match lookup finished"
    );

    Ok(report)
}

/// Find the best exactly-matching template for `supplied`, or `None`.
///
/// # Errors
/// Returns the catalog error when templates cannot be read.
pub fn best_match<C>(
    catalog: &C,
    supplied: &[Item],
    options: MatchOptions,
) -> Result<Option<RecipeTemplate>, C::Error>
where
    C: Catalog + ?Sized,
{
    explain_best_match(catalog, supplied, options).map(|report| report.matched)
}

/// A catalog held entirely in memory, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    categories: Vec<Category>,
    items: Vec<Item>,
    templates: Vec<RecipeTemplate>,
}

impl InMemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new category.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for an invalid or duplicate name.
    pub fn add_category(&mut self, name: &str) -> Result<Category, KernelError> {
        if self.categories.iter().any(|category| category.name == name) {
            return Err(KernelError::Validation(format!("category name `{name}` already exists")));
        }
        let category = Category::new(name)?;
        self.categories.push(category.clone());
        Ok(category)
    }

    /// Register a new item in an existing category.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for an invalid or duplicate name or unknown category.
    pub fn add_item(&mut self, name: &str, category_id: CategoryId) -> Result<Item, KernelError> {
        if self.category(category_id).is_none() {
            return Err(KernelError::Validation(format!("unknown category {category_id}")));
        }
        if self.items.iter().any(|item| item.name == name) {
            return Err(KernelError::Validation(format!("item name `{name}` already exists")));
        }
        let item = Item::new(name, category_id)?;
        self.items.push(item.clone());
        Ok(item)
    }

    /// Append a template to the catalog.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the template is invalid, its id or name is taken,
    /// or a slot references an unknown item or category.
    pub fn add_template(&mut self, template: RecipeTemplate) -> Result<RecipeId, KernelError> {
        template.validate()?;
        if self.templates.iter().any(|existing| {
            existing.recipe_id() == template.recipe_id() || existing.name() == template.name()
        }) {
            return Err(KernelError::Validation(format!(
                "recipe `{}` already exists",
                template.name()
            )));
        }
        for slot in template.slots() {
            self.check_target_known(slot.target)?;
        }
        let recipe_id = template.recipe_id();
        self.templates.push(template);
        Ok(recipe_id)
    }

    /// Build and append a template with one slot per target.
    ///
    /// # Errors
    /// See [`RecipeTemplate::with_targets`] and [`InMemoryCatalog::add_template`].
    pub fn add_recipe(
        &mut self,
        name: &str,
        targets: impl IntoIterator<Item = SlotTarget>,
    ) -> Result<RecipeTemplate, KernelError> {
        let template = RecipeTemplate::with_targets(name, targets)?;
        self.add_template(template.clone())?;
        Ok(template)
    }

    /// Apply a slot membership change to one stored template.
    ///
    /// # Errors
    /// Returns [`KernelError::Query`] for an unknown recipe, [`KernelError::Validation`] when an
    /// added slot references an unknown item or category, or any error of
    /// [`RecipeTemplate::apply_slot_change`].
    pub fn apply_slot_change(
        &mut self,
        recipe_id: RecipeId,
        change: SlotChange,
    ) -> Result<SlotCounts, KernelError> {
        for slot in change.added_slots() {
            self.check_target_known(slot.target)?;
        }
        let template = self
            .templates
            .iter_mut()
            .find(|template| template.recipe_id() == recipe_id)
            .ok_or_else(|| KernelError::Query(format!("unknown recipe {recipe_id}")))?;
        template.apply_slot_change(change)
    }

    #[must_use]
    pub fn category(&self, category_id: CategoryId) -> Option<&Category> {
        self.categories.iter().find(|category| category.category_id == category_id)
    }

    #[must_use]
    pub fn item(&self, item_id: ItemId) -> Option<&Item> {
        self.items.iter().find(|item| item.item_id == item_id)
    }

    #[must_use]
    pub fn template(&self, recipe_id: RecipeId) -> Option<&RecipeTemplate> {
        self.templates.iter().find(|template| template.recipe_id() == recipe_id)
    }

    #[must_use]
    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    #[must_use]
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    fn check_target_known(&self, target: SlotTarget) -> Result<(), KernelError> {
        let known = match target {
            SlotTarget::Item(item_id) => self.item(item_id).is_some(),
            SlotTarget::Category(category_id) => self.category(category_id).is_some(),
        };
        if known {
            Ok(())
        } else {
            Err(KernelError::Validation(format!(
                "slot references unknown {} {}",
                target.kind().as_str(),
                describe_target(target)
            )))
        }
    }
}

fn describe_target(target: SlotTarget) -> String {
    match target {
        SlotTarget::Item(item_id) => item_id.to_string(),
        SlotTarget::Category(category_id) => category_id.to_string(),
    }
}

impl Catalog for InMemoryCatalog {
    type Error = KernelError;

    fn list_templates(&self) -> Result<Vec<RecipeTemplate>, Self::Error> {
        Ok(self.templates.clone())
    }

    fn list_slots(&self, recipe_id: RecipeId) -> Result<Vec<Slot>, Self::Error> {
        self.template(recipe_id)
            .map(|template| template.slots().to_vec())
            .ok_or_else(|| KernelError::Query(format!("unknown recipe {recipe_id}")))
    }
}
