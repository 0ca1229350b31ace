//! Compiled location/item tables.
//!
//! The catalog is produced ahead of time by the data preparation step and
//! shipped as a JSON blob. It is validated once on load and read-only after
//! that, so one instance can be shared by any number of concurrent builds.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::logic::Pieces;
use crate::script::{hex_bytes, ScriptPatch, SymbolTable};
use crate::{EvermizerError, Result};

/// Table layout version this engine understands.
pub const CATALOG_VERSION: u32 = 1;

const BUNDLED_CATALOG: &str = include_str!("../data/catalog.json");

/// Every location slot holds a little-endian item code of this width.
pub const SLOT_WIDTH: usize = 2;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(pub u16);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u16);

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Gourd,
    Boss,
    Alchemy,
    Npc,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Gourd,
        Category::Boss,
        Category::Alchemy,
        Category::Npc,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Category::Gourd => "gourd",
            Category::Boss => "boss",
            Category::Alchemy => "alchemy",
            Category::Npc => "npc",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    /// Never holds a progression item.
    NoProgression,
    /// Easy to overlook; progression only outside easy difficulty.
    Hidden,
    /// Can be lost permanently; progression only on hard difficulty.
    Missable,
}

/// Where a location's item code lives in the image.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Slot {
    Absolute {
        addr: usize,
    },
    Symbol {
        symbol: String,
        #[serde(default)]
        offset: usize,
    },
}

impl Slot {
    pub fn resolve(&self, symbols: &SymbolTable) -> Option<usize> {
        match self {
            Slot::Absolute { addr } => Some(*addr),
            Slot::Symbol { symbol, offset } => {
                symbols.get(symbol).and_then(|base| base.checked_add(*offset))
            }
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub name: String,
    pub category: Category,
    pub slot: Slot,
    #[serde(default)]
    pub vanilla: Option<ItemId>,
    #[serde(default)]
    pub requires: Vec<Pieces>,
    #[serde(default)]
    pub provides: Vec<Pieces>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl Location {
    pub fn has_tag(&self, tag: Tag) -> bool {
        self.tags.contains(&tag)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub name: String,
    pub category: Category,
    pub code: u16,
    #[serde(default)]
    pub provides: Vec<Pieces>,
}

impl Item {
    pub fn is_progression(&self) -> bool {
        self.provides.iter().any(|p| p.pieces > 0)
    }
}

/// Logic-only check: grants progress once its requirements hold.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogicRule {
    pub name: String,
    #[serde(default)]
    pub requires: Vec<Pieces>,
    #[serde(default)]
    pub provides: Vec<Pieces>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogData {
    version: u32,
    image_size: usize,
    #[serde(default)]
    symbols: SymbolTable,
    #[serde(default, with = "hex_bytes")]
    baseline: Vec<u8>,
    #[serde(default)]
    scripts: Vec<ScriptPatch>,
    locations: Vec<Location>,
    items: Vec<Item>,
    #[serde(default)]
    rules: Vec<LogicRule>,
    #[serde(default)]
    goal: Vec<Pieces>,
    #[serde(default)]
    filler: Option<ItemId>,
}

#[derive(Debug)]
pub struct Catalog {
    version: u32,
    image_size: usize,
    symbols: SymbolTable,
    baseline: Vec<u8>,
    scripts: Vec<ScriptPatch>,
    locations: Vec<Location>,
    items: Vec<Item>,
    rules: Vec<LogicRule>,
    goal: Vec<Pieces>,
    filler: Option<ItemId>,
    location_index: BTreeMap<LocationId, usize>,
    item_index: BTreeMap<ItemId, usize>,
}

fn malformed(msg: impl Into<String>) -> EvermizerError {
    EvermizerError::Catalog(msg.into())
}

fn check_pieces(owner: &str, pieces: &[Pieces]) -> Result<()> {
    if pieces.iter().any(|p| p.pieces == 0) {
        return Err(malformed(format!("{owner} lists a zero-piece requirement or grant")));
    }
    Ok(())
}

impl Catalog {
    /// Tables bundled with the crate.
    pub fn bundled() -> Result<Self> {
        Self::from_json(BUNDLED_CATALOG)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let data: CatalogData = serde_json::from_str(text)?;
        Self::from_data(data)
    }

    fn from_data(data: CatalogData) -> Result<Self> {
        let CatalogData {
            version,
            image_size,
            symbols,
            baseline,
            scripts,
            mut locations,
            mut items,
            rules,
            goal,
            filler,
        } = data;

        if version != CATALOG_VERSION {
            return Err(malformed(format!(
                "table version {version}, engine expects {CATALOG_VERSION}"
            )));
        }
        if image_size == 0 {
            return Err(malformed("image_size is zero"));
        }
        for (name, &addr) in &symbols {
            if addr >= image_size {
                return Err(malformed(format!(
                    "symbol {name} at 0x{addr:06X} is outside the image"
                )));
            }
        }

        let mut script_names = BTreeSet::new();
        for script in &scripts {
            if !script_names.insert(script.name.as_str()) {
                return Err(malformed(format!("duplicate script {}", script.name)));
            }
        }

        // Stable id order for every iteration that feeds the RNG.
        locations.sort_by_key(|l| l.id);
        items.sort_by_key(|i| i.id);

        let mut item_index = BTreeMap::new();
        let mut item_names = BTreeSet::new();
        for (idx, item) in items.iter().enumerate() {
            if item_index.insert(item.id, idx).is_some() {
                return Err(malformed(format!("duplicate item id {}", item.id)));
            }
            if !item_names.insert(item.name.as_str()) {
                return Err(malformed(format!("duplicate item name {}", item.name)));
            }
            check_pieces(&item.name, &item.provides)?;
        }

        let mut location_index = BTreeMap::new();
        let mut location_names = BTreeSet::new();
        let mut vanilla_items = BTreeSet::new();
        for (idx, loc) in locations.iter().enumerate() {
            if location_index.insert(loc.id, idx).is_some() {
                return Err(malformed(format!("duplicate location id {}", loc.id)));
            }
            if !location_names.insert(loc.name.as_str()) {
                return Err(malformed(format!("duplicate location name {}", loc.name)));
            }
            let addr = loc
                .slot
                .resolve(&symbols)
                .ok_or_else(|| malformed(format!("slot of {} does not resolve", loc.name)))?;
            if addr.checked_add(SLOT_WIDTH).map_or(true, |end| end > image_size) {
                return Err(malformed(format!(
                    "slot of {} at 0x{addr:06X} is outside the image",
                    loc.name
                )));
            }
            if let Some(vanilla) = loc.vanilla {
                let item = item_index
                    .get(&vanilla)
                    .map(|&i| &items[i])
                    .ok_or_else(|| malformed(format!("{} has unknown vanilla item {vanilla}", loc.name)))?;
                if item.category != loc.category {
                    return Err(malformed(format!(
                        "{} ({}) holds vanilla item {} of category {}",
                        loc.name,
                        loc.category.name(),
                        item.name,
                        item.category.name()
                    )));
                }
                if !vanilla_items.insert(vanilla) {
                    return Err(malformed(format!("vanilla item {vanilla} appears twice")));
                }
            }
            check_pieces(&loc.name, &loc.requires)?;
            check_pieces(&loc.name, &loc.provides)?;
        }

        for rule in &rules {
            check_pieces(&rule.name, &rule.requires)?;
            check_pieces(&rule.name, &rule.provides)?;
        }
        check_pieces("goal", &goal)?;

        if let Some(filler) = filler {
            let item = item_index
                .get(&filler)
                .map(|&i| &items[i])
                .ok_or_else(|| malformed(format!("unknown filler item {filler}")))?;
            if item.is_progression() {
                return Err(malformed(format!("filler item {} grants progress", item.name)));
            }
            if vanilla_items.contains(&filler) {
                return Err(malformed(format!("filler item {} is also a vanilla item", item.name)));
            }
        }

        Ok(Catalog {
            version,
            image_size,
            symbols,
            baseline,
            scripts,
            locations,
            items,
            rules,
            goal,
            filler,
            location_index,
            item_index,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// IPS patch that lifts the stock image to the moddable baseline.
    /// Empty when the table carries none.
    pub fn baseline(&self) -> &[u8] {
        &self.baseline
    }

    pub fn scripts(&self) -> &[ScriptPatch] {
        &self.scripts
    }

    pub fn script(&self, name: &str) -> Option<&ScriptPatch> {
        self.scripts.iter().find(|s| s.name == name)
    }

    /// All locations, sorted by id.
    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    pub fn locations_in(&self, category: Category) -> impl Iterator<Item = &Location> + '_ {
        self.locations.iter().filter(move |l| l.category == category)
    }

    pub fn location(&self, id: LocationId) -> Option<&Location> {
        self.location_index.get(&id).map(|&i| &self.locations[i])
    }

    pub fn location_by_name(&self, name: &str) -> Option<&Location> {
        self.locations.iter().find(|l| l.name == name)
    }

    /// All items, sorted by id.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn items_in(&self, category: Category) -> impl Iterator<Item = &Item> + '_ {
        self.items.iter().filter(move |i| i.category == category)
    }

    pub fn item(&self, id: ItemId) -> Option<&Item> {
        self.item_index.get(&id).map(|&i| &self.items[i])
    }

    pub fn item_by_name(&self, name: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.name == name)
    }

    pub fn progression_items(&self) -> impl Iterator<Item = &Item> + '_ {
        self.items.iter().filter(|i| i.is_progression())
    }

    pub fn rules(&self) -> &[LogicRule] {
        &self.rules
    }

    pub fn goal(&self) -> &[Pieces] {
        &self.goal
    }

    /// Infinitely available filler, if the table defines one.
    pub fn filler(&self) -> Option<&Item> {
        self.filler.and_then(|id| self.item(id))
    }

    /// Absolute address of a location's slot. Validated on load.
    pub fn slot_addr(&self, location: &Location) -> Option<usize> {
        location.slot.resolve(&self.symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> serde_json::Value {
        json!({
            "version": 1,
            "image_size": 64,
            "symbols": {"table": 16},
            "locations": [
                {"id": 2, "name": "B", "category": "boss", "slot": {"symbol": "table", "offset": 2}, "vanilla": 20},
                {"id": 1, "name": "A", "category": "gourd", "slot": {"addr": 0}, "vanilla": 10}
            ],
            "items": [
                {"id": 20, "name": "Axe", "category": "boss", "code": 512,
                 "provides": [{"pieces": 1, "progress": "weapon"}]},
                {"id": 10, "name": "Petal", "category": "gourd", "code": 256},
                {"id": 99, "name": "Nothing", "category": "gourd", "code": 0}
            ],
            "filler": 99
        })
    }

    fn load(value: serde_json::Value) -> Result<Catalog> {
        Catalog::from_json(&value.to_string())
    }

    #[test]
    fn loads_and_sorts_by_id() {
        let cat = load(base()).unwrap();
        let ids: Vec<u16> = cat.locations().iter().map(|l| l.id.0).collect();
        assert_eq!(ids, vec![1, 2]);
        let ids: Vec<u16> = cat.items().iter().map(|i| i.id.0).collect();
        assert_eq!(ids, vec![10, 20, 99]);

        let b = cat.location(LocationId(2)).unwrap();
        assert_eq!(cat.slot_addr(b), Some(18));
        assert_eq!(cat.locations_in(Category::Boss).count(), 1);
        assert_eq!(cat.items_in(Category::Gourd).count(), 2);
        assert_eq!(cat.progression_items().count(), 1);
        assert_eq!(cat.filler().map(|i| i.name.as_str()), Some("Nothing"));
        assert!(cat.baseline().is_empty());
    }

    #[test]
    fn bundled_tables_load() {
        let cat = Catalog::bundled().unwrap();
        assert_eq!(cat.version(), CATALOG_VERSION);
        assert!(!cat.locations().is_empty());
        assert!(!cat.baseline().is_empty());
        for cat_kind in Category::ALL {
            assert!(cat.locations_in(cat_kind).count() > 0, "{}", cat_kind.name());
        }
    }

    #[test]
    fn rejects_wrong_version() {
        let mut v = base();
        v["version"] = json!(2);
        assert!(matches!(load(v), Err(EvermizerError::Catalog(_))));
    }

    #[test]
    fn rejects_unresolved_slot() {
        let mut v = base();
        v["locations"][0]["slot"] = json!({"symbol": "nowhere"});
        assert!(matches!(load(v), Err(EvermizerError::Catalog(_))));
    }

    #[test]
    fn rejects_slot_outside_image() {
        let mut v = base();
        v["locations"][1]["slot"] = json!({"addr": 63});
        assert!(matches!(load(v), Err(EvermizerError::Catalog(_))));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut v = base();
        v["locations"][1]["id"] = json!(2);
        assert!(matches!(load(v), Err(EvermizerError::Catalog(_))));
    }

    #[test]
    fn rejects_vanilla_of_other_category() {
        let mut v = base();
        v["locations"][1]["vanilla"] = json!(20);
        v["locations"][0]["vanilla"] = json!(10);
        assert!(matches!(load(v), Err(EvermizerError::Catalog(_))));
    }

    #[test]
    fn rejects_progression_filler() {
        let mut v = base();
        v["filler"] = json!(20);
        assert!(matches!(load(v), Err(EvermizerError::Catalog(_))));
    }

    #[test]
    fn rejects_zero_piece_requirement() {
        let mut v = base();
        v["locations"][0]["requires"] = json!([{"pieces": 0, "progress": "rocket"}]);
        assert!(matches!(load(v), Err(EvermizerError::Catalog(_))));
    }

    #[test]
    fn malformed_json_is_catalog_json_error() {
        assert!(matches!(
            Catalog::from_json("{ not json"),
            Err(EvermizerError::CatalogJson(_))
        ));
    }
}
