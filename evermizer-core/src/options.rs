use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, Category, Item, Location, Tag};
use crate::logic::{Inventory, Reachability};
use crate::randomize::Placement;
use crate::script::{ScriptOp, ScriptPatch};
use crate::{EvermizerError, Result};

pub const DEFAULT_PERCENT: u16 = 100;
pub const MAX_PERCENT: u16 = 9999;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 64;
pub const MAX_ATTEMPTS_LIMIT: u32 = 10_000;
/// Width of each multiworld id field in the image, NUL padded.
pub const MULTIWORLD_FIELD_LEN: usize = 32;

pub const SYM_MONEY_PERCENT: &str = "money_percent";
pub const SYM_EXP_PERCENT: &str = "exp_percent";
pub const SYM_MW_SEED: &str = "mw_seed";
pub const SYM_MW_SLOT: &str = "mw_slot";

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Normal,
    Hard,
}

impl Difficulty {
    /// Whether `location` may hold a progression item at this difficulty.
    pub fn allows_progression(&self, location: &Location) -> bool {
        if location.has_tag(Tag::NoProgression) {
            return false;
        }
        match self {
            Difficulty::Easy => !location.has_tag(Tag::Hidden) && !location.has_tag(Tag::Missable),
            Difficulty::Normal => !location.has_tag(Tag::Missable),
            Difficulty::Hard => true,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultiworldId {
    pub seed: String,
    pub slot: String,
}

/// A location pinned to an item before randomization.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForcedPlacement {
    pub location: String,
    pub item: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    pub difficulty: Difficulty,
    pub randomize_gourds: bool,
    pub randomize_bosses: bool,
    pub randomize_alchemy: bool,
    pub randomize_npcs: bool,
    /// Optional script patches to include.
    pub patches: BTreeSet<String>,
    pub money_percent: u16,
    pub exp_percent: u16,
    pub multiworld_id: Option<MultiworldId>,
    pub placements: Vec<ForcedPlacement>,
    pub max_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            difficulty: Difficulty::Normal,
            randomize_gourds: true,
            randomize_bosses: true,
            randomize_alchemy: true,
            randomize_npcs: false,
            patches: BTreeSet::new(),
            money_percent: DEFAULT_PERCENT,
            exp_percent: DEFAULT_PERCENT,
            multiworld_id: None,
            placements: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

fn invalid(msg: impl Into<String>) -> EvermizerError {
    EvermizerError::InvalidOptions(msg.into())
}

impl Options {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| invalid(e.to_string()))
    }

    /// Parses a compact flag string on top of the defaults.
    ///
    /// `e`/`n`/`h` pick the difficulty; `g`, `b`, `a` and `p` enable gourd,
    /// boss, alchemy and npc randomization, their upper-case forms disable
    /// it. `-` is accepted as a separator.
    pub fn from_flags(flags: &str) -> Result<Self> {
        let mut options = Options::default();
        for c in flags.chars() {
            match c {
                'e' => options.difficulty = Difficulty::Easy,
                'n' => options.difficulty = Difficulty::Normal,
                'h' => options.difficulty = Difficulty::Hard,
                'g' | 'G' => options.randomize_gourds = c == 'g',
                'b' | 'B' => options.randomize_bosses = c == 'b',
                'a' | 'A' => options.randomize_alchemy = c == 'a',
                'p' | 'P' => options.randomize_npcs = c == 'p',
                '-' => {}
                _ => return Err(invalid(format!("unrecognized flag '{c}'"))),
            }
        }
        Ok(options)
    }

    pub fn randomizes(&self, category: Category) -> bool {
        match category {
            Category::Gourd => self.randomize_gourds,
            Category::Boss => self.randomize_bosses,
            Category::Alchemy => self.randomize_alchemy,
            Category::Npc => self.randomize_npcs,
        }
    }

    pub fn validate(&self, catalog: &Catalog) -> Result<()> {
        if self.money_percent > MAX_PERCENT {
            return Err(invalid(format!(
                "money_percent {} exceeds {MAX_PERCENT}",
                self.money_percent
            )));
        }
        if self.exp_percent > MAX_PERCENT {
            return Err(invalid(format!(
                "exp_percent {} exceeds {MAX_PERCENT}",
                self.exp_percent
            )));
        }
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.max_attempts) {
            return Err(invalid(format!(
                "max_attempts {} not in 1..={MAX_ATTEMPTS_LIMIT}",
                self.max_attempts
            )));
        }

        for name in &self.patches {
            match catalog.script(name) {
                Some(script) if script.optional => {}
                Some(_) => return Err(invalid(format!("patch {name} is not optional"))),
                None => return Err(invalid(format!("unknown patch {name}"))),
            }
        }

        if let Some(id) = &self.multiworld_id {
            for (what, value) in [("seed", &id.seed), ("slot", &id.slot)] {
                if value.len() > MULTIWORLD_FIELD_LEN {
                    return Err(invalid(format!(
                        "multiworld {what} is {} bytes, limit {MULTIWORLD_FIELD_LEN}",
                        value.len()
                    )));
                }
            }
        }

        let mut seen_locations = BTreeSet::new();
        let mut seen_items = BTreeSet::new();
        for forced in &self.placements {
            let loc = catalog
                .location_by_name(&forced.location)
                .ok_or_else(|| invalid(format!("unknown location {}", forced.location)))?;
            let item = catalog
                .item_by_name(&forced.item)
                .ok_or_else(|| invalid(format!("unknown item {}", forced.item)))?;
            if !self.randomizes(loc.category) {
                return Err(invalid(format!(
                    "{} is not randomized with these options",
                    loc.name
                )));
            }
            // Only items from the shuffled pool can be pinned.
            let in_pool = catalog
                .locations()
                .iter()
                .any(|l| l.vanilla == Some(item.id) && self.randomizes(l.category));
            if !in_pool {
                return Err(invalid(format!("{} is not in the item pool", item.name)));
            }
            if item.is_progression() {
                if !self.difficulty.allows_progression(loc) {
                    return Err(invalid(format!(
                        "{} cannot hold progression item {} at {:?} difficulty",
                        loc.name, item.name, self.difficulty
                    )));
                }
                if !reachable_without(catalog, loc, item) {
                    return Err(invalid(format!(
                        "{} is unreachable unless {} is already held",
                        loc.name, item.name
                    )));
                }
            }
            if !seen_locations.insert(loc.id) {
                return Err(invalid(format!("{} is placed twice", loc.name)));
            }
            if !seen_items.insert(item.id) {
                return Err(invalid(format!("{} is placed twice", item.name)));
            }
        }

        Ok(())
    }

    /// Image edits derived from the options themselves.
    pub fn settings_script(&self) -> ScriptPatch {
        let mut script = ScriptPatch::new("settings");
        if self.money_percent != DEFAULT_PERCENT {
            script.ops.push(ScriptOp::WriteSymbol {
                symbol: SYM_MONEY_PERCENT.to_string(),
                offset: 0,
                bytes: self.money_percent.to_le_bytes().to_vec(),
            });
        }
        if self.exp_percent != DEFAULT_PERCENT {
            script.ops.push(ScriptOp::WriteSymbol {
                symbol: SYM_EXP_PERCENT.to_string(),
                offset: 0,
                bytes: self.exp_percent.to_le_bytes().to_vec(),
            });
        }
        if let Some(id) = &self.multiworld_id {
            for (symbol, value) in [(SYM_MW_SEED, &id.seed), (SYM_MW_SLOT, &id.slot)] {
                let mut bytes = value.as_bytes().to_vec();
                bytes.resize(MULTIWORLD_FIELD_LEN, 0);
                script.ops.push(ScriptOp::WriteSymbol {
                    symbol: symbol.to_string(),
                    offset: 0,
                    bytes,
                });
            }
        }
        script
    }
}

/// Whether `location` can be reached holding every item except `item`.
///
/// Reachability is monotonic, so a location that fails here stays
/// unreachable in every placement that puts `item` there.
fn reachable_without(catalog: &Catalog, location: &Location, item: &Item) -> bool {
    let mut start = Inventory::new();
    for other in catalog.items().iter().filter(|i| i.id != item.id) {
        start.grant_all(&other.provides);
    }
    catalog
        .reachable(&Placement::new(), &start)
        .locations
        .contains(&location.id)
}

/// Caller-supplied seed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seed {
    Number(u64),
    Text(String),
}

impl Seed {
    /// Normalizes to the generator seed. Text made only of ASCII digits that
    /// fits a u64 maps to its value; anything else, including signs and
    /// surrounding whitespace, is hashed with FNV-1a.
    pub fn to_u64(&self) -> u64 {
        match self {
            Seed::Number(n) => *n,
            Seed::Text(text) => {
                let digits = !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit());
                match text.parse::<u64>() {
                    Ok(n) if digits => n,
                    _ => fnv1a(text.as_bytes()),
                }
            }
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325u64;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001B3_u64);
    }
    h
}

impl From<u64> for Seed {
    fn from(n: u64) -> Self {
        Seed::Number(n)
    }
}

impl From<&str> for Seed {
    fn from(text: &str) -> Self {
        Seed::Text(text.to_string())
    }
}

impl From<String> for Seed {
    fn from(text: String) -> Self {
        Seed::Text(text)
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seed::Number(n) => write!(f, "{n}"),
            Seed::Text(text) => write!(f, "{text}"),
        }
    }
}
