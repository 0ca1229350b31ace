use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::catalog::{Catalog, Item, ItemId, Location, LocationId};
use crate::logic::{Inventory, Reachability};
use crate::options::{Options, Seed};
use crate::rom::Rom;
use crate::script::{apply_scripts, ScriptOp, ScriptPatch};
use crate::spoiler::Spoiler;
use crate::{EvermizerError, Result};

/// Location to item assignment, remembering the order of decisions.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Placement {
    slots: BTreeMap<LocationId, ItemId>,
    order: Vec<LocationId>,
}

impl Placement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false, leaving the placement unchanged, if `location` is taken.
    pub fn place(&mut self, location: LocationId, item: ItemId) -> bool {
        if self.slots.contains_key(&location) {
            return false;
        }
        self.slots.insert(location, item);
        self.order.push(location);
        true
    }

    pub fn get(&self, location: LocationId) -> Option<ItemId> {
        self.slots.get(&location).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Pairs in placement order.
    pub fn iter(&self) -> impl Iterator<Item = (LocationId, ItemId)> + '_ {
        self.order.iter().map(move |loc| (*loc, self.slots[loc]))
    }
}

#[derive(Clone, Debug)]
pub struct Randomization {
    pub placement: Placement,
    pub spoiler: Spoiler,
    /// Attempt that produced the placement, starting at 1.
    pub attempt: u32,
}

struct Randomizer<'a> {
    catalog: &'a Catalog,
    options: &'a Options,
    /// Vanilla items of fixed categories, then forced placements.
    fixed: Placement,
    /// Randomized locations still open after `fixed`, sorted by id.
    open: Vec<&'a Location>,
    progression: Vec<&'a Item>,
    filler: Vec<&'a Item>,
}

impl<'a> Randomizer<'a> {
    fn new(catalog: &'a Catalog, options: &'a Options) -> Result<Self> {
        let mut fixed = Placement::new();
        for loc in catalog.locations() {
            if options.randomizes(loc.category) {
                continue;
            }
            let item = match (loc.vanilla, catalog.filler()) {
                (Some(item), _) => item,
                (None, Some(filler)) => filler.id,
                (None, None) => {
                    return Err(EvermizerError::Catalog(format!(
                        "{} has no vanilla item and no filler item is defined",
                        loc.name
                    )))
                }
            };
            fixed.place(loc.id, item);
        }

        let mut forced_items = BTreeSet::new();
        for forced in &options.placements {
            let (loc, item) = match (
                catalog.location_by_name(&forced.location),
                catalog.item_by_name(&forced.item),
            ) {
                (Some(loc), Some(item)) => (loc, item),
                _ => {
                    return Err(EvermizerError::InvalidOptions(format!(
                        "unknown forced placement {} -> {}",
                        forced.location, forced.item
                    )))
                }
            };
            fixed.place(loc.id, item.id);
            forced_items.insert(item.id);
        }

        let open: Vec<&Location> = catalog
            .locations()
            .iter()
            .filter(|l| options.randomizes(l.category) && fixed.get(l.id).is_none())
            .collect();

        // Pool: vanilla items of randomized locations, in id order.
        let mut pool: Vec<&Item> = catalog
            .locations()
            .iter()
            .filter(|l| options.randomizes(l.category))
            .filter_map(|l| l.vanilla)
            .filter(|id| !forced_items.contains(id))
            .filter_map(|id| catalog.item(id))
            .collect();
        pool.sort_by_key(|i| i.id);
        let (progression, filler): (Vec<&Item>, Vec<&Item>) =
            pool.into_iter().partition(|i| i.is_progression());

        Ok(Randomizer {
            catalog,
            options,
            fixed,
            open,
            progression,
            filler,
        })
    }

    // Index draws use u32 ranges so the stream is the same on every target.
    fn pick<T>(rng: &mut StdRng, choices: &[T]) -> usize {
        rng.gen_range(0..choices.len() as u32) as usize
    }

    /// One placement attempt. `Ok(None)` is an ordering failure.
    fn attempt(&self, attempt: u32, rng: &mut StdRng) -> Result<Option<Placement>> {
        let start = Inventory::new();
        let mut placement = self.fixed.clone();

        let mut items = self.progression.clone();
        items.shuffle(rng);
        for item in items {
            let reach = self.catalog.reachable(&placement, &start);
            let candidates: Vec<&Location> = self
                .open
                .iter()
                .copied()
                .filter(|l| {
                    placement.get(l.id).is_none()
                        && reach.locations.contains(&l.id)
                        && self.options.difficulty.allows_progression(l)
                })
                .collect();
            if candidates.is_empty() {
                debug!("[attempt {attempt}] no reachable location left for {}", item.name);
                return Ok(None);
            }
            let loc = candidates[Self::pick(rng, &candidates)];
            placement.place(loc.id, item.id);
            debug!("[attempt {attempt}] {} -> {}", item.name, loc.name);
        }

        let reach = self.catalog.reachable(&placement, &start);
        if !self.catalog.goal_met(&reach.inventory) {
            debug!("[attempt {attempt}] goal not reachable");
            return Ok(None);
        }
        if !self.catalog.stranded_progression(&placement, &reach).is_empty() {
            debug!("[attempt {attempt}] fixed progression is unreachable");
            return Ok(None);
        }

        let mut filler = self.filler.clone();
        filler.shuffle(rng);
        let mut filler = filler.into_iter();
        for loc in &self.open {
            if placement.get(loc.id).is_some() {
                continue;
            }
            let item = match filler.next() {
                Some(item) => item,
                None => self.catalog.filler().ok_or_else(|| {
                    EvermizerError::Catalog(format!(
                        "no item left for {} and no filler item defined",
                        loc.name
                    ))
                })?,
            };
            placement.place(loc.id, item.id);
        }
        let surplus = filler.count();
        if surplus > 0 {
            debug!("[attempt {attempt}] {surplus} filler items left unplaced");
        }

        Ok(Some(placement))
    }
}

/// Final gate, independent of the incremental fill.
fn verify(catalog: &Catalog, placement: &Placement) -> Result<()> {
    let reach = catalog.reachable(placement, &Inventory::new());
    if !catalog.goal_met(&reach.inventory) {
        return Err(EvermizerError::Internal(
            "accepted placement does not reach the goal".to_string(),
        ));
    }
    let stranded = catalog.stranded_progression(placement, &reach);
    if let Some(loc) = stranded.first() {
        return Err(EvermizerError::Internal(format!(
            "progression item at {loc} is unreachable in accepted placement"
        )));
    }
    let covered = catalog
        .locations()
        .iter()
        .all(|l| placement.get(l.id).is_some());
    if !covered || placement.len() != catalog.locations().len() {
        return Err(EvermizerError::Internal(format!(
            "placement covers {} of {} locations",
            placement.len(),
            catalog.locations().len()
        )));
    }
    let filler = catalog.filler().map(|i| i.id);
    let mut seen = BTreeSet::new();
    for (_, item) in placement.iter() {
        if Some(item) != filler && !seen.insert(item) {
            return Err(EvermizerError::Internal(format!("item {item} placed twice")));
        }
    }
    Ok(())
}

fn build_spoiler(catalog: &Catalog, placement: &Placement, seed: u64) -> Result<Spoiler> {
    let mut spoiler = Spoiler::new(seed);
    for (loc_id, item_id) in placement.iter() {
        let loc = catalog
            .location(loc_id)
            .ok_or_else(|| EvermizerError::Internal(format!("unknown location {loc_id}")))?;
        let item = catalog
            .item(item_id)
            .ok_or_else(|| EvermizerError::Internal(format!("unknown item {item_id}")))?;
        spoiler.push(&loc.name, &item.name, loc.category);
    }
    Ok(spoiler)
}

/// Assigns an item to every catalog location for `seed`.
///
/// Progression items are placed forward: each goes to a location that is
/// reachable with everything placed before it. Filler fills the rest.
pub fn randomize(catalog: &Catalog, seed: &Seed, options: &Options) -> Result<Randomization> {
    options.validate(catalog)?;
    let seed_value = seed.to_u64();
    let randomizer = Randomizer::new(catalog, options)?;
    info!(
        "randomizing seed {seed_value}: {} open locations, {} progression, {} filler",
        randomizer.open.len(),
        randomizer.progression.len(),
        randomizer.filler.len()
    );

    // One stream for all attempts; retries continue it.
    let mut rng = StdRng::seed_from_u64(seed_value);
    for attempt in 1..=options.max_attempts {
        match randomizer.attempt(attempt, &mut rng)? {
            Some(placement) => {
                verify(catalog, &placement)?;
                let spoiler = build_spoiler(catalog, &placement, seed_value)?;
                info!("[attempt {attempt}] accepted placement");
                return Ok(Randomization {
                    placement,
                    spoiler,
                    attempt,
                });
            }
            None => info!("[attempt {attempt}] ordering failure, retrying"),
        }
    }

    warn!(
        "seed {seed_value}: no completable placement in {} attempts",
        options.max_attempts
    );
    Err(EvermizerError::UnsatisfiableSeed {
        seed: seed_value,
        attempts: options.max_attempts,
    })
}

/// Script that writes every placed item code into its slot.
pub fn placement_script(catalog: &Catalog, placement: &Placement) -> Result<ScriptPatch> {
    let mut script = ScriptPatch::new("placement");
    for (loc_id, item_id) in placement.iter() {
        let loc = catalog
            .location(loc_id)
            .ok_or_else(|| EvermizerError::Internal(format!("unknown location {loc_id}")))?;
        let item = catalog
            .item(item_id)
            .ok_or_else(|| EvermizerError::Internal(format!("unknown item {item_id}")))?;
        let addr = catalog.slot_addr(loc).ok_or_else(|| EvermizerError::ScriptReference {
            script: script.name.clone(),
            symbol: format!("{:?}", loc.slot),
        })?;
        script.ops.push(ScriptOp::Write {
            addr,
            bytes: item.code.to_le_bytes().to_vec(),
        });
    }
    Ok(script)
}

/// Writes `placement` into `rom` through the script engine.
pub fn write_placement(rom: &mut Rom, catalog: &Catalog, placement: &Placement) -> Result<()> {
    let script = placement_script(catalog, placement)?;
    apply_scripts(rom, [&script], catalog.symbols())?;
    Ok(())
}
