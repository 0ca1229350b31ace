use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, LocationId};
use crate::randomize::Placement;

/// Kinds of progress a check or item can grant.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    Weapon,
    RockSkip,
    Rocket,
    EnergyCore,
    FinalBoss,
    JaguarRing,
}

/// `pieces` units of `progress`; used both for requirements and grants.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Pieces {
    pub pieces: u32,
    pub progress: Progress,
}

impl Pieces {
    pub fn new(pieces: u32, progress: Progress) -> Self {
        Pieces { pieces, progress }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Inventory {
    counts: BTreeMap<Progress, u32>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, progress: Progress) -> u32 {
        self.counts.get(&progress).copied().unwrap_or(0)
    }

    pub fn grant(&mut self, grant: &Pieces) {
        *self.counts.entry(grant.progress).or_insert(0) += grant.pieces;
    }

    pub fn grant_all(&mut self, grants: &[Pieces]) {
        for g in grants {
            self.grant(g);
        }
    }

    /// All requirements must hold at once.
    pub fn satisfies(&self, requires: &[Pieces]) -> bool {
        requires.iter().all(|r| self.count(r.progress) >= r.pieces)
    }
}

/// Result of a reachability sweep.
#[derive(Clone, Debug, Default)]
pub struct Reach {
    pub locations: BTreeSet<LocationId>,
    pub inventory: Inventory,
}

/// Completability predicate.
///
/// Implementations must be monotonic: a larger `start` inventory or a
/// placement with more progression items never shrinks the result.
pub trait Reachability {
    fn reachable(&self, placement: &Placement, start: &Inventory) -> Reach;
}

impl Reachability for Catalog {
    fn reachable(&self, placement: &Placement, start: &Inventory) -> Reach {
        let mut inventory = start.clone();
        let mut locations = BTreeSet::new();
        let mut rules_done = vec![false; self.rules().len()];

        loop {
            let mut changed = false;

            for (idx, rule) in self.rules().iter().enumerate() {
                if !rules_done[idx] && inventory.satisfies(&rule.requires) {
                    rules_done[idx] = true;
                    inventory.grant_all(&rule.provides);
                    changed = true;
                }
            }

            for loc in self.locations() {
                if locations.contains(&loc.id) || !inventory.satisfies(&loc.requires) {
                    continue;
                }
                locations.insert(loc.id);
                inventory.grant_all(&loc.provides);
                if let Some(item) = placement.get(loc.id).and_then(|id| self.item(id)) {
                    inventory.grant_all(&item.provides);
                }
                changed = true;
            }

            if !changed {
                break;
            }
        }

        Reach {
            locations,
            inventory,
        }
    }
}

impl Catalog {
    pub fn goal_met(&self, inventory: &Inventory) -> bool {
        inventory.satisfies(self.goal())
    }

    /// Locations holding a progression item that `reach` does not cover.
    pub fn stranded_progression(&self, placement: &Placement, reach: &Reach) -> Vec<LocationId> {
        placement
            .iter()
            .filter(|(loc, item)| {
                !reach.locations.contains(loc)
                    && self.item(*item).map_or(false, |i| i.is_progression())
            })
            .map(|(loc, _)| loc)
            .collect()
    }

    /// Full completability check from the empty starting inventory.
    pub fn is_completable(&self, placement: &Placement) -> bool {
        let reach = self.reachable(placement, &Inventory::new());
        self.goal_met(&reach.inventory) && self.stranded_progression(placement, &reach).is_empty()
    }
}
