use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::Category;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SpoilerEntry {
    pub location: String,
    pub item: String,
    pub category: Category,
}

/// Placement decisions in the order they were made.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Spoiler {
    pub seed: u64,
    pub entries: Vec<SpoilerEntry>,
}

impl Spoiler {
    pub fn new(seed: u64) -> Self {
        Spoiler {
            seed,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, location: &str, item: &str, category: Category) {
        self.entries.push(SpoilerEntry {
            location: location.to_string(),
            item: item.to_string(),
            category,
        });
    }

    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.entries
            .iter()
            .map(|e| format!("{}: {}", e.location, e.item))
    }

    pub fn to_text(&self) -> String {
        self.to_string()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Spoiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_line_per_entry() {
        let mut s = Spoiler::new(7);
        s.push("Fire Eyes: Flash", "Levitate", Category::Alchemy);
        s.push("Thraxx", "Energy Core", Category::Boss);
        assert_eq!(
            s.to_text(),
            "Fire Eyes: Flash: Levitate\nThraxx: Energy Core\n"
        );
        assert_eq!(s.to_text().lines().count(), 2);

        let back: Spoiler = serde_json::from_str(&s.to_json().unwrap()).unwrap();
        assert_eq!(back, s);
    }
}
