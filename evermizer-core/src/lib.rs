use log::info;
use thiserror::Error;

pub mod catalog;
pub mod ips;
pub mod logic;
pub mod options;
pub mod randomize;
pub mod rom;
pub mod script;
pub mod spoiler;

pub use catalog::{Catalog, Category, Item, ItemId, Location, LocationId};
pub use options::{Difficulty, ForcedPlacement, MultiworldId, Options, Seed};
pub use randomize::{randomize, write_placement, Placement, Randomization};
pub use rom::{OutOfBounds, Rom};
pub use spoiler::{Spoiler, SpoilerEntry};

use ips::apply_ips;
use script::apply_scripts;

#[derive(Debug, Error)]
pub enum EvermizerError {
    #[error("malformed patch at byte {pos}: {reason}")]
    PatchFormat { pos: usize, reason: String },
    #[error("patch record at byte {pos} out of range")]
    PatchRange {
        pos: usize,
        #[source]
        source: OutOfBounds,
    },
    #[error("patch parse error at byte {pos}: {reason}")]
    PatchParse { pos: usize, reason: String },
    #[error("script {script} references unknown symbol {symbol}")]
    ScriptReference { script: String, symbol: String },
    #[error("script {script} op {op} out of range")]
    ScriptRange {
        script: String,
        op: usize,
        #[source]
        source: OutOfBounds,
    },
    #[error("seed {seed}: no completable placement after {attempts} attempts")]
    UnsatisfiableSeed { seed: u64, attempts: u32 },
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("catalog is not valid JSON: {0}")]
    CatalogJson(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EvermizerError>;

#[derive(Clone, Debug)]
pub struct BuildOutput {
    pub image: Vec<u8>,
    pub spoiler: Spoiler,
    /// Normalized seed the generator was started from.
    pub seed: u64,
}

/// Produces a patched, randomized image from a stock `input_image`.
///
/// The input is copied, never modified. Nothing touches the filesystem, so
/// any number of builds may share one `catalog` across threads.
pub fn build(
    catalog: &Catalog,
    input_image: &[u8],
    seed: &Seed,
    options: &Options,
) -> Result<BuildOutput> {
    if input_image.len() != catalog.image_size() {
        return Err(EvermizerError::InvalidOptions(format!(
            "input image is {} bytes, expected {}",
            input_image.len(),
            catalog.image_size()
        )));
    }
    options.validate(catalog)?;
    let seed_value = seed.to_u64();
    info!("building seed {seed} ({seed_value})");

    let mut rom = Rom::new(input_image.to_vec());

    if !catalog.baseline().is_empty() {
        let records = apply_ips(&mut rom, catalog.baseline())?;
        info!("baseline patch applied ({records} records)");
    }

    let written = apply_scripts(
        &mut rom,
        script::select(catalog.scripts(), &options.patches),
        catalog.symbols(),
    )?;
    info!("script patches applied ({written} writes)");

    let settings = options.settings_script();
    if !settings.ops.is_empty() {
        settings.apply(&mut rom, catalog.symbols())?;
    }

    let Randomization {
        placement,
        spoiler,
        attempt,
    } = randomize(catalog, seed, options)?;
    write_placement(&mut rom, catalog, &placement)?;
    info!(
        "seed {seed_value}: {} locations written after {attempt} attempt(s)",
        placement.len()
    );

    Ok(BuildOutput {
        image: rom.into_data(),
        spoiler,
        seed: seed_value,
    })
}
