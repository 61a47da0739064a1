// Lots (players) put up for auction, and bulk catalog import from CSV.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Rejection;

/// Maximum number of specialty tags a lot may carry.
pub const MAX_SPECIALTIES: usize = 3;

/// Engine-assigned identity of a lot. Names are free text and may repeat, so
/// everything that must happen "once per lot" keys on this instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LotId(pub u64);

impl fmt::Display for LotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A lot in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub id: LotId,
    /// Display name. Not required to be unique.
    pub name: String,
    /// Skill tier label (e.g. "Radiant", "Immortal 2").
    pub tier: String,
    /// Up to [`MAX_SPECIALTIES`] specialty tags.
    #[serde(default)]
    pub specialties: Vec<String>,
    /// Free-text remark shown alongside the lot.
    #[serde(default)]
    pub remark: String,
    pub sold: bool,
    /// Hammer price; 0 until sold.
    pub price: u32,
    /// Name of the winning team once sold.
    pub winner: Option<String>,
}

impl Lot {
    /// Stamp the lot as sold. Called exactly once per lot by the engine.
    pub(crate) fn mark_sold(&mut self, team: &str, price: u32) {
        self.sold = true;
        self.price = price;
        self.winner = Some(team.to_string());
    }
}

/// Fields supplied by the caller of `addLot`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLot {
    pub name: String,
    pub tier: String,
    #[serde(default)]
    pub specialties: Vec<String>,
    #[serde(default)]
    pub remark: String,
}

impl NewLot {
    pub fn new(name: impl Into<String>, tier: impl Into<String>) -> Self {
        NewLot {
            name: name.into(),
            tier: tier.into(),
            specialties: Vec::new(),
            remark: String::new(),
        }
    }

    pub fn with_specialties<I, S>(mut self, specialties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.specialties = specialties.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into();
        self
    }

    /// Validate and turn into a catalog entry with the given identity.
    ///
    /// Name and tier are trimmed and must be non-blank. Blank specialty
    /// entries are dropped before the [`MAX_SPECIALTIES`] limit is checked.
    pub(crate) fn into_lot(self, id: LotId) -> Result<Lot, Rejection> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(Rejection::BlankField {
                field: "name".into(),
            });
        }
        let tier = self.tier.trim();
        if tier.is_empty() {
            return Err(Rejection::BlankField {
                field: "tier".into(),
            });
        }

        let specialties: Vec<String> = self
            .specialties
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if specialties.len() > MAX_SPECIALTIES {
            return Err(Rejection::TooManySpecialties {
                max: MAX_SPECIALTIES,
                got: specialties.len(),
            });
        }

        Ok(Lot {
            id,
            name: name.to_string(),
            tier: tier.to_string(),
            specialties,
            remark: self.remark.trim().to_string(),
            sold: false,
            price: 0,
            winner: None,
        })
    }
}

// ---------------------------------------------------------------------------
// CSV catalog import
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("CSV error in {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
}

/// One row of a lot catalog CSV. Extra columns are ignored.
#[derive(Debug, Deserialize)]
struct RawLotRow {
    name: String,
    tier: String,
    #[serde(default)]
    specialty1: Option<String>,
    #[serde(default)]
    specialty2: Option<String>,
    #[serde(default)]
    specialty3: Option<String>,
    #[serde(default)]
    remark: Option<String>,
}

/// Load lots from a CSV file with a `name,tier,specialty1,specialty2,specialty3,remark`
/// header. Malformed rows are skipped with a warning; validation of names
/// and tiers happens later, when each lot is added through the engine.
pub fn load_lots_csv(path: &Path) -> Result<Vec<NewLot>, CatalogError> {
    let file = std::fs::File::open(path).map_err(|e| CatalogError::Csv {
        path: path.to_path_buf(),
        source: csv::Error::from(e),
    })?;
    load_lots_from_reader(file).map_err(|source| CatalogError::Csv {
        path: path.to_path_buf(),
        source,
    })
}

fn load_lots_from_reader<R: Read>(rdr: R) -> Result<Vec<NewLot>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(rdr);
    let mut lots = Vec::new();
    for result in reader.deserialize::<RawLotRow>() {
        match result {
            Ok(raw) => {
                let specialties = [raw.specialty1, raw.specialty2, raw.specialty3]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>();
                lots.push(NewLot {
                    name: raw.name,
                    tier: raw.tier,
                    specialties,
                    remark: raw.remark.unwrap_or_default(),
                });
            }
            Err(e) => {
                warn!("skipping malformed lot row: {}", e);
            }
        }
    }
    Ok(lots)
}
