//! Fruit profiles
//!
//! `profiles.json` maps fruit names to acquisition parameters, the
//! calibration document to use and optional threshold overrides:
//!
//! ```json
//! {
//!   "green apple": {
//!     "integration_time_ms": 100, "gain": 4, "samples": 10,
//!     "calibration": "cal/apple_cal.json",
//!     "overrides": { "r_over_g": { ">=": 1.15 } },
//!     "capture_args": ["--shutter", "8000"]
//!   },
//!   "default": {}
//! }
//! ```
//!
//! Names are canonicalized (lowercase, `_`/`-`/runs of whitespace become a
//! single space) both in the file and on lookup.

use crate::channels::BandMap;
use crate::decision::ThresholdOverrides;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Profile name tried when nothing else matches
pub const UNKNOWN_FRUIT: &str = "unknown";

/// Last-resort profile name
pub const DEFAULT_PROFILE: &str = "default";

/// Curated equivalence groups, canonical spelling
const ALIAS_GROUPS: &[&[&str]] = &[
    &["apple", "green apple", "red apple", "granny smith"],
    &["banana", "bananas"],
    &["mango", "mangos", "mangoes"],
    &["avocado", "avocados", "avo"],
];

fn default_integration_time_ms() -> u32 {
    100
}

fn default_gain() -> u32 {
    4
}

fn default_samples() -> u32 {
    10
}

/// Acquisition, calibration and override bundle for one fruit type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FruitProfile {
    #[serde(default = "default_integration_time_ms", alias = "it")]
    pub integration_time_ms: u32,

    #[serde(default = "default_gain")]
    pub gain: u32,

    #[serde(default = "default_samples")]
    pub samples: u32,

    /// Calibration document; relative paths resolve against the profiles file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<PathBuf>,

    #[serde(default, alias = "indices", skip_serializing_if = "ThresholdOverrides::is_empty")]
    pub overrides: ThresholdOverrides,

    /// Extra camera arguments; non-empty triggers a profile-specific recapture
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capture_args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub band_map: Option<BandMap>,
}

impl Default for FruitProfile {
    fn default() -> Self {
        Self {
            integration_time_ms: default_integration_time_ms(),
            gain: default_gain(),
            samples: default_samples(),
            calibration: None,
            overrides: ThresholdOverrides::default(),
            capture_args: Vec::new(),
            band_map: None,
        }
    }
}

impl FruitProfile {
    pub fn requires_recapture(&self) -> bool {
        !self.capture_args.is_empty()
    }
}

/// Outcome of profile resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProfile {
    /// Name that was asked for
    pub requested: String,
    /// Profile key that matched, `None` when built-in defaults apply
    pub matched: Option<String>,
    pub profile: FruitProfile,
}

/// All profiles from one profiles document
#[derive(Debug, Clone, Default)]
pub struct ProfileSet {
    profiles: BTreeMap<String, FruitProfile>,
    base_dir: Option<PathBuf>,
}

impl ProfileSet {
    pub fn new(profiles: impl IntoIterator<Item = (String, FruitProfile)>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|(name, p)| (canonical_name(&name), p))
                .collect(),
            base_dir: None,
        }
    }

    /// Load a profiles document
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!("profiles file {}", path.display())));
        }
        let text = fs::read_to_string(path)?;
        let raw: BTreeMap<String, FruitProfile> =
            serde_json::from_str(&text).map_err(|e| Error::malformed(path, e.to_string()))?;

        let mut set = Self::new(raw);
        set.base_dir = path.parent().map(Path::to_path_buf);
        info!(path = %path.display(), profiles = set.len(), "Profiles loaded");
        Ok(set)
    }

    /// Load, treating a missing file as an empty set
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(Error::NotFound(_)) => {
                info!(path = %path.display(), "No profiles file, using built-in defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&FruitProfile> {
        self.profiles.get(&canonical_name(name))
    }

    /// Resolve a profile-relative path against the profiles file location
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Lowercase, trim, and collapse `_`, `-` and whitespace runs to one space
pub fn canonical_name(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether two fruit names are equal or in the same alias group
pub fn same_fruit(a: &str, b: &str) -> bool {
    let (a, b) = (canonical_name(a), canonical_name(b));
    a == b
        || ALIAS_GROUPS
            .iter()
            .any(|g| g.contains(&a.as_str()) && g.contains(&b.as_str()))
}

/// Lookup order for `name`: itself, its alias group, `unknown`, `default`
pub fn candidate_chain(name: &str) -> Vec<String> {
    let canonical = canonical_name(name);
    let mut chain = vec![canonical.clone()];

    if let Some(group) = ALIAS_GROUPS.iter().find(|g| g.contains(&canonical.as_str())) {
        chain.extend(group.iter().map(|s| s.to_string()));
    }
    chain.push(UNKNOWN_FRUIT.to_string());
    chain.push(DEFAULT_PROFILE.to_string());

    let mut seen = Vec::with_capacity(chain.len());
    chain.retain(|c| {
        if seen.contains(c) {
            false
        } else {
            seen.push(c.clone());
            true
        }
    });
    chain
}

/// Resolve `fruit` against `profiles`; never fails
///
/// Falls back to a default [`FruitProfile`] when nothing in the candidate
/// chain is present.
pub fn resolve_fruit_profile(fruit: &str, profiles: &ProfileSet) -> ResolvedProfile {
    for candidate in candidate_chain(fruit) {
        if let Some(profile) = profiles.profiles.get(&candidate) {
            debug!(fruit, matched = %candidate, "Fruit profile resolved");
            return ResolvedProfile {
                requested: fruit.to_string(),
                matched: Some(candidate),
                profile: profile.clone(),
            };
        }
    }

    debug!(fruit, "No fruit profile matched, using defaults");
    ResolvedProfile {
        requested: fruit.to_string(),
        matched: None,
        profile: FruitProfile::default(),
    }
}
