//! Stem names and requested stem sets

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SeparationError;

/// One isolated source in the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stem {
    Vocals,
    Instrumental,
    Drums,
    Bass,
}

impl Stem {
    pub const ALL: [Stem; 4] = [Stem::Vocals, Stem::Instrumental, Stem::Drums, Stem::Bass];

    /// Lowercase identifier used in requests and responses
    pub fn as_str(&self) -> &'static str {
        match self {
            Stem::Vocals => "vocals",
            Stem::Instrumental => "instrumental",
            Stem::Drums => "drums",
            Stem::Bass => "bass",
        }
    }

    /// Capitalized name for output filenames
    pub fn display_name(&self) -> &'static str {
        match self {
            Stem::Vocals => "Vocals",
            Stem::Instrumental => "Instrumental",
            Stem::Drums => "Drums",
            Stem::Bass => "Bass",
        }
    }
}

impl std::fmt::Display for Stem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stem {
    type Err = SeparationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vocals" | "vocal" => Ok(Stem::Vocals),
            "instrumental" | "accompaniment" => Ok(Stem::Instrumental),
            "drums" => Ok(Stem::Drums),
            "bass" => Ok(Stem::Bass),
            other => Err(SeparationError::InvalidRequest(format!("unknown stem '{}'", other))),
        }
    }
}

/// Ordered, duplicate-free set of requested stems
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StemSet(BTreeSet<Stem>);

impl StemSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vocals and instrumental
    pub fn vocal_split() -> Self {
        [Stem::Vocals, Stem::Instrumental].into_iter().collect()
    }

    pub fn insert(&mut self, stem: Stem) -> bool {
        self.0.insert(stem)
    }

    pub fn contains(&self, stem: Stem) -> bool {
        self.0.contains(&stem)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Stem> + '_ {
        self.0.iter().copied()
    }

    /// Parse a list of stem names, rejecting unknown names
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, SeparationError> {
        names.iter().map(|n| n.as_ref().parse()).collect()
    }
}

impl FromIterator<Stem> for StemSet {
    fn from_iter<I: IntoIterator<Item = Stem>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a StemSet {
    type Item = Stem;
    type IntoIter = std::iter::Copied<std::collections::btree_set::Iter<'a, Stem>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter().copied()
    }
}
