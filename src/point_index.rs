// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

// Endpoint resolution for connection records

use crate::models::{Point, PointId};
use ahash::AHashMap;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TRAILING_PARENTHETICAL_REGEX: Regex = Regex::new(r"\s*\([^()]*\)\s*$").unwrap();
    static ref SEPARATOR_REGEX: Regex = Regex::new(r"[\s_\-]+").unwrap();
}

/// Administrative code values that mean "no code".
const NULL_CODE_SENTINELS: [&str; 7] = ["", "null", "none", "undefined", "nan", "n/a", "-"];

/// Which lookup table produced a match, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchStrategy {
    LgdCode,
    ExactName,
    UppercaseName,
    BaseName,
    SpellingVariant,
    Substring,
}

impl MatchStrategy {
    pub fn confidence(&self) -> f64 {
        match self {
            MatchStrategy::LgdCode => 1.0,
            MatchStrategy::ExactName => 1.0,
            MatchStrategy::UppercaseName => 0.95,
            MatchStrategy::BaseName => 0.85,
            MatchStrategy::SpellingVariant => 0.8,
            MatchStrategy::Substring => 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub point: Option<PointId>,
    pub strategy: Option<MatchStrategy>,
    pub confidence: f64,
}

impl Resolution {
    fn hit(point: PointId, strategy: MatchStrategy) -> Self {
        Self {
            point: Some(point),
            strategy: Some(strategy),
            confidence: strategy.confidence(),
        }
    }

    pub fn miss() -> Self {
        Self {
            point: None,
            strategy: None,
            confidence: 0.0,
        }
    }
}

pub trait PointResolver {
    /// Resolve an endpoint reference given as a name and/or administrative code.
    fn resolve(&self, name: Option<&str>, lgd_code: Option<&str>) -> Resolution;
}

pub fn is_null_code(code: &str) -> bool {
    let lowered = code.trim().to_ascii_lowercase();
    NULL_CODE_SENTINELS.contains(&lowered.as_str())
}

/// `"Rampur GP (Block 2)"` -> `"RAMPUR GP"`.
pub fn base_name(name: &str) -> String {
    TRAILING_PARENTHETICAL_REGEX
        .replace(name.trim(), "")
        .trim()
        .to_uppercase()
}

/// Folds hyphens, underscores and runs of whitespace into a single space.
pub fn spelling_variant(name: &str) -> String {
    SEPARATOR_REGEX
        .replace_all(name.trim(), " ")
        .trim()
        .to_uppercase()
}

#[derive(Debug, Clone, Default)]
pub struct PointIndex {
    by_name: AHashMap<String, PointId>,
    by_upper_name: AHashMap<String, PointId>,
    by_lgd_code: AHashMap<String, PointId>,
    by_base_name: AHashMap<String, PointId>,
    by_variant: AHashMap<String, PointId>,
    // insertion order, for a deterministic substring scan
    scan_keys: Vec<(String, PointId)>,
}

impl PointIndex {
    pub fn build(points: &[Point]) -> Self {
        let mut index = PointIndex::default();
        for (i, point) in points.iter().enumerate() {
            index.insert(PointId(i), point);
        }
        index
    }

    /// First point wins for any duplicated key.
    pub fn insert(&mut self, id: PointId, point: &Point) {
        let name = point.name.trim();
        if !name.is_empty() {
            let upper = name.to_uppercase();
            self.by_name.entry(name.to_string()).or_insert(id);
            self.by_base_name.entry(base_name(name)).or_insert(id);
            self.by_variant.entry(spelling_variant(name)).or_insert(id);
            if !self.by_upper_name.contains_key(&upper) {
                self.by_upper_name.insert(upper.clone(), id);
                self.scan_keys.push((upper, id));
            }
        }

        if let Some(code) = point.lgd_code.as_deref() {
            if !is_null_code(code) {
                self.by_lgd_code.entry(code.trim().to_string()).or_insert(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.scan_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scan_keys.is_empty()
    }

    fn by_name(&self, name: &str) -> Option<Resolution> {
        if let Some(id) = self.by_name.get(name) {
            return Some(Resolution::hit(*id, MatchStrategy::ExactName));
        }
        self.by_upper_name
            .get(&name.to_uppercase())
            .map(|id| Resolution::hit(*id, MatchStrategy::UppercaseName))
    }

    fn by_base(&self, name: &str) -> Option<Resolution> {
        let base = base_name(name);
        if base.is_empty() {
            return None;
        }
        self.by_base_name
            .get(&base)
            .or_else(|| self.by_upper_name.get(&base))
            .map(|id| Resolution::hit(*id, MatchStrategy::BaseName))
    }

    fn by_variant(&self, name: &str) -> Option<Resolution> {
        let variant = spelling_variant(name);
        if variant.is_empty() {
            return None;
        }
        self.by_variant
            .get(&variant)
            .or_else(|| self.by_variant.get(&spelling_variant(&base_name(name))))
            .map(|id| Resolution::hit(*id, MatchStrategy::SpellingVariant))
    }

    fn by_substring(&self, name: &str) -> Option<Resolution> {
        let needle = name.to_uppercase();
        if needle.is_empty() {
            return None;
        }
        self.scan_keys
            .iter()
            .find(|(key, _)| key.contains(&needle) || needle.contains(key.as_str()))
            .map(|(_, id)| Resolution::hit(*id, MatchStrategy::Substring))
    }
}

impl PointResolver for PointIndex {
    fn resolve(&self, name: Option<&str>, lgd_code: Option<&str>) -> Resolution {
        if let Some(code) = lgd_code.filter(|c| !is_null_code(c)) {
            if let Some(id) = self.by_lgd_code.get(code.trim()) {
                return Resolution::hit(*id, MatchStrategy::LgdCode);
            }
        }

        let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
            return Resolution::miss();
        };

        self.by_name(name)
            .or_else(|| self.by_base(name))
            .or_else(|| self.by_variant(name))
            .or_else(|| self.by_substring(name))
            .unwrap_or_else(Resolution::miss)
    }
}
