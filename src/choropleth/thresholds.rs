use serde::{Deserialize, Serialize};

use crate::error::MapError;

use super::category::Category;

const MIN_THRESHOLD: f64 = 0.0;
const MAX_THRESHOLD: f64 = 100.0;

/// Four ascending boundaries splitting the metric axis into five categories.
///
/// The invariant `0 <= green <= yellow <= orange <= red <= 100` is checked on construction, so every
/// `ThresholdSet` in circulation is valid. Out-of-order input is rejected rather than clamped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawThresholdSet", into = "RawThresholdSet")]
pub struct ThresholdSet {
    green: f64,
    yellow: f64,
    orange: f64,
    red: f64,
}

/// Unvalidated thresholds as they appear in configuration files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawThresholdSet {
    green: f64,
    yellow: f64,
    orange: f64,
    red: f64,
}

impl TryFrom<RawThresholdSet> for ThresholdSet {
    type Error = MapError;

    fn try_from(raw: RawThresholdSet) -> Result<Self, Self::Error> {
        ThresholdSet::new(raw.green, raw.yellow, raw.orange, raw.red)
    }
}

impl From<ThresholdSet> for RawThresholdSet {
    fn from(thresholds: ThresholdSet) -> Self {
        Self {
            green: thresholds.green,
            yellow: thresholds.yellow,
            orange: thresholds.orange,
            red: thresholds.red,
        }
    }
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            green: 5.0,
            yellow: 19.0,
            orange: 39.0,
            red: 59.0,
        }
    }
}

impl ThresholdSet {
    pub fn new(green: f64, yellow: f64, orange: f64, red: f64) -> Result<Self, MapError> {
        let named = [
            (Category::Green, green),
            (Category::Yellow, yellow),
            (Category::Orange, orange),
            (Category::Red, red),
        ];
        for (category, value) in named {
            if !value.is_finite() {
                return Err(MapError::InvalidThresholds(format!(
                    "{} threshold must be a finite number, got {}",
                    category, value
                )));
            }
            if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&value) {
                return Err(MapError::InvalidThresholds(format!(
                    "{} threshold must be between {} and {}, got {}",
                    category, MIN_THRESHOLD, MAX_THRESHOLD, value
                )));
            }
        }
        for pair in named.windows(2) {
            let (lower_category, lower) = pair[0];
            let (upper_category, upper) = pair[1];
            if upper < lower {
                return Err(MapError::InvalidThresholds(format!(
                    "{} threshold ({}) must not be below the {} threshold ({})",
                    upper_category, upper, lower_category, lower
                )));
            }
        }
        Ok(Self {
            green,
            yellow,
            orange,
            red,
        })
    }

    pub fn green(&self) -> f64 {
        self.green
    }

    pub fn yellow(&self) -> f64 {
        self.yellow
    }

    pub fn orange(&self) -> f64 {
        self.orange
    }

    pub fn red(&self) -> f64 {
        self.red
    }

    /// The lower boundary of `category`'s successor, i.e. the value entered for `category` in the threshold inputs.
    pub fn get(&self, category: Category) -> Option<f64> {
        match category {
            Category::Green => Some(self.green),
            Category::Yellow => Some(self.yellow),
            Category::Orange => Some(self.orange),
            Category::Red => Some(self.red),
            Category::Gray => None,
        }
    }

    /// Return a copy with the threshold of `category` replaced, validated like `new`.
    pub fn with(&self, category: Category, value: f64) -> Result<Self, MapError> {
        let (mut green, mut yellow, mut orange, mut red) =
            (self.green, self.yellow, self.orange, self.red);
        match category {
            Category::Green => green = value,
            Category::Yellow => yellow = value,
            Category::Orange => orange = value,
            Category::Red => red = value,
            Category::Gray => return Err(MapError::NoThresholdForCategory(category)),
        }
        Self::new(green, yellow, orange, red)
    }

    /// Map a metric to its category. Intervals are closed on the left, so a metric equal to a
    /// threshold belongs to the next category up. Values that compare false against every
    /// threshold (NaN) land in the last bucket.
    pub fn classify(&self, metric: f64) -> Category {
        if metric < self.green {
            Category::Green
        } else if metric < self.yellow {
            Category::Yellow
        } else if metric < self.orange {
            Category::Orange
        } else if metric < self.red {
            Category::Red
        } else {
            Category::Gray
        }
    }

    /// Legend text for each category, in category order.
    pub fn legend_entries(&self) -> Vec<(Category, String)> {
        let mut lower = None;
        Category::ALL
            .iter()
            .map(|&category| {
                let upper = self.get(category);
                let label = match (lower, upper) {
                    (None, Some(upper)) => format!("< {}%", upper),
                    (Some(lower), Some(upper)) => format!("{}–{}%", lower, upper),
                    (_, None) => "Other".to_string(),
                };
                lower = upper;
                (category, label)
            })
            .collect()
    }
}
