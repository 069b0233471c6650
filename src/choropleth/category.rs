use std::fmt;

use serde::{Deserialize, Serialize};

/// Color bucket a region falls into. Variants are ordered from the lowest to the highest metric range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Green,
    Yellow,
    Orange,
    Red,
    Gray,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Green,
        Category::Yellow,
        Category::Orange,
        Category::Red,
        Category::Gray,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Category::Green => "green",
            Category::Yellow => "yellow",
            Category::Orange => "orange",
            Category::Red => "red",
            Category::Gray => "gray",
        }
    }

    /// Fill color as an RGB triple, using the web color of the same name.
    pub fn rgb(&self) -> (u8, u8, u8) {
        match self {
            Category::Green => (0, 128, 0),
            Category::Yellow => (255, 255, 0),
            Category::Orange => (255, 165, 0),
            Category::Red => (255, 0, 0),
            Category::Gray => (128, 128, 128),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
