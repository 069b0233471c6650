pub mod category;
pub mod dataset;
pub mod export;
pub mod render;
pub mod thresholds;
