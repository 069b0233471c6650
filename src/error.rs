use crate::choropleth::category::Category;

/// Coarse grouping of failures. The command line reports each kind with its own exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Ingest,
    Input,
    Configuration,
    Render,
    Narration,
}

impl ErrorKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Ingest => 2,
            ErrorKind::Input => 3,
            ErrorKind::Configuration => 4,
            ErrorKind::Render => 5,
            ErrorKind::Narration => 6,
        }
    }
}

/// Exit code for a failed run: the code of the first `MapError` in the chain, 1 for anything else.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<MapError>())
        .map(|map_error| map_error.kind().exit_code())
        .unwrap_or(1)
}

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("Could not open the uploaded archive as a zip file: {0}")]
    InvalidArchive(String),
    #[error("No .shp file found in the uploaded archive {archive}")]
    NoShapefileInArchive { archive: String },
    #[error("Feature {index} has unsupported geometry ({reason}), only polygons and multipolygons can be mapped")]
    UnsupportedGeometry { index: usize, reason: String },
    #[error("The dataset has no features to render")]
    EmptyDataset,
    #[error("No shapefile has been uploaded yet")]
    NoDataset,
    #[error("Column '{column}' does not exist, available columns are: {}", .available.join(", "))]
    UnknownColumn {
        column: String,
        available: Vec<String>,
    },
    #[error("The dataset has no attribute columns to label regions with")]
    NoLabelColumn,
    #[error("Feature index {index} is out of range for a dataset with {len} features")]
    FeatureIndexOutOfRange { index: usize, len: usize },
    #[error("Invalid thresholds: {0}")]
    InvalidThresholds(String),
    #[error("Category '{0}' has no configurable threshold")]
    NoThresholdForCategory(Category),
    #[error("Inference service credential not found, set the {variable} environment variable to enable map analysis")]
    MissingCredential { variable: String },
    #[error("Could not render the map: {0}")]
    Render(String),
    #[error("Map analysis failed: {0}")]
    Narration(String),
}

impl MapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MapError::InvalidArchive(_)
            | MapError::NoShapefileInArchive { .. }
            | MapError::UnsupportedGeometry { .. } => ErrorKind::Ingest,
            MapError::EmptyDataset
            | MapError::NoDataset
            | MapError::UnknownColumn { .. }
            | MapError::NoLabelColumn
            | MapError::FeatureIndexOutOfRange { .. }
            | MapError::InvalidThresholds(_)
            | MapError::NoThresholdForCategory(_) => ErrorKind::Input,
            MapError::MissingCredential { .. } => ErrorKind::Configuration,
            MapError::Render(_) => ErrorKind::Render,
            MapError::Narration(_) => ErrorKind::Narration,
        }
    }
}
