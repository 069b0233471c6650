use std::collections::{HashMap, HashSet};

use crate::{
    crs::crs_utils::spatial_ref_to_definition,
    error::MapError,
    geofile::{feature::FeatureMap, gdal_geofile::GeofileContents},
};

/// One region of the map: its source attributes, its shape and the metric entered for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub attributes: FeatureMap,
    /// Shape in the dataset's spatial reference. Never edited, only reprojected for display.
    pub geometry: geo::MultiPolygon,
    pub metric: f64,
}

impl Region {
    /// Value of attribute `column`, empty if the feature has no value for it.
    pub fn label(&self, column: &str) -> &str {
        self.attributes
            .get(column)
            .map(|value| value.as_str())
            .unwrap_or("")
    }
}

/// Regions sharing one spatial reference, in the order they were read.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    regions: Vec<Region>,
    /// PROJ-compatible definition of the spatial reference, `None` if the source had none.
    crs: Option<String>,
    columns: Vec<String>,
}

fn to_multi_polygon(index: usize, geometry: geo::Geometry) -> Result<geo::MultiPolygon, MapError> {
    match geometry {
        geo::Geometry::Polygon(polygon) => Ok(geo::MultiPolygon::new(vec![polygon])),
        geo::Geometry::MultiPolygon(multi_polygon) => Ok(multi_polygon),
        other => Err(MapError::UnsupportedGeometry {
            index,
            reason: geometry_type_name(&other).to_string(),
        }),
    }
}

fn geometry_type_name(geometry: &geo::Geometry) -> &'static str {
    match geometry {
        geo::Geometry::Point(_) => "Point",
        geo::Geometry::Line(_) => "Line",
        geo::Geometry::LineString(_) => "LineString",
        geo::Geometry::Polygon(_) => "Polygon",
        geo::Geometry::MultiPoint(_) => "MultiPoint",
        geo::Geometry::MultiLineString(_) => "MultiLineString",
        geo::Geometry::MultiPolygon(_) => "MultiPolygon",
        geo::Geometry::GeometryCollection(_) => "GeometryCollection",
        geo::Geometry::Rect(_) => "Rect",
        geo::Geometry::Triangle(_) => "Triangle",
    }
}

impl Dataset {
    /// Build a dataset with every metric set to 0. Fails without a partial result if any
    /// geometry is not polygonal.
    pub fn new(
        features: Vec<(FeatureMap, geo::Geometry)>,
        crs: Option<String>,
        columns: Vec<String>,
    ) -> anyhow::Result<Self> {
        let regions = features
            .into_iter()
            .enumerate()
            .map(|(index, (attributes, geometry))| {
                Ok(Region {
                    attributes,
                    geometry: to_multi_polygon(index, geometry)?,
                    metric: 0.0,
                })
            })
            .collect::<Result<Vec<Region>, MapError>>()?;
        Ok(Self {
            regions,
            crs,
            columns,
        })
    }

    pub fn from_geofile(contents: GeofileContents) -> anyhow::Result<Self> {
        let crs = match &contents.spatial_ref {
            Some(spatial_ref) => Some(spatial_ref_to_definition(spatial_ref)?),
            None => None,
        };
        let features = contents
            .features
            .into_iter()
            .map(|feature| (feature.attributes, feature.geometry))
            .collect();
        Self::new(features, crs, contents.field_names)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn crs(&self) -> Option<&str> {
        self.crs.as_deref()
    }

    /// Attribute columns that can serve as labels, in source order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn ensure_column(&self, column: &str) -> Result<(), MapError> {
        if self.columns.iter().any(|name| name == column) {
            Ok(())
        } else {
            Err(MapError::UnknownColumn {
                column: column.to_string(),
                available: self.columns.clone(),
            })
        }
    }

    /// Label of every region for the given column, in region order.
    pub fn labels(&self, column: &str) -> Result<Vec<String>, MapError> {
        self.ensure_column(column)?;
        Ok(self
            .regions
            .iter()
            .map(|region| region.label(column).to_string())
            .collect())
    }

    pub fn set_metric(&mut self, index: usize, value: f64) -> Result<(), MapError> {
        let len = self.regions.len();
        let region = self
            .regions
            .get_mut(index)
            .ok_or(MapError::FeatureIndexOutOfRange { index, len })?;
        region.metric = value;
        Ok(())
    }

    /// Assign metrics by label value of `column`. Every region sharing a label gets the value.
    /// Returns the number of regions updated; labels that match no region are logged and ignored.
    pub fn set_metrics_by_label(
        &mut self,
        column: &str,
        metrics: &HashMap<String, f64>,
    ) -> Result<usize, MapError> {
        self.ensure_column(column)?;
        let mut matched_labels = HashSet::new();
        let mut updated = 0;
        for region in self.regions.iter_mut() {
            if let Some(value) = metrics.get(region.label(column)) {
                matched_labels.insert(region.label(column).to_string());
                region.metric = *value;
                updated += 1;
            }
        }
        let mut unmatched: Vec<&String> = metrics
            .keys()
            .filter(|label| !matched_labels.contains(*label))
            .collect();
        if !unmatched.is_empty() {
            unmatched.sort();
            log::warn!(
                "{} metric labels matched no feature in column '{}': {:?}",
                unmatched.len(),
                column,
                unmatched
            );
        }
        Ok(updated)
    }
}
