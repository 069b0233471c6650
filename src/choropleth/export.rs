use std::{fs, path::Path};

use anyhow::Context;

use crate::{
    crs::crs_utils::{spatial_ref_from_epsg, WEB_MERCATOR_EPSG},
    geofile::{
        feature::{Feature, FeatureMap},
        gdal_geofile::{write_features_to_geofile, GdalDriverType},
    },
};

use super::render::MapPlan;

pub const LABEL_FIELD: &str = "label";
pub const METRIC_FIELD: &str = "metric";
pub const CATEGORY_FIELD: &str = "category";

/// Write the classified regions of a plan, in display coordinates, to a GeoJSON file.
pub fn export_classified_features(plan: &MapPlan, output_filepath: &Path) -> anyhow::Result<()> {
    if output_filepath.exists() {
        fs::remove_file(output_filepath)
            .with_context(|| format!("Removing previous export {:?}", output_filepath))?;
    }
    let features: Vec<Feature> = plan
        .regions
        .iter()
        .map(|region| {
            Feature::with_attributes(
                geo::Geometry::MultiPolygon(region.geometry.clone()),
                FeatureMap::from([
                    (LABEL_FIELD.to_string(), region.label.clone()),
                    (METRIC_FIELD.to_string(), region.metric.to_string()),
                    (CATEGORY_FIELD.to_string(), region.category.to_string()),
                ]),
            )
        })
        .collect();
    let crs = spatial_ref_from_epsg(WEB_MERCATOR_EPSG)?;
    write_features_to_geofile(
        &features,
        output_filepath,
        Some(&crs),
        GdalDriverType::GeoJson.name(),
    )
}
