use anyhow::{anyhow, Context};
use gdal::vector::{FieldValue, LayerAccess};
use indicatif::ProgressBar;
use rayon::prelude::*;
use std::{collections::HashSet, path::Path};

use super::feature::{Feature, FeatureMap};
use crate::crs::crs_utils::epsg_4326;

pub enum GdalDriverType {
    Shapefile,
    GeoJson,
}

impl GdalDriverType {
    pub fn name(&self) -> &'static str {
        match self {
            GdalDriverType::Shapefile => "ESRI Shapefile",
            GdalDriverType::GeoJson => "GeoJSON",
        }
    }
}

/// Everything read from a single-layer geofile.
pub struct GeofileContents {
    pub features: Vec<Feature>,
    /// `None` when the file carries no spatial reference, e.g. a shapefile without a `.prj`.
    pub spatial_ref: Option<gdal::spatial_ref::SpatialRef>,
    /// Attribute field names in layer order.
    pub field_names: Vec<String>,
}

pub fn write_features_to_geofile(
    features: &[Feature],
    output_filepath: &Path,
    crs: Option<&gdal::spatial_ref::SpatialRef>,
    driver: &str,
) -> anyhow::Result<()> {
    let driver = gdal::DriverManager::get_driver_by_name(driver).context("Getting GDAL driver")?;

    let first_feature = match features.first() {
        Some(feature) => feature,
        None => return Ok(()),
    };
    let layer_type = {
        use gdal::vector::OGRwkbGeometryType::*;
        // TODO verify that all features have the same geometry type up front.
        match &first_feature.geometry {
            geo::Geometry::Point(_) => wkbPoint,
            geo::Geometry::LineString(_) => wkbLineString,
            geo::Geometry::Polygon(_) => wkbPolygon,
            geo::Geometry::MultiPoint(_) => wkbMultiPoint,
            geo::Geometry::MultiLineString(_) => wkbMultiLineString,
            geo::Geometry::MultiPolygon(_) => wkbMultiPolygon,
            geometry => {
                return Err(anyhow!(
                    "Cannot write geometry type {:?} to file.",
                    geometry
                ))
            }
        }
    };

    let crs = match crs {
        Some(crs) => crs.clone(),
        None => epsg_4326()?,
    };
    let crs_name = crs.name()?;
    log::debug!("Using spatial ref {} for writing geofile", crs_name);

    let layer_name = output_filepath
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("");
    let mut dataset = driver.create_vector_only(output_filepath)?;
    let layer_options = gdal::LayerOptions {
        name: layer_name,
        srs: Some(&crs),
        ty: layer_type,
        options: None,
    };

    let mut layer = dataset.create_layer(layer_options)?;

    // Create the fields based on all attributes of all features.
    log::debug!("Setting up fields");
    let field_names = get_field_names(features);
    let field_definitions: Vec<(&str, gdal::vector::OGRFieldType::Type)> = field_names
        .iter()
        .map(|field_name| (field_name as &str, gdal::vector::OGRFieldType::OFTString))
        .collect();
    layer.create_defn_fields(&field_definitions)?;

    log::info!(
        "Writing {} features to {:?}",
        features.len(),
        output_filepath
    );
    unsafe {
        // Start a transaction in case the driver supports transactions, e.g. GeoPackage.
        // Committing all features once as opposed to per-feature is a massive speedup for these drivers.
        gdal_sys::OGR_L_StartTransaction(layer.c_layer());
    };
    let bar = ProgressBar::new(features.len() as u64);
    for feature in features {
        let wkb = wkb::geom_to_wkb(&feature.geometry)
            .map_err(|err| anyhow!("Could not write geometry to WKB, {:?}", err))?;
        let geometry = gdal::vector::Geometry::from_wkb(&wkb)?;

        if feature.attributes.is_empty() {
            layer.create_feature(geometry)?;
        } else {
            let mut names = Vec::new();
            let mut values = Vec::new();
            for (key, value) in &feature.attributes {
                names.push(key.as_str());
                values.push(FieldValue::StringValue(value.to_owned()))
            }
            layer.create_feature_fields(geometry, &names, &values)?;
        }

        bar.inc(1);
    }
    unsafe {
        gdal_sys::OGR_L_CommitTransaction(layer.c_layer());
    };
    bar.finish_and_clear();
    Ok(())
}

fn get_field_names(features: &[Feature]) -> Vec<String> {
    let fields: HashSet<String> = features
        .par_iter()
        .flat_map(|feature| feature.attributes.keys().cloned().collect::<Vec<String>>())
        .collect();
    let mut fields: Vec<String> = fields.into_iter().collect();
    fields.sort();
    fields
}

fn field_value_to_string(value: FieldValue) -> String {
    match value {
        FieldValue::StringValue(value) => value,
        FieldValue::IntegerValue(value) => value.to_string(),
        FieldValue::Integer64Value(value) => value.to_string(),
        FieldValue::RealValue(value) => value.to_string(),
        other => format!("{:?}", other),
    }
}

pub fn read_features_from_geofile(filepath: &Path) -> anyhow::Result<GeofileContents> {
    gdal::DriverManager::register_all();
    let mut open_options = gdal::DatasetOptions::default();
    open_options.open_flags = gdal::GdalOpenFlags::GDAL_OF_VECTOR;
    let dataset = gdal::Dataset::open_ex(filepath, open_options)
        .with_context(|| format!("Opening geofile {:?}", filepath))?;

    let layer_count = dataset.layer_count();
    if 0 == layer_count || 1 < layer_count {
        return Err(anyhow!(
            "Found {} layers, only one layer is supported.",
            layer_count
        ));
    }
    let mut layer = dataset.layer(0)?;
    let spatial_ref = layer.spatial_ref().ok();
    let field_names: Vec<String> = layer.defn().fields().map(|field| field.name()).collect();

    let mut features = Vec::new();
    for (index, gdal_feature) in layer.features().enumerate() {
        let geometry = gdal_feature
            .geometry_by_index(0)
            .map_err(|err| anyhow!("Feature {} has no readable geometry, {}", index, err))?;
        let wkb_bytes = geometry.wkb()?;
        let geometry = wkb::wkb_to_geom(&mut wkb_bytes.as_slice())
            .map_err(|err| anyhow!("Could not parse geometry of feature {}, {:?}", index, err))?;

        let attributes: FeatureMap = gdal_feature
            .fields()
            .map(|(name, value)| (name, value.map(field_value_to_string).unwrap_or_default()))
            .collect();
        features.push(Feature::with_attributes(geometry, attributes));
    }
    log::debug!("Read {} features from {:?}", features.len(), filepath);

    Ok(GeofileContents {
        features,
        spatial_ref,
        field_names,
    })
}
