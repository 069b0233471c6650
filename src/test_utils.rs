//! Fixtures shared by tests: small shapefiles written through GDAL and zipped in memory.

use std::{
    fs,
    io::{Cursor, Write},
    path::Path,
};

use crate::{
    crs::crs_utils::epsg_4326,
    geofile::{
        feature::{Feature, FeatureMap},
        gdal_geofile::{write_features_to_geofile, GdalDriverType},
    },
};

pub fn square(lon: f64, lat: f64) -> geo::Geometry {
    geo::Geometry::Polygon(geo::Polygon::new(
        vec![
            (lon, lat),
            (lon + 1.0, lat),
            (lon + 1.0, lat + 1.0),
            (lon, lat + 1.0),
            (lon, lat),
        ]
        .into(),
        vec![],
    ))
}

/// Three unit squares in WGS84 named North, South and East.
pub fn region_features() -> Vec<Feature> {
    [("North", "N", 77.0, 11.0), ("South", "S", 77.0, 10.0), ("East", "E", 78.0, 10.0)]
        .into_iter()
        .map(|(name, code, lon, lat)| {
            Feature::with_attributes(
                square(lon, lat),
                FeatureMap::from([
                    ("NAME".to_string(), name.to_string()),
                    ("CODE".to_string(), code.to_string()),
                ]),
            )
        })
        .collect()
}

/// Zip the given entries into an in-memory archive.
pub fn zip_entries(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        writer
            .start_file(*name, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Write `region_features` as a shapefile at `<fixture_dir>/<shapefile_stem>.shp` and return a zip
/// of every file in `fixture_dir`, keeping paths relative to it.
pub fn regions_shapefile_zip(fixture_dir: &Path, shapefile_stem: &str) -> Vec<u8> {
    let shapefile_path = fixture_dir.join(format!("{}.shp", shapefile_stem));
    fs::create_dir_all(shapefile_path.parent().unwrap()).unwrap();
    write_features_to_geofile(
        &region_features(),
        &shapefile_path,
        Some(&epsg_4326().unwrap()),
        GdalDriverType::Shapefile.name(),
    )
    .unwrap();

    let component_dir = shapefile_path.parent().unwrap();
    let mut entries: Vec<(String, Vec<u8>)> = fs::read_dir(component_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.is_file())
        .map(|path| {
            let name = path
                .strip_prefix(fixture_dir)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            (name, fs::read(&path).unwrap())
        })
        .collect();
    entries.sort();
    let borrowed: Vec<(&str, &[u8])> = entries
        .iter()
        .map(|(name, contents)| (name.as_str(), contents.as_slice()))
        .collect();
    zip_entries(&borrowed)
}
