use std::{
    fs,
    io::Cursor,
    path::{Path, PathBuf},
};

use anyhow::Context;

use crate::{choropleth::dataset::Dataset, error::MapError};

use super::gdal_geofile::read_features_from_geofile;

const SHAPEFILE_EXTENSION: &str = "shp";

fn is_shapefile(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| extension.eq_ignore_ascii_case(SHAPEFILE_EXTENSION))
        .unwrap_or(false)
}

/// All `.shp` files below `dir`, sorted by path.
fn find_shapefiles(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current).with_context(|| format!("Listing {:?}", current))? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if is_shapefile(&path) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Unpack a zipped shapefile bundle into `extract_dir` and read it into a dataset.
///
/// `extract_dir` is emptied first. When the archive holds several shapefiles, the first one in
/// path order is read.
pub fn read_dataset_from_zip_bytes(
    archive_name: &str,
    bytes: &[u8],
    extract_dir: &Path,
) -> anyhow::Result<Dataset> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| MapError::InvalidArchive(format!("{}: {}", archive_name, err)))?;

    if extract_dir.exists() {
        fs::remove_dir_all(extract_dir)
            .with_context(|| format!("Clearing previous upload in {:?}", extract_dir))?;
    }
    fs::create_dir_all(extract_dir)?;
    log::debug!(
        "Extracting {} entries of {} to {:?}",
        archive.len(),
        archive_name,
        extract_dir
    );
    archive
        .extract(extract_dir)
        .map_err(|err| MapError::InvalidArchive(format!("{}: {}", archive_name, err)))?;

    let shapefile_path = find_shapefiles(extract_dir)?
        .into_iter()
        .next()
        .ok_or_else(|| MapError::NoShapefileInArchive {
            archive: archive_name.to_string(),
        })?;
    log::info!("Reading shapefile {:?}", shapefile_path.file_name().unwrap_or_default());

    let contents = read_features_from_geofile(&shapefile_path)?;
    let dataset = Dataset::from_geofile(contents)?;
    log::info!(
        "Read {} features with columns {:?}",
        dataset.len(),
        dataset.columns()
    );
    Ok(dataset)
}
