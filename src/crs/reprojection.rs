use anyhow::anyhow;
use geo::Centroid;
use proj::Transform;

use crate::choropleth::dataset::Dataset;

use super::crs_utils::{epsg_code_to_authority_string, WEB_MERCATOR_EPSG, WGS84_EPSG};

/// A region's shape in display coordinates together with the point its label is anchored at.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayRegion {
    pub geometry: geo::MultiPolygon,
    /// Area-weighted centroid, `None` for an empty geometry.
    pub anchor: Option<geo::Point>,
}

pub fn display_crs() -> String {
    epsg_code_to_authority_string(WEB_MERCATOR_EPSG)
}

/// Project a multipolygon between two PROJ-compatible CRS definitions, e.g. "EPSG:4326" or WKT.
pub fn project_multi_polygon(
    geometry: &geo::MultiPolygon,
    from_crs: &str,
    to_crs: &str,
) -> anyhow::Result<geo::MultiPolygon> {
    let projection = proj::Proj::new_known_crs(from_crs, to_crs, None)?;
    geometry
        .transformed(&projection)
        .map_err(|err| anyhow!("Could not project geometry, {}", err))
}

/// Express every region of the dataset in Web Mercator and compute its label anchor.
///
/// A dataset without a spatial reference is assumed to be WGS84. Geometries are reprojected
/// directly from the source CRS to the display CRS.
pub fn normalize_for_display(dataset: &Dataset) -> anyhow::Result<Vec<DisplayRegion>> {
    let source_crs = match dataset.crs() {
        Some(crs) => crs.to_string(),
        None => {
            let assumed = epsg_code_to_authority_string(WGS84_EPSG);
            log::warn!("No CRS found. Assuming {}.", assumed);
            assumed
        }
    };
    let target_crs = display_crs();

    let projection = if source_crs == target_crs {
        None
    } else {
        log::info!("Projecting {} regions to {}", dataset.len(), target_crs);
        Some(proj::Proj::new_known_crs(&source_crs, &target_crs, None)?)
    };

    dataset
        .regions()
        .iter()
        .enumerate()
        .map(|(index, region)| {
            let geometry = match &projection {
                Some(projection) => region
                    .geometry
                    .transformed(projection)
                    .map_err(|err| anyhow!("Could not project region {}, {}", index, err))?,
                None => region.geometry.clone(),
            };
            let anchor = geometry.centroid();
            Ok(DisplayRegion { geometry, anchor })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use geo::CoordsIter;

    use crate::{choropleth::dataset::Dataset, geofile::feature::FeatureMap};

    use super::{normalize_for_display, project_multi_polygon};

    fn wgs84_region() -> geo::MultiPolygon {
        geo::MultiPolygon::new(vec![geo::Polygon::new(
            vec![
                (76.0, 8.0),
                (78.0, 8.0),
                (78.0, 12.0),
                (76.0, 12.0),
                (76.0, 8.0),
            ]
            .into(),
            vec![],
        )])
    }

    fn dataset_with_crs(crs: Option<&str>) -> Dataset {
        Dataset::new(
            vec![(
                FeatureMap::new(),
                geo::Geometry::MultiPolygon(wgs84_region()),
            )],
            crs.map(|crs| crs.to_string()),
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn test_project_to_web_mercator() {
        let geometry = geo::MultiPolygon::new(vec![geo::Polygon::new(
            vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 0.0)].into(),
            vec![],
        )]);
        let projected = project_multi_polygon(&geometry, "EPSG:4326", "EPSG:3857").unwrap();
        let coords: Vec<geo::Coord> = projected.coords_iter().collect();

        // Millimeter tolerance.
        let epsilon = 1e-3;
        assert_abs_diff_eq!(coords[0], geo::coord! { x: 0.0, y: 0.0 }, epsilon = epsilon);
        assert_abs_diff_eq!(
            coords[1],
            geo::coord! { x: 1113194.908, y: 0.0 },
            epsilon = epsilon
        );
        assert_abs_diff_eq!(
            coords[2],
            geo::coord! { x: 1113194.908, y: 1118889.975 },
            epsilon = epsilon
        );
    }

    #[test]
    fn test_reprojection_round_trip() {
        let original = wgs84_region();
        let projected = project_multi_polygon(&original, "EPSG:4326", "EPSG:3857").unwrap();
        let restored = project_multi_polygon(&projected, "EPSG:3857", "EPSG:4326").unwrap();
        for (before, after) in original.coords_iter().zip(restored.coords_iter()) {
            assert_abs_diff_eq!(before, after, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_missing_crs_is_treated_as_wgs84() {
        let assumed = normalize_for_display(&dataset_with_crs(None)).unwrap();
        let explicit = normalize_for_display(&dataset_with_crs(Some("EPSG:4326"))).unwrap();
        assert_eq!(explicit, assumed);
    }

    #[test]
    fn test_anchor_is_projected_centroid() {
        let regions = normalize_for_display(&dataset_with_crs(Some("EPSG:4326"))).unwrap();
        let anchor = regions[0].anchor.unwrap();
        // The centroid lies inside the projected bounds, not at the projected geographic center.
        assert_abs_diff_eq!(anchor.x(), 8571600.791, epsilon = 1e-2);
        assert!(anchor.y() > 893463.0 && anchor.y() < 1345708.0);
    }

    #[test]
    fn test_display_crs_input_is_kept_unchanged() {
        let dataset = dataset_with_crs(Some("EPSG:3857"));
        let regions = normalize_for_display(&dataset).unwrap();
        assert_eq!(dataset.regions()[0].geometry, regions[0].geometry);
    }
}
