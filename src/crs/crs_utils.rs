use anyhow::anyhow;

pub type EpsgCode = u32;

/// Geographic WGS84, assumed for datasets that carry no spatial reference.
pub const WGS84_EPSG: EpsgCode = 4326;
/// Web Mercator, the planar projection maps are drawn in.
pub const WEB_MERCATOR_EPSG: EpsgCode = 3857;

pub fn epsg_4326() -> anyhow::Result<gdal::spatial_ref::SpatialRef> {
    spatial_ref_from_epsg(WGS84_EPSG)
}

pub fn spatial_ref_from_epsg(code: EpsgCode) -> anyhow::Result<gdal::spatial_ref::SpatialRef> {
    gdal::spatial_ref::SpatialRef::from_epsg(code)
        .map_err(|err| anyhow!("Could not create SpatialRef from EPSG code {}. {}", code, err))
}

pub fn epsg_code_to_authority_string(code: EpsgCode) -> String {
    format!("EPSG:{}", code)
}

/// Describe a spatial reference in a form PROJ accepts.
///
/// Prefers the `EPSG:<code>` authority string. Shapefile `.prj` files are often ESRI WKT without an
/// authority node, so an EPSG code is looked up first; if none matches, the WKT itself is returned.
pub fn spatial_ref_to_definition(
    spatial_ref: &gdal::spatial_ref::SpatialRef,
) -> anyhow::Result<String> {
    let mut spatial_ref = spatial_ref.clone();
    if spatial_ref.auth_code().is_err() {
        if let Err(err) = spatial_ref.auto_identify_epsg() {
            log::debug!("Could not identify an EPSG code for spatial ref, {}", err);
        }
    }
    let is_epsg = spatial_ref
        .auth_name()
        .map(|name| name.eq_ignore_ascii_case("EPSG"))
        .unwrap_or(false);
    match spatial_ref.auth_code() {
        Ok(code) if is_epsg => Ok(epsg_code_to_authority_string(code as EpsgCode)),
        _ => spatial_ref
            .to_wkt()
            .map_err(|err| anyhow!("Could not export spatial ref as WKT, {}", err)),
    }
}
