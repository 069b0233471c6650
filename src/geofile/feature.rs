use std::collections::HashMap;

/// Attribute values of a feature, keyed by field name.
// TODO support different value types besides String. See gdal::vector::OGRFieldType for types
// supported by GDAL.
pub type FeatureMap = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub geometry: geo::Geometry,
    pub attributes: FeatureMap,
}

impl From<geo::Geometry> for Feature {
    fn from(value: geo::Geometry) -> Self {
        Self {
            geometry: value,
            attributes: FeatureMap::new(),
        }
    }
}

impl Feature {
    pub fn with_attributes(geometry: geo::Geometry, attributes: FeatureMap) -> Self {
        Self {
            geometry,
            attributes,
        }
    }
}
