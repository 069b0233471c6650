pub mod archive;
pub mod feature;
pub mod gdal_geofile;
