//! Collections offered by the catalogue, for listing and sanity checks.
//! The server stays the authority: names missing here are still sent as given.
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct CollectionInfo {
    /// Name used in search URLs.
    pub name: String,
    /// Value of the `collection` property on returned features.
    pub mission: String,
    pub description: String,
}

#[derive(Deserialize)]
struct Table {
    collections: Vec<CollectionInfo>,
}

pub fn collections_toml() -> toml::Table {
    toml::toml! {
        [[collections]]
        name = "Sentinel1"
        mission = "SENTINEL-1"
        description = "C-band synthetic aperture radar imaging (GRD, SLC, RAW, OCN)"

        [[collections]]
        name = "Sentinel1RTC"
        mission = "SENTINEL-1-RTC"
        description = "Sentinel-1 radiometrically terrain corrected backscatter"

        [[collections]]
        name = "Sentinel2"
        mission = "SENTINEL-2"
        description = "Multispectral imager, Level-1C top of atmosphere and Level-2A surface reflectance"

        [[collections]]
        name = "Sentinel3"
        mission = "SENTINEL-3"
        description = "Ocean and land colour, sea and land surface temperature, altimetry"

        [[collections]]
        name = "Sentinel5P"
        mission = "SENTINEL-5P"
        description = "TROPOMI atmospheric composition"

        [[collections]]
        name = "Sentinel6"
        mission = "SENTINEL-6"
        description = "Poseidon-4 radar altimetry"

        [[collections]]
        name = "GLOBAL-MOSAICS"
        mission = "GLOBAL-MOSAICS"
        description = "Sentinel-1 and Sentinel-2 quarterly mosaics"

        [[collections]]
        name = "SMOS"
        mission = "SMOS"
        description = "Soil moisture and ocean salinity"

        [[collections]]
        name = "ENVISAT"
        mission = "ENVISAT"
        description = "ENVISAT MERIS archive"

        [[collections]]
        name = "LANDSAT-5"
        mission = "LANDSAT-5"
        description = "Landsat 5 TM archive over Europe"

        [[collections]]
        name = "LANDSAT-7"
        mission = "LANDSAT-7"
        description = "Landsat 7 ETM+ archive over Europe"

        [[collections]]
        name = "LANDSAT-8"
        mission = "LANDSAT-8"
        description = "Landsat 8 OLI/TIRS Level-1 and Level-2"

        [[collections]]
        name = "COP-DEM"
        mission = "COP-DEM"
        description = "Copernicus digital elevation model"

        [[collections]]
        name = "TERRAAQUA"
        mission = "TERRAAQUA"
        description = "MODIS Terra and Aqua products"

        [[collections]]
        name = "S2GLC"
        mission = "S2GLC"
        description = "Sentinel-2 global land cover 2017"

        [[collections]]
        name = "CCM"
        mission = "CCM"
        description = "Copernicus contributing missions, very high resolution optical and radar"
    }
}

pub fn known_collections() -> Result<Vec<CollectionInfo>> {
    let table: Table = toml::from_str(&collections_toml().to_string())?;
    Ok(table.collections)
}

pub fn find_collection(name: &str) -> Result<Option<CollectionInfo>> {
    Ok(known_collections()?.into_iter().find(|c| c.name == name))
}
