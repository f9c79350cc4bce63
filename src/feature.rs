use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role of the link that points at the full product archive.
pub const PRODUCT_ROLE: &str = "download";

/// One catalogue entry as returned by the search endpoint. Fields the client does not
/// interpret are kept verbatim so the record round-trips to JSON unchanged.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Feature {
    pub id: String,
    #[serde(default)]
    pub properties: Properties,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Properties {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, rename = "startDate", skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, rename = "processingBaseline", skip_serializing_if = "Option::is_none")]
    pub processing_baseline: Option<Value>,
    /// Asset links keyed by role. Kept raw; see [`Feature::asset`].
    #[serde(default)]
    pub services: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct AssetLink {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl Feature {
    pub fn title(&self) -> &str {
        &self.properties.title
    }

    pub fn asset(&self, role: &str) -> Option<AssetLink> {
        let link = self.properties.services.get(role)?;
        serde_json::from_value(link.clone()).ok()
    }

    pub fn product_url(&self) -> Option<String> {
        self.asset(PRODUCT_ROLE)
            .map(|link| link.url)
            .filter(|url| !url.is_empty())
    }

    /// The server sends the baseline as a number or a numeric string depending on the collection.
    pub fn processing_baseline(&self) -> Option<f64> {
        match self.properties.processing_baseline.as_ref()? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
