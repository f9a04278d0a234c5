use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single entry of the ports catalog, keyed by its UN/LOCODE in the source document.
/// Fields missing from the document are left empty rather than rejected.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone, Default)]
#[serde(default)]
pub struct Port {
    pub name: String,
    pub city: String,
    pub country: String,
    pub alias: Vec<Value>,
    pub regions: Vec<Value>,
    pub coordinates: Vec<f64>,
    pub province: String,
    pub timezone: String,
    pub unlocs: Vec<String>,
    pub code: String,
}
