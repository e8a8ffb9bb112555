use serde::{Deserialize, Serialize};

/// Raw YAML representation of an image config file (`<images_dir>/<id>/config.yml`).
#[derive(Debug, Deserialize, Serialize)]
pub struct RawImage {
    pub identifier: String,
    pub machine: RawMachine,
    pub cloud_connector_id: String,
    #[serde(default)]
    pub pool_size: u32,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_status() -> String {
    "active".to_string()
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawMachine {
    pub id: String,
    pub identifier: String,
    pub vcpu: u32,
    pub memory_mb: u32,
}
