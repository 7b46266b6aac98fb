use std::{fs, path::PathBuf};

use topup_api::openapi::ApiDocV1;
use utoipa::OpenApi;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let output_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("openapi").join("topup-api.v1.json"));

    let json = serde_json::to_string_pretty(&ApiDocV1::openapi())?;
    if let Some(dir) = output_path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(&output_path, json)?;

    println!("OpenAPI document written to {}", output_path.display());
    Ok(())
}
