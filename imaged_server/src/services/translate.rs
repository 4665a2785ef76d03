//! Template translation: YAML template descriptions to Packer JSON.

use std::path::{Path, PathBuf};

use crate::models::build::is_valid_template_name;

/// Directory inside the template checkout holding `<name>.yml` files.
pub const TEMPLATES_DIR: &str = "templates";

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("invalid template name '{0}'")]
    InvalidName(String),

    #[error("could not read template YAML {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not convert template YAML to JSON: {0}")]
    Convert(#[from] serde_yaml::Error),

    #[error("could not encode template JSON: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("could not create file for template JSON {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Convert YAML text into the JSON Packer consumes.
///
/// Output is a pure function of the input: object keys are emitted in sorted
/// order, so translating the same description twice yields identical bytes.
/// Merge keys (`<<: *anchor`) are expanded before conversion.
pub fn yaml_to_json(yaml: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let mut value: serde_yaml::Value = serde_yaml::from_slice(yaml)?;
    value.apply_merge()?;
    let value: serde_json::Value = serde_yaml::from_value(value)?;
    let mut json = serde_json::to_vec_pretty(&value)?;
    json.push(b'\n');
    Ok(json)
}

/// Translate `templates/<name>.yml` from the checkout into `<out_dir>/<name>.json`.
pub async fn write_template(
    templates_root: &Path,
    name: &str,
    out_dir: &Path,
) -> Result<PathBuf, TranslateError> {
    if !is_valid_template_name(name) {
        return Err(TranslateError::InvalidName(name.to_string()));
    }

    let yml_path = templates_root
        .join(TEMPLATES_DIR)
        .join(format!("{name}.yml"));
    let yml = tokio::fs::read(&yml_path)
        .await
        .map_err(|source| TranslateError::Read {
            path: yml_path.clone(),
            source,
        })?;

    let json = yaml_to_json(&yml)?;

    let json_path = out_dir.join(format!("{name}.json"));
    tokio::fs::write(&json_path, json)
        .await
        .map_err(|source| TranslateError::Write {
            path: json_path.clone(),
            source,
        })?;

    Ok(json_path)
}
