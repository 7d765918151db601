use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine as _;
use serde::Deserialize;

use kata_runner::{Files, RunFiles};

/// A file's content in a request: plain text, or `{"base64": "..."}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Base64 { base64: String },
}

pub type FileMap = BTreeMap<String, Content>;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunRequest {
    #[serde(default)]
    pub new_files: FileMap,
    #[serde(default)]
    pub deleted_files: FileMap,
    #[serde(default)]
    pub unchanged_files: FileMap,
    #[serde(default)]
    pub changed_files: FileMap,
}

pub fn decode(map: FileMap) -> Result<Files> {
    let mut out = Files::new();
    for (name, content) in map {
        let bytes = match content {
            Content::Text(s) => s.into_bytes(),
            Content::Base64 { base64 } => base64::engine::general_purpose::STANDARD
                .decode(base64.as_bytes())
                .with_context(|| format!("decode base64 content of {name:?}"))?,
        };
        out.insert(name, bytes);
    }
    Ok(out)
}

pub fn read_files(path: &Path) -> Result<Files> {
    let bytes = std::fs::read(path).with_context(|| format!("read files: {}", path.display()))?;
    let map: FileMap = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse files JSON: {}", path.display()))?;
    decode(map)
}

pub fn read_run_request(path: &Path) -> Result<RunFiles> {
    let bytes = std::fs::read(path).with_context(|| format!("read request: {}", path.display()))?;
    let req: RunRequest = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse request JSON: {}", path.display()))?;
    Ok(RunFiles {
        new_files: decode(req.new_files)?,
        deleted_files: decode(req.deleted_files)?,
        unchanged_files: decode(req.unchanged_files)?,
        changed_files: decode(req.changed_files)?,
    })
}
