//! Canonical export sinks: the JSON document, the CSV sheet and a sha256
//! manifest of whatever was written.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use irec_core::{CanonicalRecord, EXPORT_HEADERS};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

pub const EXPORT_DESCRIPTION: &str = "Combined ML pipeline results for issue analysis";
pub const MANIFEST_FILE_NAME: &str = "export_manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub generated_at: DateTime<Utc>,
    pub total_records: usize,
    pub pipeline_version: String,
    pub description: String,
}

impl ExportMetadata {
    pub fn new(total_records: usize, pipeline_version: impl Into<String>) -> Self {
        Self {
            generated_at: Utc::now(),
            total_records,
            pipeline_version: pipeline_version.into(),
            description: EXPORT_DESCRIPTION.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExportDocument<'a> {
    pub metadata: ExportMetadata,
    pub data: &'a [CanonicalRecord],
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(())
}

pub async fn write_json_document(path: &Path, records: &[CanonicalRecord], pipeline_version: &str) -> Result<()> {
    let document = ExportDocument {
        metadata: ExportMetadata::new(records.len(), pipeline_version),
        data: records,
    };
    let bytes = serde_json::to_vec_pretty(&document).context("serializing export document")?;
    ensure_parent(path).await?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), records = records.len(), "wrote JSON export");
    Ok(())
}

/// Header row plus one row per record, columns in [`EXPORT_HEADERS`] order.
pub fn render_sheet(records: &[CanonicalRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(EXPORT_HEADERS).context("writing sheet header")?;
    for record in records {
        writer
            .write_record(record.cells())
            .with_context(|| format!("writing sheet row {}/{}", record.project_id, record.issue_id))?;
    }
    writer.into_inner().context("flushing sheet")
}

pub async fn write_sheet(path: &Path, records: &[CanonicalRecord]) -> Result<()> {
    let bytes = render_sheet(records)?;
    ensure_parent(path).await?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), records = records.len(), "wrote sheet export");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ManifestFile>,
}

pub async fn manifest_entry(name: &str, base_dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(base_dir).unwrap_or(path).display().to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Hashes `files` and writes the manifest next to the first of them.
pub async fn write_manifest(files: &[(&str, &Path)]) -> Result<(PathBuf, ExportManifest)> {
    let base_dir = files
        .first()
        .and_then(|(_, path)| path.parent())
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let mut entries = Vec::with_capacity(files.len());
    for (name, path) in files {
        entries.push(manifest_entry(name, &base_dir, path).await?);
    }
    let manifest = ExportManifest {
        generated_at: Utc::now(),
        files: entries,
    };
    let manifest_path = base_dir.join(MANIFEST_FILE_NAME);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok((manifest_path, manifest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use irec_core::{IssueKey, EXPORT_COLUMN_COUNT};
    use serde_json::Value;

    fn record(project: &str, issue: &str, short: &str) -> CanonicalRecord {
        let mut record = CanonicalRecord::empty_for(&IssueKey::new(project, issue).unwrap());
        record.short_description = short.to_string();
        record
    }

    #[tokio::test]
    async fn json_document_carries_metadata_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/final.json");
        let records = vec![record("P1", "1", "a"), record("P1", "2", "b")];

        write_json_document(&path, &records, "2.1.0").await.unwrap();

        let doc: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc["metadata"]["totalRecords"], 2);
        assert_eq!(doc["metadata"]["pipelineVersion"], "2.1.0");
        assert_eq!(doc["metadata"]["description"], EXPORT_DESCRIPTION);
        assert!(doc["metadata"]["generatedAt"].is_string());
        let data = doc["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[1]["Short Description"], "b");
        assert_eq!(data[0].as_object().unwrap().len(), EXPORT_COLUMN_COUNT);
    }

    #[test]
    fn sheet_has_fixed_header_and_quoted_cells() {
        let bytes = render_sheet(&[record("P1", "1", "multi\nline, with comma")]).unwrap();
        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.len(), EXPORT_COLUMN_COUNT);
        assert_eq!(&headers[0], "Project ID");
        assert_eq!(&headers[EXPORT_COLUMN_COUNT - 1], "Strategic Best practice");
        let rows = reader.records().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][2], "multi\nline, with comma");
    }

    #[tokio::test]
    async fn manifest_hashes_written_files() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("final.json");
        let sheet = dir.path().join("final.csv");
        std::fs::write(&json, b"abc").unwrap();
        std::fs::write(&sheet, b"").unwrap();

        let (path, manifest) = write_manifest(&[("json", json.as_path()), ("sheet", sheet.as_path())])
            .await
            .unwrap();

        assert_eq!(path, dir.path().join(MANIFEST_FILE_NAME));
        assert_eq!(manifest.files[0].path, "final.json");
        assert_eq!(manifest.files[0].bytes, 3);
        assert_eq!(
            manifest.files[0].sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            manifest.files[1].sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(path.exists());
    }
}
