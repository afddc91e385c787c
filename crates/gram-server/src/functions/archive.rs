// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Functions bundle archive inspection.

use std::io::{Read, Seek};

use thiserror::Error;
use zip::ZipArchive;

use super::{ALL_ENTRYPOINTS, MANIFEST_FILE};

/// Largest manifest we are willing to read into memory.
const MAX_MANIFEST_BYTES: u64 = 4 * 1024 * 1024;

/// Errors from inspecting a functions bundle.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The bundle is not a readable ZIP archive.
    #[error("not a valid zip file: {0}")]
    NotZip(String),

    /// No entry point file exists at the archive root.
    #[error("no entry point found in functions archive (expected one of: {0})")]
    NoEntrypoint(String),

    /// The archive has no `manifest.json` at its root.
    #[error("manifest.json not found in functions archive")]
    MissingManifest,

    /// Reading an archive member failed.
    #[error("failed to read {0} from functions archive: {1}")]
    Read(String, String),
}

/// Open `reader` as a ZIP archive.
pub fn open<R: Read + Seek>(reader: R) -> Result<ZipArchive<R>, ArchiveError> {
    ZipArchive::new(reader).map_err(|e| ArchiveError::NotZip(e.to_string()))
}

/// Return the first of `candidates` present at the archive root.
pub fn find_entrypoint<R: Read + Seek>(
    archive: &ZipArchive<R>,
    candidates: &[&'static str],
) -> Result<&'static str, ArchiveError> {
    candidates
        .iter()
        .copied()
        .find(|name| archive.index_for_name(name).is_some())
        .ok_or_else(|| ArchiveError::NoEntrypoint(candidates.join(", ")))
}

/// Validate an uploaded bundle: it must be a ZIP with an entry point for any
/// supported runtime.
pub fn validate_upload<R: Read + Seek>(reader: R) -> Result<&'static str, ArchiveError> {
    let archive = open(reader)?;
    find_entrypoint(&archive, ALL_ENTRYPOINTS)
}

/// Read `manifest.json` from the archive root.
pub fn read_manifest<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<Vec<u8>, ArchiveError> {
    let file = archive.by_name(MANIFEST_FILE).map_err(|e| match e {
        zip::result::ZipError::FileNotFound => ArchiveError::MissingManifest,
        other => ArchiveError::Read(MANIFEST_FILE.to_string(), other.to_string()),
    })?;

    let mut buf = Vec::new();
    file.take(MAX_MANIFEST_BYTES)
        .read_to_end(&mut buf)
        .map_err(|e| ArchiveError::Read(MANIFEST_FILE.to_string(), e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    /// Build an in-memory ZIP from `(name, contents)` pairs.
    pub(crate) fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buffer);
            for (name, contents) in files {
                zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                zip.write_all(contents.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buffer.into_inner()
    }

    #[test]
    fn test_validate_upload_accepts_any_runtime_entrypoint() {
        let js = zip_bytes(&[("functions.js", "export {}")]);
        assert_eq!(validate_upload(Cursor::new(js)).unwrap(), "functions.js");

        let py = zip_bytes(&[("functions.py", "")]);
        assert_eq!(validate_upload(Cursor::new(py)).unwrap(), "functions.py");
    }

    #[test]
    fn test_validate_upload_rejects_missing_entrypoint() {
        let bytes = zip_bytes(&[("index.js", ""), ("lib/functions.js", "")]);
        let err = validate_upload(Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, ArchiveError::NoEntrypoint(_)));
        assert!(err.to_string().starts_with("no entry point found"));
    }

    #[test]
    fn test_validate_upload_rejects_non_zip() {
        let err = validate_upload(Cursor::new(b"plain text".to_vec())).unwrap_err();
        assert!(matches!(err, ArchiveError::NotZip(_)));
        assert!(err.to_string().starts_with("not a valid zip file"));
    }

    #[test]
    fn test_read_manifest() {
        let bytes = zip_bytes(&[("functions.ts", ""), ("manifest.json", r#"{"version":"0.0.0"}"#)]);
        let mut archive = open(Cursor::new(bytes)).unwrap();
        assert_eq!(read_manifest(&mut archive).unwrap(), br#"{"version":"0.0.0"}"#);

        let bytes = zip_bytes(&[("functions.ts", "")]);
        let mut archive = open(Cursor::new(bytes)).unwrap();
        assert!(matches!(read_manifest(&mut archive), Err(ArchiveError::MissingManifest)));
    }
}
