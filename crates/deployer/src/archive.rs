use crate::error::TransportError;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// A file of the built site, keyed by its `/`-separated path relative to the
/// artifact directory
#[derive(Debug, Clone, PartialEq)]
pub struct SiteFile {
    pub path: String,
    pub bytes: Vec<u8>,
}

impl SiteFile {
    /// Guess the MIME type from the file extension
    pub fn content_type(&self) -> String {
        mime_guess::from_path(&self.path)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Some(parts.join("/"))
}

/// Read every regular file below `dir`, sorted by path
pub fn collect_files(dir: &Path) -> Result<Vec<SiteFile>, TransportError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| TransportError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(path) = relative_path(dir, entry.path()) else {
            continue;
        };
        files.push(SiteFile {
            path,
            bytes: fs::read(entry.path())?,
        });
    }
    Ok(files)
}

/// Zip the build directory into memory for a single-payload upload
pub fn zip_dir(build_dir: &Path) -> Result<Vec<u8>, TransportError> {
    let file = tempfile::tempfile()?;
    let mut zip = ZipWriter::new(file);

    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in WalkDir::new(build_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let Some(relative) = relative_path(build_dir, entry.path()) else {
            continue;
        };
        zip.start_file(relative, options)?;
        let mut f = File::open(entry.path())?;
        std::io::copy(&mut f, &mut zip)?;
    }

    let mut file = zip.finish()?;
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("css")).unwrap();
        fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();
        fs::write(dir.path().join("css/site.css"), "body{}").unwrap();
        dir
    }

    #[test]
    fn test_collect_files_uses_forward_slashes() {
        let site = sample_site();
        let files = collect_files(site.path()).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["css/site.css", "index.html"]);
        assert_eq!(files[1].bytes, b"<h1>hi</h1>");
    }

    #[test]
    fn test_content_type_guess() {
        let file = SiteFile {
            path: "css/site.css".into(),
            bytes: vec![],
        };
        assert_eq!(file.content_type(), "text/css");
        let unknown = SiteFile {
            path: "blob.unknownext".into(),
            bytes: vec![],
        };
        assert_eq!(unknown.content_type(), "application/octet-stream");
    }

    #[test]
    fn test_zip_dir_contains_all_files() {
        let site = sample_site();
        let bytes = zip_dir(site.path()).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut index = String::new();
        archive
            .by_name("index.html")
            .unwrap()
            .read_to_string(&mut index)
            .unwrap();
        assert_eq!(index, "<h1>hi</h1>");
    }
}
