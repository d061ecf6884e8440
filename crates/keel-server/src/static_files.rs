//! Static assets served by the HTTP transport.
//!
//! Files are read once at startup; a changed asset needs a worker restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use keel_common::Result;

const DEFAULT_MIME: &str = "application/octet-stream";

const MIME_TYPES: [(&str, &str); 18] = [
    ("html", "text/html; charset=utf-8"),
    ("htm", "text/html; charset=utf-8"),
    ("js", "application/javascript; charset=utf-8"),
    ("mjs", "application/javascript; charset=utf-8"),
    ("css", "text/css; charset=utf-8"),
    ("json", "application/json; charset=utf-8"),
    ("txt", "text/plain; charset=utf-8"),
    ("svg", "image/svg+xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("ico", "image/x-icon"),
    ("webp", "image/webp"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("wasm", "application/wasm"),
    ("map", "application/json; charset=utf-8"),
];

pub fn mime_type(path: &Path) -> &'static str {
    let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
        return DEFAULT_MIME;
    };
    let extension = extension.to_ascii_lowercase();
    MIME_TYPES
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, mime)| *mime)
        .unwrap_or(DEFAULT_MIME)
}

#[derive(Debug, Clone)]
pub struct Asset {
    pub body: Bytes,
    pub mime: &'static str,
}

/// URL path → preloaded file.
#[derive(Debug, Default)]
pub struct StaticFiles {
    files: HashMap<String, Asset>,
}

impl StaticFiles {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reads every file under `root`. A missing directory serves nothing.
    pub async fn load(root: &Path) -> Result<Self> {
        let mut files = HashMap::new();
        if !tokio::fs::try_exists(root).await.unwrap_or(false) {
            tracing::warn!("Static directory {} does not exist", root.display());
            return Ok(Self { files });
        }

        let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(url) = url_path(root, &path) else {
                    continue;
                };
                let body = tokio::fs::read(&path).await?;
                files.insert(
                    url,
                    Asset {
                        body: Bytes::from(body),
                        mime: mime_type(&path),
                    },
                );
            }
        }
        tracing::info!("Loaded {} static files from {}", files.len(), root.display());
        Ok(Self { files })
    }

    /// Looks up a request path. Directory paths resolve to their `index.html`.
    pub fn get(&self, path: &str) -> Option<&Asset> {
        let path = path.split(['?', '#']).next().unwrap_or("/");
        if path.ends_with('/') {
            return self.files.get(&format!("{}index.html", path));
        }
        self.files.get(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn url_path(root: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(root).ok()?;
    let mut url = String::new();
    for part in relative.components() {
        url.push('/');
        url.push_str(part.as_os_str().to_str()?);
    }
    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_types() {
        assert_eq!(mime_type(Path::new("a/index.html")), "text/html; charset=utf-8");
        assert_eq!(mime_type(Path::new("LOGO.PNG")), "image/png");
        assert_eq!(mime_type(Path::new("Makefile")), DEFAULT_MIME);
        assert_eq!(mime_type(Path::new("x.unknown")), DEFAULT_MIME);
    }

    #[tokio::test]
    async fn test_load_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();
        std::fs::write(dir.path().join("css/site.css"), "body{}").unwrap();

        let files = StaticFiles::load(dir.path()).await.unwrap();
        assert_eq!(files.len(), 2);

        let index = files.get("/").unwrap();
        assert_eq!(index.body, Bytes::from_static(b"<h1>hi</h1>"));
        assert_eq!(index.mime, "text/html; charset=utf-8");
        assert_eq!(files.get("/css/site.css?v=2").unwrap().mime, "text/css; charset=utf-8");
        assert!(files.get("/missing.js").is_none());
        assert!(files.get("/../etc/passwd").is_none());
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let files = StaticFiles::load(Path::new("/nonexistent/keel/static")).await.unwrap();
        assert!(files.is_empty());
    }
}
