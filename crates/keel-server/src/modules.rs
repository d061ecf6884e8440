//! Shared modules
//!
//! Every `*.js` file under the modules directory is evaluated into the `lib`
//! global of each script context. `resmon/getStatistics.js` becomes
//! `lib.resmon.getStatistics`, `utils.js` becomes `lib.utils`. A file
//! evaluates to any value, usually a function or an object of functions:
//!
//! ```js
//! ({
//!   bytesToSize(bytes) {
//!     return Math.round(bytes / 1024) + ' KB';
//!   },
//! });
//! ```
//!
//! A file named `start.js` is not exported. It is a start hook: a function
//! that background workers call once after startup.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use keel_common::{KeelError, Result};
use parking_lot::RwLock;

use crate::script;

const START_HOOK: &str = "start";

/// One module file.
#[derive(Debug)]
pub struct SharedModule {
    path: Vec<String>,
    file: PathBuf,
    source: Arc<str>,
}

impl SharedModule {
    /// Path segments under `lib`, e.g. `["resmon", "getStatistics"]`.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path.join("/")
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn source(&self) -> &Arc<str> {
        &self.source
    }

    pub fn is_start_hook(&self) -> bool {
        self.path.last().map(String::as_str) == Some(START_HOOK)
    }
}

/// Modules of one worker, keyed by name. Cloning shares the table.
#[derive(Clone, Default)]
pub struct ModuleTable {
    root: PathBuf,
    entries: Arc<RwLock<BTreeMap<String, Arc<SharedModule>>>>,
}

impl ModuleTable {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: Arc::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path segments for a file under the root, if it is a module file.
    pub fn module_path(&self, file: &Path) -> Option<Vec<String>> {
        if self.root.as_os_str().is_empty() || file.extension()? != "js" {
            return None;
        }
        let relative = file.strip_prefix(&self.root).ok()?.with_extension("");
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                _ => return None,
            }
        }
        (!parts.is_empty()).then_some(parts)
    }

    /// Loads every module file under the root. Returns how many loaded.
    pub async fn load(&self) -> Result<usize> {
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            tracing::debug!("Modules directory {} does not exist", self.root.display());
            return Ok(0);
        }

        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if self.module_path(&path).is_some() {
                    files.push(path);
                }
            }
        }
        files.sort();

        let mut loaded = 0;
        for file in files {
            if self.reload(&file).await.is_ok() {
                loaded += 1;
            }
        }
        tracing::info!("Loaded {} modules from {}", loaded, self.root.display());
        Ok(loaded)
    }

    /// Re-reads one file. A missing file or a syntax error removes the module.
    pub async fn reload(&self, file: &Path) -> Result<()> {
        let path = self
            .module_path(file)
            .ok_or_else(|| KeelError::Internal(format!("{} is not a module file", file.display())))?;
        let name = path.join("/");

        let source = match tokio::fs::read_to_string(file).await {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.retire(file);
                return Ok(());
            }
            Err(e) => {
                self.retire(file);
                return Err(e.into());
            }
        };

        let checked = {
            let file = file.to_path_buf();
            let source = source.clone();
            tokio::task::spawn_blocking(move || script::check_syntax(&file, &source))
                .await
                .map_err(|e| KeelError::Internal(format!("Compile task failed: {}", e)))?
        };
        if let Err(e) = checked {
            self.entries.write().remove(&name);
            tracing::error!(module = %name, "Module removed after syntax error: {}", e);
            return Err(e);
        }

        let module = Arc::new(SharedModule {
            path,
            file: file.to_path_buf(),
            source: Arc::from(source),
        });
        let replaced = self.entries.write().insert(name.clone(), module).is_some();
        tracing::info!(module = %name, replaced, "Module loaded");
        Ok(())
    }

    /// Removes the module backed by `file`, or every module under it when it
    /// was a directory. Returns whether anything was removed.
    pub fn retire(&self, file: &Path) -> bool {
        let Ok(relative) = file.strip_prefix(&self.root) else {
            return false;
        };
        let mut entries = self.entries.write();
        if let Some(path) = self.module_path(file) {
            return entries.remove(&path.join("/")).is_some();
        }
        let Some(prefix) = relative.to_str().filter(|p| !p.is_empty()) else {
            return false;
        };
        let prefix = format!("{}/", prefix.replace('\\', "/"));
        let before = entries.len();
        entries.retain(|name, _| !name.starts_with(&prefix));
        before != entries.len()
    }

    /// Exported modules in name order.
    pub fn exports(&self) -> Vec<Arc<SharedModule>> {
        self.entries
            .read()
            .values()
            .filter(|m| !m.is_start_hook())
            .cloned()
            .collect()
    }

    /// Start hooks in name order.
    pub fn start_hooks(&self) -> Vec<Arc<SharedModule>> {
        self.entries
            .read()
            .values()
            .filter(|m| m.is_start_hook())
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_paths() {
        let table = ModuleTable::new("/app/lib");
        assert_eq!(
            table.module_path(Path::new("/app/lib/utils.js")),
            Some(vec!["utils".to_string()])
        );
        assert_eq!(
            table.module_path(Path::new("/app/lib/resmon/getStatistics.js")),
            Some(vec!["resmon".to_string(), "getStatistics".to_string()])
        );
        assert_eq!(table.module_path(Path::new("/app/lib/notes.md")), None);
        assert_eq!(table.module_path(Path::new("/app/methods/x.js")), None);
        assert_eq!(ModuleTable::default().module_path(Path::new("x.js")), None);
    }

    #[tokio::test]
    async fn test_load_splits_exports_and_hooks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("resmon")).unwrap();
        std::fs::write(dir.path().join("utils.js"), "({ twice: (n) => n * 2 })").unwrap();
        std::fs::write(dir.path().join("resmon/getStatistics.js"), "() => ({})").unwrap();
        std::fs::write(dir.path().join("resmon/start.js"), "() => {}").unwrap();
        std::fs::write(dir.path().join("broken.js"), "({ twice: ").unwrap();

        let table = ModuleTable::new(dir.path());
        assert_eq!(table.load().await.unwrap(), 3);
        assert_eq!(
            table.names(),
            vec!["resmon/getStatistics", "resmon/start", "utils"]
        );
        let exports: Vec<String> = table.exports().iter().map(|m| m.name()).collect();
        assert_eq!(exports, vec!["resmon/getStatistics", "utils"]);
        let hooks: Vec<String> = table.start_hooks().iter().map(|m| m.name()).collect();
        assert_eq!(hooks, vec!["resmon/start"]);
    }

    #[tokio::test]
    async fn test_syntax_error_removes_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("utils.js");
        std::fs::write(&file, "({ ok: true })").unwrap();

        let table = ModuleTable::new(dir.path());
        table.reload(&file).await.unwrap();
        assert_eq!(table.len(), 1);

        std::fs::write(&file, "({ ok: ").unwrap();
        assert!(table.reload(&file).await.is_err());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_retire_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("group")).unwrap();
        std::fs::write(dir.path().join("group/a.js"), "1").unwrap();
        std::fs::write(dir.path().join("group/start.js"), "() => {}").unwrap();
        std::fs::write(dir.path().join("keep.js"), "2").unwrap();

        let table = ModuleTable::new(dir.path());
        table.load().await.unwrap();
        assert!(table.retire(&dir.path().join("group")));
        assert_eq!(table.names(), vec!["keep"]);
    }
}
