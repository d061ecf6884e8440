//! Module loader
//!
//! Compiles every `*.js` file under the methods directory into the method
//! table. A method's name is its path relative to that directory without the
//! extension, with `/` separators (`example/resources.js` → `example/resources`).
//! A file that fails to compile is retired, never left serving a previous
//! version. When a [`ModuleTable`] is attached, the loader also loads the
//! shared modules directory. [`ModuleLoader::watch`] keeps both in sync with
//! their directories.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keel_common::{KeelError, Result};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::method::MethodTable;
use crate::modules::ModuleTable;
use crate::resource_limits::ResourceLimits;
use crate::script::ScriptMethod;

const DEBOUNCE: Duration = Duration::from_millis(100);

pub struct ModuleLoader {
    root: PathBuf,
    methods: MethodTable,
    limits: ResourceLimits,
    reserved: RwLock<HashSet<String>>,
    modules: Option<ModuleTable>,
}

impl ModuleLoader {
    pub fn new(root: impl Into<PathBuf>, methods: MethodTable, limits: ResourceLimits) -> Self {
        Self {
            root: root.into(),
            methods,
            limits,
            reserved: RwLock::new(HashSet::new()),
            modules: None,
        }
    }

    /// Also loads and watches the shared modules of `modules`.
    pub fn with_modules(mut self, modules: ModuleTable) -> Self {
        self.modules = Some(modules);
        self
    }

    fn modules_for(&self, path: &Path) -> Option<&ModuleTable> {
        self.modules
            .as_ref()
            .filter(|m| !m.root().as_os_str().is_empty() && path.starts_with(m.root()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names owned by native methods. Files with these names are ignored.
    pub fn reserve<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reserved.write().extend(names.into_iter().map(Into::into));
    }

    /// Method name for a file under the root, if it is a method file.
    pub fn method_name(&self, path: &Path) -> Option<String> {
        if path.extension()? != "js" {
            return None;
        }
        let relative = path.strip_prefix(&self.root).ok()?.with_extension("");
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    /// Loads the shared modules, then every method file under the root.
    /// Returns how many methods compiled.
    pub async fn load(&self) -> Result<usize> {
        if let Some(modules) = &self.modules {
            modules.load().await?;
        }
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            tracing::warn!("Methods directory {} does not exist", self.root.display());
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
                } else if self.method_name(&path).is_some() {
                    files.push(path);
                }
            }
        }
        files.sort();

        let mut loaded = 0;
        for path in files {
            if self.reload(&path).await.is_ok() {
                loaded += 1;
            }
        }
        tracing::info!("Loaded {} methods from {}", loaded, self.root.display());
        Ok(loaded)
    }

    /// Recompiles one file and swaps it into the table.
    ///
    /// A missing file retires the name; a compile failure retires it and
    /// returns the error.
    pub async fn reload(&self, path: &Path) -> Result<()> {
        let name = self
            .method_name(path)
            .ok_or_else(|| KeelError::Internal(format!("{} is not a method file", path.display())))?;
        if self.reserved.read().contains(&name) {
            tracing::warn!("Ignoring {}: {} is a built-in method", path.display(), name);
            return Ok(());
        }

        let source = match tokio::fs::read_to_string(path).await {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.retire(path);
                return Ok(());
            }
            Err(e) => {
                self.retire(path);
                return Err(e.into());
            }
        };

        let limits = self.limits.clone();
        let file = path.to_path_buf();
        let compile_name = name.clone();
        let compiled = tokio::task::spawn_blocking(move || {
            ScriptMethod::compile(&compile_name, &file, source, &limits)
        })
        .await
        .map_err(|e| KeelError::Internal(format!("Compile task failed: {}", e)))?;

        match compiled {
            Ok(method) => {
                let replaced = self.methods.insert(name.clone(), Arc::new(method)).is_some();
                tracing::info!(method = %name, replaced, "Method loaded");
                Ok(())
            }
            Err(e) => {
                self.methods.remove(&name);
                tracing::error!(method = %name, "Method retired after compile failure: {}", e);
                Err(e)
            }
        }
    }

    /// Removes the method backed by `path`, or every method under it when
    /// `path` was a directory. Returns whether anything was removed.
    pub fn retire(&self, path: &Path) -> bool {
        let reserved = self.reserved.read();
        if let Some(name) = self.method_name(path) {
            if reserved.contains(&name) {
                return false;
            }
            let removed = self.methods.remove(&name);
            if removed {
                tracing::info!(method = %name, "Method retired");
            }
            return removed;
        }

        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        let Some(prefix) = relative.to_str().filter(|p| !p.is_empty()) else {
            return false;
        };
        let prefix = format!("{}/", prefix.replace('\\', "/"));
        let mut removed = false;
        for name in self.methods.names() {
            if name.starts_with(&prefix) && !reserved.contains(&name) {
                removed |= self.methods.remove(&name);
                tracing::info!(method = %name, "Method retired");
            }
        }
        removed
    }

    /// Applies one debounced change.
    async fn apply_change(&self, path: &Path) {
        if let Some(modules) = self.modules_for(path) {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                if modules.module_path(path).is_some() {
                    let _ = modules.reload(path).await;
                }
            } else if modules.retire(path) {
                tracing::info!("Modules retired under {}", path.display());
            }
            return;
        }
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            if self.method_name(path).is_some() {
                // Failures are logged by reload
                let _ = self.reload(path).await;
            }
        } else {
            self.retire(path);
        }
    }

    /// Watches the root and applies changes until the returned guard drops.
    pub fn watch(self: &Arc<Self>) -> Result<LoaderWatch> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DebounceEventResult>();
        let mut debouncer = new_debouncer(DEBOUNCE, move |result: DebounceEventResult| {
            let _ = tx.send(result);
        })
        .map_err(|e| KeelError::Internal(format!("Failed to create file watcher: {}", e)))?;
        debouncer
            .watcher()
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| {
                KeelError::Internal(format!("Failed to watch {}: {}", self.root.display(), e))
            })?;
        if let Some(modules) = self.modules.as_ref().filter(|m| m.root().is_dir()) {
            debouncer
                .watcher()
                .watch(modules.root(), RecursiveMode::Recursive)
                .map_err(|e| {
                    KeelError::Internal(format!(
                        "Failed to watch {}: {}",
                        modules.root().display(),
                        e
                    ))
                })?;
        }

        let loader = self.clone();
        let task = tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(events) => {
                        let mut paths: Vec<PathBuf> = events.into_iter().map(|e| e.path).collect();
                        paths.sort();
                        paths.dedup();
                        for path in paths {
                            loader.apply_change(&path).await;
                        }
                    }
                    Err(error) => tracing::warn!("Watch error: {}", error),
                }
            }
        });

        tracing::info!("Watching {} for method changes", self.root.display());
        Ok(LoaderWatch {
            _debouncer: debouncer,
            task,
        })
    }
}

/// Keeps the watcher alive. Dropping it stops watching.
pub struct LoaderWatch {
    _debouncer: Debouncer<RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl Drop for LoaderWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}
