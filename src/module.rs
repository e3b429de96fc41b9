//! Module lookup for whatever constructs task actions.
//!
//! The engine itself never resolves modules. A [`ModuleRegistry`] is handed
//! explicitly to the code assembling a [`Blueprint`](crate::Blueprint), so two
//! builds in one process can use different registries.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::UnknownModuleError;

/// Ordered list of archive files and directories making up a module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassPath(Vec<Utf8PathBuf>);

impl ClassPath {
    pub fn new(entries: impl IntoIterator<Item = impl Into<Utf8PathBuf>>) -> Self {
        Self(entries.into_iter().map(Into::into).collect())
    }

    pub fn entries(&self) -> &[Utf8PathBuf] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends the entries of `other` which are not already present.
    pub fn plus(mut self, other: &ClassPath) -> Self {
        for entry in &other.0 {
            if !self.0.contains(entry) {
                self.0.push(entry.clone());
            }
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub classpath: ClassPath,
}

/// Registry of loadable modules.
pub trait ModuleRegistry: Send + Sync {
    /// A module without metadata, packaged as a single archive with no
    /// runtime dependencies.
    fn external_module(&self, name: &str) -> Result<Module, UnknownModuleError>;

    /// A module known to the registry by name.
    fn module(&self, name: &str) -> Result<Module, UnknownModuleError>;

    /// A module shipped with the installation. Never looks outside of it.
    fn builtin_module(&self, name: &str) -> Result<Module, UnknownModuleError>;

    /// Locations searched in addition to the installation. May be empty.
    fn additional_classpath(&self) -> ClassPath;
}

/// Resolves modules from explicitly registered entries and from `.jar`
/// archives found in a set of directories.
///
/// An archive matches a module named `name` when it is called `name.jar` or
/// `name-<version>.jar`. The first match in directory order wins, ties inside
/// one directory go to the lexicographically smallest file name.
#[derive(Debug, Default)]
pub struct DirectoryRegistry {
    install: Vec<Utf8PathBuf>,
    search: Vec<Utf8PathBuf>,
    registered: BTreeMap<String, ClassPath>,
}

impl DirectoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_install_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.install.push(dir.into());
        self
    }

    pub fn with_search_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.search.push(dir.into());
        self
    }

    pub fn register(mut self, name: impl Into<String>, classpath: ClassPath) -> Self {
        self.registered.insert(name.into(), classpath);
        self
    }

    fn find(dirs: &[Utf8PathBuf], name: &str) -> Option<Utf8PathBuf> {
        dirs.iter().find_map(|dir| find_archive(dir, name))
    }
}

fn find_archive(dir: &Utf8Path, name: &str) -> Option<Utf8PathBuf> {
    let exact = dir.join(format!("{name}.jar"));
    if exact.is_file() {
        return Some(exact);
    }

    let pattern = format!(
        "{}/{}-*.jar",
        glob::Pattern::escape(dir.as_str()),
        glob::Pattern::escape(name)
    );
    let mut matches: Vec<_> = match glob::glob(&pattern) {
        Ok(paths) => paths
            .filter_map(Result::ok)
            .filter_map(|path| Utf8PathBuf::try_from(path).ok())
            .filter(|path| path.is_file())
            .collect(),
        Err(e) => {
            tracing::debug!("Skipping {dir} while looking for {name}: {e}");
            return None;
        }
    };

    matches.sort();
    matches.into_iter().next()
}

impl ModuleRegistry for DirectoryRegistry {
    fn external_module(&self, name: &str) -> Result<Module, UnknownModuleError> {
        let dirs: Vec<_> = self.install.iter().chain(&self.search).cloned().collect();

        Self::find(&dirs, name)
            .map(|archive| Module {
                name: name.to_string(),
                classpath: ClassPath::new([archive]),
            })
            .ok_or_else(|| UnknownModuleError {
                kind: "external",
                name: name.to_string(),
            })
    }

    fn module(&self, name: &str) -> Result<Module, UnknownModuleError> {
        if let Some(classpath) = self.registered.get(name) {
            return Ok(Module {
                name: name.to_string(),
                classpath: classpath.clone(),
            });
        }

        self.builtin_module(name).map_err(|_| UnknownModuleError {
            kind: "registered",
            name: name.to_string(),
        })
    }

    fn builtin_module(&self, name: &str) -> Result<Module, UnknownModuleError> {
        Self::find(&self.install, name)
            .map(|archive| Module {
                name: name.to_string(),
                classpath: ClassPath::new([archive]),
            })
            .ok_or_else(|| UnknownModuleError {
                kind: "builtin",
                name: name.to_string(),
            })
    }

    fn additional_classpath(&self) -> ClassPath {
        ClassPath::new(self.search.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        (tmp, path)
    }

    #[test]
    fn test_external_module_versioned_archive() {
        let (_tmp, lib) = dir();
        fs::write(lib.join("groovy-3.0.1.jar"), "").unwrap();
        fs::write(lib.join("groovy-2.5.0.jar"), "").unwrap();
        fs::write(lib.join("groovy.txt"), "").unwrap();

        let registry = DirectoryRegistry::new().with_search_dir(&lib);
        let module = registry.external_module("groovy").unwrap();

        assert_eq!(module.name, "groovy");
        assert_eq!(module.classpath.entries(), [lib.join("groovy-2.5.0.jar")]);
    }

    #[test]
    fn test_builtin_ignores_search_dirs() {
        let (_a, install) = dir();
        let (_b, search) = dir();
        fs::write(install.join("core.jar"), "").unwrap();
        fs::write(search.join("plugin-1.0.jar"), "").unwrap();

        let registry = DirectoryRegistry::new()
            .with_install_dir(&install)
            .with_search_dir(&search);

        assert!(registry.builtin_module("core").is_ok());
        assert_eq!(
            registry.builtin_module("plugin"),
            Err(UnknownModuleError {
                kind: "builtin",
                name: "plugin".into()
            })
        );
        assert!(registry.external_module("plugin").is_ok());
        assert_eq!(registry.additional_classpath(), ClassPath::new([&search]));
    }

    #[test]
    fn test_registered_module() {
        let registry = DirectoryRegistry::new().register(
            "tooling",
            ClassPath::new(["lib/a.jar", "lib/b.jar"]),
        );

        let module = registry.module("tooling").unwrap();
        assert_eq!(module.classpath.entries().len(), 2);

        let err = registry.module("nope").unwrap_err();
        assert_eq!(err.to_string(), "Cannot locate registered module 'nope'");
    }

    #[test]
    fn test_classpath_plus() {
        let a = ClassPath::new(["x.jar", "y.jar"]);
        let b = ClassPath::new(["y.jar", "z.jar"]);
        assert_eq!(a.plus(&b), ClassPath::new(["x.jar", "y.jar", "z.jar"]));
    }
}
