//! Registry of installable applications.
//!
//! The registry is built once at startup, from the bundled documents and any
//! configured directory, and handed to the orchestrator by reference.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::debug;

use super::{InstallerError, InstallerSpec};

const BUNDLED: &[(&str, &str)] = &[
    ("uptime-kuma.yaml", include_str!("../../apps/uptime-kuma.yaml")),
    ("gitea.yaml", include_str!("../../apps/gitea.yaml")),
    ("openlitespeed.yaml", include_str!("../../apps/openlitespeed.yaml")),
];

/// Installer documents keyed by application name.
#[derive(Clone, Debug, Default)]
pub struct AppRegistry {
    apps: BTreeMap<String, Arc<InstallerSpec>>,
}

impl AppRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the documents shipped with the binary.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError`] if a bundled document fails to parse.
    pub fn bundled() -> Result<Self, InstallerError> {
        let mut registry = Self::new();
        for (file, text) in BUNDLED {
            let spec = InstallerSpec::from_yaml(text).map_err(|err| InstallerError::Read {
                path: (*file).to_owned(),
                message: err.to_string(),
            })?;
            registry.register(spec);
        }
        Ok(registry)
    }

    /// Adds `spec`, replacing any application with the same name.
    pub fn register(&mut self, spec: InstallerSpec) {
        if let Some(previous) = self.apps.insert(spec.app_name.clone(), Arc::new(spec)) {
            debug!(app = %previous.app_name, "replaced installer");
        }
    }

    /// Loads every `*.yaml` and `*.yml` file in `dir`, returning how many were
    /// registered. Later files override earlier ones with the same app name.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Read`] when the directory or a file cannot be
    /// read and [`InstallerError`] parse variants when a document is invalid.
    pub fn load_dir(&mut self, dir: &Utf8Path) -> Result<usize, InstallerError> {
        let read_error = |path: &str, err: std::io::Error| InstallerError::Read {
            path: path.to_owned(),
            message: err.to_string(),
        };

        let handle =
            Dir::open_ambient_dir(dir, ambient_authority()).map_err(|err| read_error(dir.as_str(), err))?;
        let mut names = Vec::new();
        for entry in handle.entries().map_err(|err| read_error(dir.as_str(), err))? {
            let entry = entry.map_err(|err| read_error(dir.as_str(), err))?;
            let name = entry.file_name().map_err(|err| read_error(dir.as_str(), err))?;
            if name.ends_with(".yaml") || name.ends_with(".yml") {
                names.push(name);
            }
        }
        names.sort();

        for name in &names {
            let path = dir.join(name);
            let text = handle
                .read_to_string(name)
                .map_err(|err| read_error(path.as_str(), err))?;
            let spec = InstallerSpec::from_yaml(&text).map_err(|err| InstallerError::Read {
                path: path.to_string(),
                message: err.to_string(),
            })?;
            debug!(app = %spec.app_name, path = %path, "loaded installer");
            self.register(spec);
        }
        Ok(names.len())
    }

    /// Looks up an application by name.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::UnknownApp`] when nothing is registered under
    /// `name`.
    pub fn get(&self, name: &str) -> Result<Arc<InstallerSpec>, InstallerError> {
        self.apps
            .get(name)
            .cloned()
            .ok_or_else(|| InstallerError::UnknownApp(name.to_owned()))
    }

    /// Iterates over registered applications in name order.
    pub fn iter(&self) -> impl Iterator<Item = &InstallerSpec> {
        self.apps.values().map(AsRef::as_ref)
    }

    /// Number of registered applications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.apps.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}
