//! Filesystem document store.
//!
//! Layout under the root directory:
//!
//! ```text
//! applications/<id>/application.json
//! templates/<name>.json
//! frameworks/<id>.json
//! addons/<id>.json
//! scripts/<path>
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::application::DocumentSource;
use crate::core::error::{ConfigurationError, DocumentKind};
use crate::core::types::{Addon, Application, Framework, Template};

#[derive(Debug, Clone)]
pub struct FsDocuments {
    root: PathBuf,
}

impl FsDocuments {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the application document for `id`. Ids that would leave
    /// `applications/` are rejected.
    pub fn application_path(&self, id: &str) -> Result<PathBuf, ConfigurationError> {
        check_reference(DocumentKind::Application, id)?;
        Ok(self
            .root
            .join("applications")
            .join(id)
            .join("application.json"))
    }

    /// Write an application document, creating its directory.
    pub fn write_application(&self, application: &Application) -> Result<PathBuf> {
        let path = self.application_path(&application.id)?;
        let mut buf = serde_json::to_string_pretty(application)?;
        buf.push('\n');
        super::write_atomic(&path, &buf)?;
        Ok(path)
    }

    fn read(
        &self,
        kind: DocumentKind,
        id: &str,
        path: &Path,
    ) -> Result<Option<String>, ConfigurationError> {
        check_reference(kind, id)?;
        match fs::read_to_string(path) {
            Ok(contents) => {
                debug!(path = %path.display(), "document read");
                Ok(Some(contents))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ConfigurationError::Malformed {
                kind,
                id: id.to_string(),
                reason: format!("read {}: {err}", path.display()),
            }),
        }
    }

    fn load<T: DeserializeOwned>(
        &self,
        kind: DocumentKind,
        id: &str,
        path: &Path,
    ) -> Result<Option<T>, ConfigurationError> {
        let Some(contents) = self.read(kind, id, path)? else {
            return Ok(None);
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| ConfigurationError::Malformed {
                kind,
                id: id.to_string(),
                reason: format!("parse {}: {err}", path.display()),
            })
    }
}

fn with_json_extension(name: &str) -> String {
    if name.ends_with(".json") {
        name.to_string()
    } else {
        format!("{name}.json")
    }
}

fn is_relative_inside(reference: &str) -> bool {
    !reference.is_empty()
        && Path::new(reference)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

fn check_reference(kind: DocumentKind, id: &str) -> Result<(), ConfigurationError> {
    if is_relative_inside(id) {
        Ok(())
    } else {
        Err(ConfigurationError::Malformed {
            kind,
            id: id.to_string(),
            reason: "reference must be a relative path without '..'".to_string(),
        })
    }
}

impl DocumentSource for FsDocuments {
    fn application(&self, id: &str) -> Result<Option<Application>, ConfigurationError> {
        let path = self.application_path(id)?;
        let application: Option<Application> = self.load(DocumentKind::Application, id, &path)?;
        Ok(application.map(|mut app| {
            if app.id.is_empty() {
                app.id = id.to_string();
            }
            app
        }))
    }

    fn template(&self, name: &str) -> Result<Option<Template>, ConfigurationError> {
        let path = self.root.join("templates").join(with_json_extension(name));
        let template: Option<Template> = self.load(DocumentKind::Template, name, &path)?;
        Ok(template.map(|mut template| {
            if template.name.is_empty() {
                template.name = name.to_string();
            }
            template
        }))
    }

    fn framework(&self, id: &str) -> Result<Option<Framework>, ConfigurationError> {
        let path = self.root.join("frameworks").join(with_json_extension(id));
        self.load(DocumentKind::Framework, id, &path)
    }

    fn addon(&self, id: &str) -> Result<Option<Addon>, ConfigurationError> {
        let path = self.root.join("addons").join(with_json_extension(id));
        self.load(DocumentKind::Addon, id, &path)
    }

    fn script(&self, path: &str) -> Result<Option<String>, ConfigurationError> {
        let full = self.root.join("scripts").join(path);
        self.read(DocumentKind::Script, path, &full)
    }
}
