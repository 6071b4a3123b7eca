//! Email template rendering engine.
//!
//! Templates are addressed by relative path (`email/password-reset.html`).
//! A configured template directory takes precedence over the built-in copies;
//! each template is compiled on first use and cached for the life of the engine.

use crate::error::{NotificationError, NotificationResult};
use handlebars::Handlebars;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, error};

/// Template used for `user.password-change-requested`.
pub const PASSWORD_RESET_TEMPLATE: &str = "email/password-reset.html";

const BUILT_IN_TEMPLATES: &[(&str, &str)] = &[(
    PASSWORD_RESET_TEMPLATE,
    include_str!("../../templates/email/password-reset.html"),
)];

/// Handlebars-backed template engine.
pub struct TemplateEngine {
    registry: RwLock<Handlebars<'static>>,
    directory: Option<PathBuf>,
}

impl TemplateEngine {
    /// Engine that only knows the built-in templates.
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Handlebars::new()),
            directory: None,
        }
    }

    /// Engine that looks up templates in `directory` before the built-ins.
    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
            ..Self::new()
        }
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Render `name` with `data`, loading and compiling it on first use.
    pub async fn render<T: Serialize>(&self, name: &str, data: &T) -> NotificationResult<String> {
        let result = self.render_inner(name, data).await;
        if let Err(e) = &result {
            error!(template = %name, error = %e, "Failed to render template");
        }
        result
    }

    async fn render_inner<T: Serialize>(&self, name: &str, data: &T) -> NotificationResult<String> {
        if !self.is_loaded(name) {
            let source = self.load_source(name).await?;
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            if !registry.has_template(name) {
                registry.register_template_string(name, source)?;
                debug!(template = %name, "Compiled template");
            }
        }

        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        Ok(registry.render(name, data)?)
    }

    fn is_loaded(&self, name: &str) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .has_template(name)
    }

    async fn load_source(&self, name: &str) -> NotificationResult<String> {
        if let Some(directory) = &self.directory {
            let path = directory.join(checked_relative(name)?);
            match tokio::fs::read_to_string(&path).await {
                Ok(source) => return Ok(source),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(NotificationError::Template(format!(
                        "failed to read {}: {e}",
                        path.display()
                    )))
                }
            }
        }

        BUILT_IN_TEMPLATES
            .iter()
            .find(|(built_in, _)| *built_in == name)
            .map(|(_, source)| source.to_string())
            .ok_or_else(|| NotificationError::Template(format!("template not found: {name}")))
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn checked_relative(name: &str) -> NotificationResult<&Path> {
    let path = Path::new(name);
    if path
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        Ok(path)
    } else {
        Err(NotificationError::Template(format!(
            "template name must be a relative path: {name}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("templates-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("email")).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_render_built_in_password_reset() {
        let engine = TemplateEngine::new();
        let link = "http://localhost:3000/reset-password?token=a%2Bb%3D";

        let html = engine
            .render(PASSWORD_RESET_TEMPLATE, &json!({ "resetLink": link }))
            .await
            .unwrap();

        assert!(html.contains(&format!("href=\"{link}\"")));
    }

    #[tokio::test]
    async fn test_unknown_template() {
        let engine = TemplateEngine::new();
        let err = engine.render("email/missing.html", &json!({})).await.unwrap_err();
        assert!(matches!(err, NotificationError::Template(_)));
    }

    #[tokio::test]
    async fn test_directory_overrides_built_in_and_is_cached() {
        let dir = scratch_dir();
        let path = dir.join(PASSWORD_RESET_TEMPLATE);
        std::fs::write(&path, "custom {{{resetLink}}}").unwrap();

        let engine = TemplateEngine::with_directory(&dir);
        let first = engine
            .render(PASSWORD_RESET_TEMPLATE, &json!({ "resetLink": "x" }))
            .await
            .unwrap();
        assert_eq!(first, "custom x");

        std::fs::write(&path, "changed").unwrap();
        let second = engine
            .render(PASSWORD_RESET_TEMPLATE, &json!({ "resetLink": "y" }))
            .await
            .unwrap();
        assert_eq!(second, "custom y");

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_directory_falls_back_to_built_in() {
        let dir = scratch_dir();
        let engine = TemplateEngine::with_directory(&dir);

        let html = engine
            .render(PASSWORD_RESET_TEMPLATE, &json!({ "resetLink": "z" }))
            .await
            .unwrap();
        assert!(html.contains("Reset your password"));

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_directory() {
        let engine = TemplateEngine::with_directory(std::env::temp_dir());
        let err = engine.render("../etc/passwd", &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("relative path"));
    }
}
