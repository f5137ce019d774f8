//! MiniJinjaRenderer - `Renderer` backed by a MiniJinja environment.
//!
//! Undefined variables are errors (strict mode), so a context missing a key
//! the template uses fails rendering instead of producing a blank.
//!
//! HTML がデフォルト: 名前が `.txt` で終わるテンプレートと `render_text` 以外は
//! すべて HTML エスケープされる。recipient の name などは producer 由来の値なので
//! そのまま本文に埋め込まない。

use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use tracing::debug;

use crate::domain::{Context, TemplateError, TemplateRef};
use crate::ports::Renderer;

pub const WELCOME: &str = "welcome";
pub const PASSWORD_RESET: &str = "password_reset";

/// Names given to inline sources, chosen so the escape callback sees the format.
const INLINE_HTML: &str = "inline.html";
const INLINE_TEXT: &str = "inline.txt";

const WELCOME_HTML: &str = r#"<!DOCTYPE html>
<html>
  <body style="font-family: Arial, sans-serif; color: #333;">
    <h1>Welcome aboard, {{ name }}!</h1>
    <p>Your account is ready. Sign in any time to get started.</p>
    <p>If you did not create this account you can ignore this message.</p>
  </body>
</html>
"#;

const PASSWORD_RESET_HTML: &str = r#"<!DOCTYPE html>
<html>
  <body style="font-family: Arial, sans-serif; color: #333;">
    <h1>Password reset request</h1>
    <p>Hi {{ name }},</p>
    <p>We received a request to reset the password for your account.</p>
    <p><a href="{{ reset_link }}">Reset password</a></p>
    <p>This link expires in 1 hour. If you did not ask for a reset, ignore this email.</p>
  </body>
</html>
"#;

pub struct MiniJinjaRenderer {
    env: Environment<'static>,
}

impl MiniJinjaRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|name| {
            if name.ends_with(".txt") {
                AutoEscape::None
            } else {
                AutoEscape::Html
            }
        });
        Self { env }
    }

    /// Renderer preloaded with the `welcome` and `password_reset` templates.
    pub fn with_builtin_templates() -> Result<Self, TemplateError> {
        Self::new()
            .with_template(WELCOME, WELCOME_HTML)?
            .with_template(PASSWORD_RESET, PASSWORD_RESET_HTML)
    }

    pub fn with_template(
        mut self,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<Self, TemplateError> {
        self.register(name, source)?;
        Ok(self)
    }

    /// Add or replace a named template. Syntax errors surface here.
    ///
    /// Output is HTML escaped unless `name` ends in `.txt`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<(), TemplateError> {
        let name = name.into();
        self.env
            .add_template_owned(name.clone(), source.into())
            .map_err(|e| TemplateError::new(e.to_string()))?;
        debug!(template = %name, "registered template");
        Ok(())
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.env.get_template(name).is_ok()
    }
}

impl Default for MiniJinjaRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl MiniJinjaRenderer {
    fn render_as(
        &self,
        template: &TemplateRef,
        context: &Context,
        inline_name: &str,
    ) -> Result<String, TemplateError> {
        let rendered = match template {
            TemplateRef::Named(name) => self
                .env
                .get_template(name)
                .and_then(|tmpl| tmpl.render(context)),
            TemplateRef::Inline(source) => self.env.render_named_str(inline_name, source, context),
        };
        rendered.map_err(|e| TemplateError::new(e.to_string()))
    }
}

impl Renderer for MiniJinjaRenderer {
    fn render(&self, template: &TemplateRef, context: &Context) -> Result<String, TemplateError> {
        self.render_as(template, context, INLINE_HTML)
    }

    fn render_text(
        &self,
        template: &TemplateRef,
        context: &Context,
    ) -> Result<String, TemplateError> {
        self.render_as(template, context, INLINE_TEXT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: serde_json::Value) -> Context {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Context::new(),
        }
    }

    #[test]
    fn renders_inline_template() {
        let renderer = MiniJinjaRenderer::new();

        let html = renderer
            .render(
                &TemplateRef::inline("<p>Hello, {{ name }}!</p>"),
                &ctx(json!({"name": "Ada"})),
            )
            .unwrap();

        assert_eq!(html, "<p>Hello, Ada!</p>");
    }

    #[test]
    fn renders_named_template() {
        let renderer = MiniJinjaRenderer::new()
            .with_template("greeting", "Hi {{ name }} <{{ email }}>")
            .unwrap();

        let text = renderer
            .render(
                &TemplateRef::named("greeting"),
                &ctx(json!({"name": "Ada", "email": "ada@example.com"})),
            )
            .unwrap();

        assert_eq!(text, "Hi Ada <ada@example.com>");
    }

    #[test]
    fn unknown_template_is_an_error() {
        let renderer = MiniJinjaRenderer::new();

        let err = renderer
            .render(&TemplateRef::named("nope"), &Context::new())
            .unwrap_err();

        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn missing_context_key_is_an_error() {
        let renderer = MiniJinjaRenderer::new();

        let result = renderer.render(&TemplateRef::inline("Hi {{ name }}"), &Context::new());

        assert!(result.is_err());
    }

    #[test]
    fn syntax_error_is_reported_on_register() {
        let result = MiniJinjaRenderer::new().with_template("broken", "{% if %}");
        assert!(result.is_err());
    }

    #[test]
    fn builtin_templates_render() {
        let renderer = MiniJinjaRenderer::with_builtin_templates().unwrap();
        assert!(renderer.has_template(WELCOME));

        let welcome = renderer
            .render(&TemplateRef::named(WELCOME), &ctx(json!({"name": "Ada"})))
            .unwrap();
        assert!(welcome.contains("Welcome aboard, Ada!"));

        let reset = renderer
            .render(
                &TemplateRef::named(PASSWORD_RESET),
                &ctx(json!({"name": "Ada", "reset_link": "https://example.com/r?token=t1"})),
            )
            .unwrap();
        assert!(reset.contains("token=t1"));
    }

    #[test]
    fn html_bodies_escape_context_values() {
        let renderer = MiniJinjaRenderer::with_builtin_templates().unwrap();
        let hostile = ctx(json!({"name": "<script>alert(1)</script>"}));

        let named = renderer.render(&TemplateRef::named(WELCOME), &hostile).unwrap();
        let inline = renderer
            .render(&TemplateRef::inline("<p>{{ name }}</p>"), &hostile)
            .unwrap();

        for html in [named, inline] {
            assert!(!html.contains("<script>"), "{html}");
            assert!(html.contains("&lt;script&gt;"), "{html}");
        }
    }

    #[test]
    fn text_bodies_are_not_escaped() {
        let renderer = MiniJinjaRenderer::new()
            .with_template("digest.txt", "Hi {{ name }}")
            .unwrap();
        let context = ctx(json!({"name": "Tom & Jerry"}));

        let inline = renderer
            .render_text(&TemplateRef::inline("Hi {{ name }}"), &context)
            .unwrap();
        let named = renderer
            .render_text(&TemplateRef::named("digest.txt"), &context)
            .unwrap();

        assert_eq!(inline, "Hi Tom & Jerry");
        assert_eq!(named, "Hi Tom & Jerry");
    }

    #[test]
    fn password_reset_without_link_fails() {
        let renderer = MiniJinjaRenderer::with_builtin_templates().unwrap();

        let result = renderer.render(
            &TemplateRef::named(PASSWORD_RESET),
            &ctx(json!({"name": "Ada"})),
        );

        assert!(result.is_err());
    }
}
