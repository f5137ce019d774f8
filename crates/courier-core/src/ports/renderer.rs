//! Renderer port - pure templating, no state between calls.

use crate::domain::{Context, TemplateError, TemplateRef};

pub trait Renderer: Send + Sync {
    /// Render an HTML body; interpolated values are escaped.
    ///
    /// Fails on a missing or invalid template, or a context key the template
    /// uses but the context does not provide.
    fn render(&self, template: &TemplateRef, context: &Context) -> Result<String, TemplateError>;

    /// Render a plain-text body, without HTML escaping.
    fn render_text(
        &self,
        template: &TemplateRef,
        context: &Context,
    ) -> Result<String, TemplateError> {
        self.render(template, context)
    }
}
