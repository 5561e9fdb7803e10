use crate::context::{ATTR_SOURCE_MEDIA_TYPE, OutputContext};
use crate::error::Error;
use crate::options::RenderOptions;
use crate::renderer::{Renderer, RendererFamily};
use crate::surface::{Surface, SurfaceSpec};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct ErrorRenderOptions {
    /// Only show the message, not the detail.
    pub abbreviated: bool,
    pub style: BTreeMap<String, String>,
}

impl ErrorRenderOptions {
    pub fn abbreviated() -> Self {
        Self {
            abbreviated: true,
            ..Self::default()
        }
    }
}

/// A failure prepared for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub message: String,
    pub detail: Option<String>,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    /// Message plus the chain of underlying causes as detail.
    pub fn from_error(error: &Error) -> Self {
        let mut causes = Vec::new();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            causes.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            detail: (!causes.is_empty()).then(|| causes.join("\n")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorRenderer;

#[async_trait]
impl Renderer<ErrorReport> for ErrorRenderer {
    fn type_name(&self) -> &str {
        "error"
    }

    fn family(&self) -> RendererFamily {
        RendererFamily::Application
    }

    async fn render_into(
        &self,
        ocx: &OutputContext,
        report: &ErrorReport,
        options: &RenderOptions,
    ) -> Result<Surface, Error> {
        let options = ErrorRenderOptions {
            abbreviated: false,
            style: options.style.clone(),
        };
        Ok(render_sync(ocx, report, &options))
    }
}

/// Write `report` straight into the context's surface.
///
/// Performs no cancellation checkpoint, so it also works on stopped contexts.
pub(crate) fn render_sync(
    ocx: &OutputContext,
    report: &ErrorReport,
    options: &ErrorRenderOptions,
) -> Surface {
    let mut text = report.message.clone();
    if let (Some(detail), false) = (&report.detail, options.abbreviated) {
        text.push('\n');
        text.push_str(detail);
    }
    if text.is_empty() {
        text.push_str("Error");
    }

    let mut spec = SurfaceSpec::new("pre")
        .class("error-message")
        .attr(ATTR_SOURCE_MEDIA_TYPE, ErrorRenderer.media_type());
    spec.style = options.style.clone();
    let surface = ocx.surface().create_child(spec);
    surface.set_text(&text);
    surface
}
