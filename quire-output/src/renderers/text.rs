use crate::context::{ATTR_SOURCE_MEDIA_TYPE, OutputContext};
use crate::error::Error;
use crate::options::RenderOptions;
use crate::renderer::{Renderer, RendererFamily};
use crate::surface::Surface;
use async_trait::async_trait;

/// Plain text in its own child surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextRenderer;

#[async_trait]
impl Renderer<str> for TextRenderer {
    fn type_name(&self) -> &str {
        "plain"
    }

    fn family(&self) -> RendererFamily {
        RendererFamily::Text
    }

    async fn render_into(
        &self,
        ocx: &OutputContext,
        text: &str,
        options: &RenderOptions,
    ) -> Result<Surface, Error> {
        let surface = ocx.surface_for_options(options, true)?;
        surface.add_class("plain-text");
        surface.set_attr(ATTR_SOURCE_MEDIA_TYPE, self.media_type());
        surface.set_text(text);
        Ok(surface)
    }
}
