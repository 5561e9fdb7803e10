use crate::context::{ATTR_SOURCE_MEDIA_TYPE, OutputContext};
use crate::error::Error;
use crate::options::RenderOptions;
use crate::renderer::{Renderer, RendererFamily};
use crate::surface::{Surface, SurfaceSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An RGBA raster placed at `(x, y)` on the canvas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    #[serde(default)]
    pub x: u32,
    #[serde(default)]
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// `width * height` pixels, four bytes each.
    pub rgba: Vec<u8>,
}

impl ImageData {
    fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(4)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDataRenderer;

#[async_trait]
impl Renderer<[ImageData]> for ImageDataRenderer {
    fn type_name(&self) -> &str {
        "image-data"
    }

    fn family(&self) -> RendererFamily {
        RendererFamily::Application
    }

    async fn render_into(
        &self,
        ocx: &OutputContext,
        images: &[ImageData],
        options: &RenderOptions,
    ) -> Result<Surface, Error> {
        for (index, image) in images.iter().enumerate() {
            match image.expected_len() {
                Some(expected) if expected == image.rgba.len() => {}
                expected => {
                    return Err(Error::render(
                        self.type_name(),
                        format!(
                            "image {}: expected {} bytes of RGBA data for {}x{}, got {}",
                            index,
                            expected.map_or_else(|| "overflowing".to_string(), |n| n.to_string()),
                            image.width,
                            image.height,
                            image.rgba.len()
                        ),
                    ));
                }
            }
        }

        let width = images.iter().map(|i| i.x.saturating_add(i.width)).max().unwrap_or(0);
        let height = images.iter().map(|i| i.y.saturating_add(i.height)).max().unwrap_or(0);

        let parent = ocx.create_child(SurfaceSpec::default().attr(ATTR_SOURCE_MEDIA_TYPE, self.media_type()))?;
        let mut canvas = SurfaceSpec::new("canvas")
            .attr("width", width.to_string())
            .attr("height", height.to_string());
        canvas.style = options.style.clone();
        let canvas = parent.create_child(canvas);
        for image in images {
            canvas.create_child(
                SurfaceSpec::new("image-data")
                    .attr("x", image.x.to_string())
                    .attr("y", image.y.to_string())
                    .attr("width", image.width.to_string())
                    .attr("height", image.height.to_string()),
            );
        }
        Ok(parent)
    }
}
