use crate::context::{ATTR_SOURCE_MEDIA_TYPE, OutputContext};
use crate::error::Error;
use crate::options::RenderOptions;
use crate::renderer::{Renderer, RendererFamily};
use crate::surface::{Surface, SurfaceSpec};
use async_trait::async_trait;
use serde_json::Value;

/// Plotly-style chart specifications: `{"data": [trace, ...], "layout": {...}}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChartRenderer;

fn validate(spec: &Value) -> Result<(), Error> {
    let Some(object) = spec.as_object() else {
        return Err(Error::render("plotly", "chart specification must be an object"));
    };
    let Some(traces) = object.get("data").and_then(Value::as_array) else {
        return Err(Error::render("plotly", "chart specification needs a `data` array"));
    };
    if let Some(index) = traces.iter().position(|trace| !trace.is_object()) {
        return Err(Error::render(
            "plotly",
            format!("trace {} is not an object", index),
        ));
    }
    if object.get("layout").is_some_and(|layout| !layout.is_object()) {
        return Err(Error::render("plotly", "`layout` must be an object"));
    }
    Ok(())
}

#[async_trait]
impl Renderer<Value> for ChartRenderer {
    fn type_name(&self) -> &str {
        "plotly"
    }

    fn family(&self) -> RendererFamily {
        RendererFamily::Application
    }

    async fn render_into(
        &self,
        ocx: &OutputContext,
        spec: &Value,
        options: &RenderOptions,
    ) -> Result<Surface, Error> {
        validate(spec)?;
        let serialized = serde_json::to_string(spec)?;
        let parent = ocx.create_child(SurfaceSpec::default().attr(ATTR_SOURCE_MEDIA_TYPE, self.media_type()))?;
        let mut chart = SurfaceSpec::new("div").class("chart").attr("data-chart", serialized);
        chart.style = options.style.clone();
        parent.create_child(chart);
        Ok(parent)
    }
}
