use super::check_braces;
use crate::context::{ATTR_SOURCE_MEDIA_TYPE, OutputContext};
use crate::error::Error;
use crate::options::RenderOptions;
use crate::renderer::{Renderer, RendererFamily};
use crate::surface::{Surface, SurfaceSpec};
use async_trait::async_trait;

/// Graph descriptions in the DOT language. Layout happens on the viewing side.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphvizRenderer;

fn validate(dot: &str) -> Result<(), Error> {
    let Some((line_index, line)) = dot
        .lines()
        .enumerate()
        .find(|(_, line)| !line.trim().is_empty())
    else {
        return Err(Error::render("graphviz", "empty graph description"));
    };
    let column = line.len() - line.trim_start().len();

    let mut words = line.split_whitespace().map(str::to_lowercase);
    let mut keyword = words.next();
    if keyword.as_deref() == Some("strict") {
        keyword = words.next();
    }
    let keyword = keyword.unwrap_or_default();
    let keyword = keyword.split('{').next().unwrap_or_default();
    if keyword != "graph" && keyword != "digraph" {
        return Err(Error::located(
            "graphviz",
            "expected `graph` or `digraph`",
            line_index + 1,
            column,
        ));
    }
    if !dot.contains('{') {
        return Err(Error::render("graphviz", "graph body is missing"));
    }
    check_braces("graphviz", dot, true)
}

#[async_trait]
impl Renderer<str> for GraphvizRenderer {
    fn type_name(&self) -> &str {
        "graphviz"
    }

    fn family(&self) -> RendererFamily {
        RendererFamily::Application
    }

    async fn render_into(
        &self,
        ocx: &OutputContext,
        dot: &str,
        options: &RenderOptions,
    ) -> Result<Surface, Error> {
        validate(dot)?;
        let parent = ocx.create_child(SurfaceSpec::default().attr(ATTR_SOURCE_MEDIA_TYPE, self.media_type()))?;
        let mut graph = SurfaceSpec::new("graphviz").attr("data-layout", "dot");
        graph.style = options.style.clone();
        parent.create_child(graph).set_text(dot);
        Ok(parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Location;

    #[test]
    fn accepts_graphs_and_digraphs() {
        assert!(validate("digraph G { a -> b }").is_ok());
        assert!(validate("\n  strict graph {\n a -- b\n}\n").is_ok());
        assert!(validate("graph{a}").is_ok());
    }

    #[test]
    fn rejects_bad_header_with_location() {
        match validate("\n   tree { a }") {
            Err(Error::Render { location, .. }) => {
                assert_eq!(location, Some(Location { line: 2, column: 3 }))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(validate("digraph { a -> b").is_err());
        assert!(validate("   ").is_err());
    }
}
