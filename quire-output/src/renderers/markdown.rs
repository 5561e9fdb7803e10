use crate::context::{ATTR_SOURCE_MEDIA_TYPE, OutputContext};
use crate::error::Error;
use crate::options::{GlobalState, RenderOptions};
use crate::renderer::{Renderer, RendererFamily};
use crate::surface::{Surface, SurfaceSpec};
use async_trait::async_trait;
use comrak::nodes::NodeValue;
use comrak::{Arena, Options, format_html, parse_document};
use tracing::debug;

const DEFAULT_CODE_TYPE: &str = "script";

/// CommonMark with executable fenced blocks.
///
/// A fenced block whose info string starts with `!` is rendered by the
/// strategy registered for its language (default `script`) instead of being
/// shown as code; `$` additionally shows the source above the output.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownRenderer;

#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Html(String),
    Code {
        type_name: String,
        code: String,
        show_source: bool,
        line: usize,
    },
}

#[derive(Debug, PartialEq, Eq)]
struct ExecFlags {
    type_name: String,
    show_source: bool,
}

fn exec_flags(info: &str) -> Option<ExecFlags> {
    let info = info.trim_start();
    let flags_len = info
        .find(|c: char| c != '!' && c != '$' && !c.is_whitespace())
        .unwrap_or(info.len());
    let flags = &info[..flags_len];
    if !flags.contains(['!', '$']) {
        return None;
    }
    let type_name = info[flags_len..]
        .split_whitespace()
        .next()
        .unwrap_or(DEFAULT_CODE_TYPE);
    Some(ExecFlags {
        type_name: type_name.to_string(),
        show_source: flags.contains('$'),
    })
}

fn comrak_options() -> Options<'static> {
    let mut options = Options::default();
    options.extension.math_dollars = true;
    options.extension.strikethrough = true;
    options.extension.table = true;
    options.render.sourcepos = false;
    options
}

/// Parse `text` into runs of HTML separated by executable blocks.
fn segments(text: &str) -> Result<Vec<Segment>, Error> {
    let arena = Arena::new();
    let options = comrak_options();
    let root = parse_document(&arena, text, &options);

    let mut segments = Vec::new();
    let mut html = Vec::new();
    for node in root.children() {
        let exec = {
            let data = node.data.borrow();
            match &data.value {
                NodeValue::CodeBlock(block) if block.fenced => exec_flags(&block.info).map(|flags| {
                    (flags, block.literal.clone(), data.sourcepos.start.line)
                }),
                _ => None,
            }
        };
        match exec {
            Some((flags, code, line)) => {
                if !html.is_empty() {
                    segments.push(Segment::Html(String::from_utf8_lossy(&html).into_owned()));
                    html.clear();
                }
                segments.push(Segment::Code {
                    type_name: flags.type_name,
                    code,
                    show_source: flags.show_source,
                    line,
                });
            }
            None => format_html(node, &options, &mut html)
                .map_err(|error| Error::render("markdown", error.to_string()))?,
        }
    }
    if !html.is_empty() {
        segments.push(Segment::Html(String::from_utf8_lossy(&html).into_owned()));
    }
    Ok(segments)
}

struct Deferred {
    surface: Surface,
    type_name: String,
    text: String,
}

#[async_trait]
impl Renderer<str> for MarkdownRenderer {
    fn type_name(&self) -> &str {
        "markdown"
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
        let segments = segments(text)?;

        let parent = ocx.surface_for_options(options, true)?;
        parent.add_class("markdown");
        parent.set_attr(ATTR_SOURCE_MEDIA_TYPE, self.media_type());

        let mut deferred = Vec::new();
        for segment in segments {
            match segment {
                Segment::Html(html) => parent.append_markup(&html),
                Segment::Code {
                    type_name,
                    code,
                    show_source,
                    line,
                } => {
                    if show_source {
                        deferred.push(Deferred {
                            surface: parent.create_child(SurfaceSpec::default().class("code-source")),
                            type_name: "markdown".to_string(),
                            text: format!("```{}\n{}```\n", type_name, code),
                        });
                    }
                    deferred.push(Deferred {
                        surface: parent.create_child(
                            SurfaceSpec::default()
                                .class("code-output")
                                .attr("data-source-line", line.to_string()),
                        ),
                        type_name,
                        text: code,
                    });
                }
            }
        }

        let global_state: GlobalState = options
            .global_state
            .clone()
            .unwrap_or_else(|| ocx.session().global_state());
        for block in deferred {
            let sub_ocx = ocx.create_new_ocx(block.surface, Some(ocx))?;
            let block_options = RenderOptions {
                inline: options.inline,
                global_state: Some(global_state.clone()),
                ..RenderOptions::default()
            };
            match sub_ocx.render(&block.type_name, &block.text, &block_options).await {
                Ok(_) => {
                    if !sub_ocx.keepalive() {
                        sub_ocx.stop();
                    }
                }
                Err(error) => {
                    debug!(context = sub_ocx.id(), renderer = %block.type_name, "embedded block failed");
                    sub_ocx.set_keepalive(false);
                    sub_ocx.stop();
                    return Err(error);
                }
            }
        }

        ocx.abort_if_stopped()?;
        Ok(parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_exec_flags() {
        assert_eq!(exec_flags("rust"), None);
        assert_eq!(
            exec_flags("!"),
            Some(ExecFlags {
                type_name: "script".into(),
                show_source: false
            })
        );
        assert_eq!(
            exec_flags("$ ! latex extra"),
            Some(ExecFlags {
                type_name: "latex".into(),
                show_source: true
            })
        );
    }

    #[test]
    fn splits_html_around_exec_blocks() {
        let text = "# Title\n\n```!\nprint hi\n```\n\nafter\n";
        let segments = segments(text).unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Html("<h1>Title</h1>\n".into()),
                Segment::Code {
                    type_name: "script".into(),
                    code: "print hi\n".into(),
                    show_source: false,
                    line: 3,
                },
                Segment::Html("<p>after</p>\n".into()),
            ]
        );
    }

    #[tokio::test]
    async fn executes_blocks_into_placeholders() {
        let session = Session::default();
        let ocx = OutputContext::root(&session, Surface::root("div"));
        let surface = ocx
            .markdown("Intro\n\n```$ script\nprint 42\n```\n", &RenderOptions::default())
            .await
            .unwrap();
        let children = surface.children();
        assert_eq!(children.len(), 2);
        assert!(children[0].has_class("code-source"));
        assert!(children[0].to_html().contains("<code class=\"language-script\">print 42\n</code>"));
        assert!(children[1].has_class("code-output"));
        assert_eq!(children[1].text_content(), "42");
        assert!(ocx.activity().children().is_empty());
        assert!(!ocx.is_stopped());
    }

    #[tokio::test]
    async fn failing_block_propagates() {
        let session = Session::default();
        let ocx = OutputContext::root(&session, Surface::root("div"));
        let err = ocx
            .markdown("```!\nfail broken\n```\n\n```!\nprint never\n```\n", &RenderOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "script: broken (line 1, column 0)");
        assert!(ocx.is_stopped());
        assert!(!ocx.surface().text_content().contains("never"));
    }
}
