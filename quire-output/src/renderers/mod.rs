//! Built-in rendering strategies.
//!
//! Text strategies (`plain`, `markdown`, `latex`, `script`) are registered in
//! every session's [`RendererRegistry`](crate::RendererRegistry) and can be
//! looked up by type. Application strategies (`error`, `image-data`,
//! `graphviz`, `plotly`) are reached through the matching
//! [`OutputContext`](crate::OutputContext) methods.

mod chart;
pub(crate) mod error;
mod graphviz;
mod image_data;
mod latex;
mod markdown;
mod script;
mod text;

pub use chart::ChartRenderer;
pub use error::{ErrorRenderOptions, ErrorRenderer, ErrorReport};
pub use graphviz::GraphvizRenderer;
pub use image_data::{ImageData, ImageDataRenderer};
pub use latex::LatexRenderer;
pub use markdown::MarkdownRenderer;
pub use script::ScriptRenderer;
pub use text::TextRenderer;

use crate::error::Error;

/// Check that `{` and `}` balance, reporting the offending position.
///
/// Backslash escapes the next character. With `quoted_strings`, braces inside
/// double-quoted strings are ignored.
pub(crate) fn check_braces(renderer: &str, text: &str, quoted_strings: bool) -> Result<(), Error> {
    let mut open: Vec<(usize, usize)> = Vec::new();
    let mut escaped = false;
    let mut in_string = false;

    for (line_index, line) in text.lines().enumerate() {
        for (column, c) in line.chars().enumerate() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                '"' if quoted_strings => in_string = !in_string,
                _ if in_string => {}
                '{' => open.push((line_index + 1, column)),
                '}' => {
                    if open.pop().is_none() {
                        return Err(Error::located(
                            renderer,
                            "unexpected closing brace",
                            line_index + 1,
                            column,
                        ));
                    }
                }
                _ => {}
            }
        }
        escaped = false;
    }

    match open.last() {
        Some(&(line, column)) => Err(Error::located(renderer, "unclosed brace", line, column)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Location;

    fn location(result: Result<(), Error>) -> Option<Location> {
        match result {
            Err(Error::Render { location, .. }) => location,
            _ => None,
        }
    }

    #[test]
    fn reports_first_unmatched_brace() {
        assert!(check_braces("latex", "\\frac{a}{b}", false).is_ok());
        assert_eq!(
            location(check_braces("latex", "a}\n", false)),
            Some(Location { line: 1, column: 1 })
        );
        assert_eq!(
            location(check_braces("latex", "x\n  {{}", false)),
            Some(Location { line: 2, column: 2 })
        );
    }

    #[test]
    fn escapes_and_strings_are_skipped() {
        assert!(check_braces("latex", "\\{ not a group", false).is_ok());
        assert!(check_braces("graphviz", "digraph { a [label=\"}\"] }", true).is_ok());
    }
}
