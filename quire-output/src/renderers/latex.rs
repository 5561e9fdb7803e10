use super::check_braces;
use crate::context::{ATTR_SOURCE_MEDIA_TYPE, OutputContext};
use crate::error::Error;
use crate::options::{GlobalState, RenderOptions};
use crate::renderer::{Renderer, RendererFamily};
use crate::surface::{Surface, SurfaceSpec};
use async_trait::async_trait;
use serde_json::{Map, Value};

const STATE_NAMESPACE: &str = "latex";
const MACROS_KEY: &str = "macros";
const MAX_EXPANSION_PASSES: usize = 8;

/// TeX math.
///
/// `\gdef` and `\def` definitions are removed from the source and stored in
/// the global state, so macros defined in one cell apply to later cells of
/// the same batch. Typesetting happens on the viewing side; this strategy
/// emits the expanded source in a `math` element.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatexRenderer;

/// `\def\name{body}` found at `start..end` of the source.
#[derive(Debug, PartialEq, Eq)]
struct Definition {
    name: String,
    body: String,
    end: usize,
}

fn take_definition(source: &str, start: usize) -> Option<Definition> {
    let rest = &source[start..];
    let after_keyword = ["\\gdef", "\\def"]
        .iter()
        .find_map(|keyword| rest.strip_prefix(keyword))?;
    let after_keyword = after_keyword.trim_start();
    let after_slash = after_keyword.strip_prefix('\\')?;
    let name_len = after_slash
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(after_slash.len());
    if name_len == 0 {
        return None;
    }
    let name = &after_slash[..name_len];
    let after_name = after_slash[name_len..].trim_start();
    let body_source = after_name.strip_prefix('{')?;

    let mut depth = 1usize;
    let mut escaped = false;
    for (offset, c) in body_source.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let consumed = source.len() - body_source.len() + offset + 1;
                    return Some(Definition {
                        name: format!("\\{}", name),
                        body: body_source[..offset].to_string(),
                        end: consumed,
                    });
                }
            }
            _ => {}
        }
    }
    None
}

/// Split `source` into the definitions it contains and the remaining text.
fn extract_definitions(source: &str) -> (Vec<(String, String)>, String) {
    let mut definitions = Vec::new();
    let mut remaining = String::with_capacity(source.len());
    let mut index = 0;
    while index < source.len() {
        if source[index..].starts_with('\\') {
            if let Some(definition) = take_definition(source, index) {
                definitions.push((definition.name, definition.body));
                index = definition.end;
                continue;
            }
        }
        let Some(c) = source[index..].chars().next() else {
            break;
        };
        remaining.push(c);
        index += c.len_utf8();
    }
    (definitions, remaining.trim().to_string())
}

fn expand_macros(text: &str, macros: &Map<String, Value>) -> String {
    if macros.is_empty() {
        return text.to_string();
    }
    let mut expanded = text.to_string();
    for _ in 0..MAX_EXPANSION_PASSES {
        let mut changed = false;
        let mut output = String::with_capacity(expanded.len());
        let mut rest = expanded.as_str();
        while let Some(position) = rest.find('\\') {
            output.push_str(&rest[..position]);
            let command = &rest[position..];
            let name_len = command[1..]
                .find(|c: char| !c.is_ascii_alphabetic())
                .map_or(command.len(), |n| n + 1);
            let name = &command[..name_len.max(1)];
            match macros.get(name).and_then(Value::as_str) {
                Some(body) if name_len > 1 => {
                    output.push_str(body);
                    changed = true;
                }
                _ => output.push_str(name),
            }
            rest = &command[name.len()..];
            if name.len() == 1 {
                if let Some(c) = rest.chars().next() {
                    output.push(c);
                    rest = &rest[c.len_utf8()..];
                }
            }
        }
        output.push_str(rest);
        expanded = output;
        if !changed {
            break;
        }
    }
    expanded
}

#[async_trait]
impl Renderer<str> for LatexRenderer {
    fn type_name(&self) -> &str {
        "latex"
    }

    fn family(&self) -> RendererFamily {
        RendererFamily::Text
    }

    async fn render_into(
        &self,
        ocx: &OutputContext,
        source: &str,
        options: &RenderOptions,
    ) -> Result<Surface, Error> {
        check_braces(self.type_name(), source, false)?;

        let global_state: GlobalState = options
            .global_state
            .clone()
            .unwrap_or_else(|| ocx.session().global_state());
        let (definitions, text) = extract_definitions(source);
        let macros = global_state.with_namespace(STATE_NAMESPACE, |namespace| {
            let macros = namespace
                .entry(MACROS_KEY.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !macros.is_object() {
                *macros = Value::Object(Map::new());
            }
            let Value::Object(macros) = macros else {
                return Map::new();
            };
            for (name, body) in definitions {
                macros.insert(name, Value::String(body));
            }
            macros.clone()
        });
        let expanded = expand_macros(&text, &macros);

        let surface = ocx.surface_for_options(options, true)?;
        surface.add_class("latex");
        surface.set_attr(ATTR_SOURCE_MEDIA_TYPE, self.media_type());
        if !options.inline && ocx.session().settings().flush_left {
            surface.update_style([("text-align", Some("left".to_string()))]);
        }
        let display = if options.inline { "inline" } else { "block" };
        surface
            .create_child(SurfaceSpec::new("math").attr("display", display))
            .set_text(&expanded);
        Ok(surface)
    }
}
