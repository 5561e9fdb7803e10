use crate::context::{ATTR_SOURCE_MEDIA_TYPE, OutputContext};
use crate::error::Error;
use crate::options::{GlobalState, RenderOptions};
use crate::renderer::{Renderer, RendererFamily};
use crate::surface::{Surface, SurfaceSpec};
use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

const STATE_NAMESPACE: &str = "script";

/// The executable-code strategy: a small line-oriented command language.
///
/// ```text
/// # comment
/// print <text>          println <text>
/// tty <text>            ttyln <text>
/// markdown <text>       latex <text>
/// render <type> <text>  rule
/// sleep <ms>            spin <iterations>
/// set <key> <json>      get <key>
/// keepalive [on|off]    bg <ms> <text>
/// end-bg [aggressive]   fail <message>
/// ```
///
/// `\n` in text arguments is a newline. Global state lives in the `script`
/// namespace, so values set by one cell are visible to later cells of the
/// same batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptRenderer;

/// One parsed source line: the command word and its argument text, with the
/// 0-based columns at which they start.
struct Line<'a> {
    number: usize,
    command: &'a str,
    command_column: usize,
    args: &'a str,
    args_column: usize,
}

impl<'a> Line<'a> {
    fn parse(number: usize, line: &'a str) -> Option<Self> {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        let command_column = line.len() - trimmed.len();
        let command_len = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        let rest = &trimmed[command_len..];
        let args = rest.trim_start();
        Some(Self {
            number,
            command: &trimmed[..command_len],
            command_column,
            args: args.trim_end(),
            args_column: command_column + command_len + (rest.len() - args.len()),
        })
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::located("script", message, self.number, self.command_column)
    }

    fn args_error(&self, message: impl Into<String>) -> Error {
        Error::located("script", message, self.number, self.args_column)
    }

    fn number_arg(&self, text: &str) -> Result<u64, Error> {
        text.parse()
            .map_err(|_| self.args_error(format!("{}: expected a number, got {:?}", self.command, text)))
    }

    fn split_args(&self) -> (&'a str, &'a str) {
        match self.args.split_once(char::is_whitespace) {
            Some((first, rest)) => (first, rest.trim_start()),
            None => (self.args, ""),
        }
    }
}

fn unescape(text: &str) -> String {
    text.replace("\\n", "\n")
}

async fn run_line(
    ocx: &OutputContext,
    line: &Line<'_>,
    global_state: &GlobalState,
) -> Result<(), Error> {
    let plain = RenderOptions::default();
    let text = unescape(line.args);
    trace!(context = ocx.id(), line = line.number, command = line.command, "script command");
    match line.command {
        "print" => ocx.print(&text, &plain).await.map(drop),
        "println" => ocx.println(&text, &plain).await.map(drop),
        "tty" => ocx.tty(&text, &plain).await.map(drop),
        "ttyln" => ocx.ttyln(&text, &plain).await.map(drop),
        "markdown" => ocx
            .markdown(&text, &plain.with_global_state(global_state.clone()))
            .await
            .map(drop),
        "latex" => ocx
            .latex(&text, &plain.with_global_state(global_state.clone()))
            .await
            .map(drop),
        "render" => {
            let (type_name, body) = line.split_args();
            if type_name.is_empty() {
                return Err(line.args_error("render: missing renderer type"));
            }
            ocx.render(
                type_name,
                &unescape(body),
                &plain.with_global_state(global_state.clone()),
            )
            .await
            .map(drop)
        }
        "rule" => ocx.print_rule(&plain).await.map(drop),
        "sleep" => ocx.delay(line.number_arg(line.args)?).await,
        "spin" => {
            let iterations = line.number_arg(line.args)?;
            let mut tick = ocx.check_tick(None)?;
            for _ in 0..iterations {
                tick.check().await?;
            }
            Ok(())
        }
        "set" => {
            let (key, value) = line.split_args();
            if key.is_empty() {
                return Err(line.args_error("set: missing key"));
            }
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(unescape(value)));
            ocx.abort_if_stopped()?;
            global_state.set(STATE_NAMESPACE, key, value);
            Ok(())
        }
        "get" => {
            if line.args.is_empty() {
                return Err(line.args_error("get: missing key"));
            }
            let value = global_state
                .get(STATE_NAMESPACE, line.args)
                .unwrap_or(Value::Null);
            ocx.render_value(&value, &plain).await.map(drop)
        }
        "keepalive" => {
            let keepalive = match line.args {
                "" | "on" => true,
                "off" => false,
                other => {
                    return Err(line.args_error(format!(
                        "keepalive: expected `on` or `off`, got {:?}",
                        other
                    )));
                }
            };
            ocx.abort_if_stopped()?;
            ocx.set_keepalive(keepalive);
            Ok(())
        }
        "bg" => {
            let (delay, body) = line.split_args();
            let delay = line.number_arg(delay)?;
            let body = unescape(body);
            ocx.abort_if_stopped()?;
            let bg_ocx = ocx.clone();
            ocx.background(async move {
                bg_ocx.delay(delay).await?;
                bg_ocx.println(&body, &RenderOptions::default()).await?;
                Ok(())
            });
            Ok(())
        }
        "end-bg" => {
            let aggressive = match line.args {
                "" => false,
                "aggressive" => true,
                other => {
                    return Err(line.args_error(format!("end-bg: unexpected argument {:?}", other)));
                }
            };
            ocx.end_background(aggressive);
            Ok(())
        }
        "fail" => Err(line.error(if text.is_empty() { "failed".to_string() } else { text })),
        other => Err(line.error(format!("unknown command {:?}", other))),
    }
}

#[async_trait]
impl Renderer<str> for ScriptRenderer {
    fn type_name(&self) -> &str {
        "script"
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
        let global_state = options
            .global_state
            .clone()
            .unwrap_or_else(|| ocx.session().global_state());

        let eval_ocx = if !options.style.is_empty() || !options.inline {
            let mut spec = SurfaceSpec::new(if options.inline { "span" } else { "div" })
                .attr(ATTR_SOURCE_MEDIA_TYPE, self.media_type());
            spec.style = options.style.clone();
            spec.classes = options.class.clone();
            ocx.create_child_ocx(spec)?
        } else {
            ocx.clone()
        };

        for (index, text) in source.lines().enumerate() {
            let Some(line) = Line::parse(index + 1, text) else {
                continue;
            };
            eval_ocx.abort_if_stopped()?;
            run_line(&eval_ocx, &line, &global_state).await?;
        }

        Ok(eval_ocx.surface().clone())
    }
}
