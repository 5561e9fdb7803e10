//! The renderer strategy interface and the invocation contract shared by
//! every strategy.
//!
//! Strategies implement [`Renderer::render_into`]. Cancellation is
//! cooperative: an implementation must call
//! [`OutputContext::abort_if_stopped`] (or use the context's checked helpers
//! such as [`OutputContext::sleep`] and [`OutputContext::check_tick`]) at
//! every safe resumption point of long-running work. Work that never checks
//! may run to completion after a stop, but [`invoke`] will not accept its
//! output.

use crate::context::OutputContext;
use crate::error::Error;
use crate::options::RenderOptions;
use crate::surface::Surface;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use tracing::{debug, error};

/// Media type family of a renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RendererFamily {
    /// Renders source text: `text/<type>`.
    Text,
    /// Renders structured application values: `application/<type>`.
    Application,
}

#[async_trait]
pub trait Renderer<V: ?Sized + Sync>: Send + Sync {
    /// The tag this strategy is registered and looked up under.
    fn type_name(&self) -> &str;

    fn family(&self) -> RendererFamily;

    fn media_type(&self) -> String {
        format!("{}/{}", self.family(), self.type_name())
    }

    /// Produce output for `value` inside `ocx` and return the rendered surface.
    ///
    /// Called only through [`invoke`], which owns the cancellation re-check,
    /// stop-on-error and completion-event bookkeeping.
    async fn render_into(
        &self,
        ocx: &OutputContext,
        value: &V,
        options: &RenderOptions,
    ) -> Result<Surface, Error>;
}

/// Identity of the renderer that handled an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RendererInfo {
    #[serde(rename = "type")]
    pub type_name: String,
    pub media_type: String,
}

impl RendererInfo {
    pub fn of<V, R>(renderer: &R) -> Self
    where
        V: ?Sized + Sync,
        R: Renderer<V> + ?Sized,
    {
        Self {
            type_name: renderer.type_name().to_string(),
            media_type: renderer.media_type(),
        }
    }
}

/// Event dispatched on [`OutputContext::render_completions`] once per invocation.
#[derive(Clone)]
pub struct RenderCompletion {
    pub context: OutputContext,
    pub renderer: RendererInfo,
    pub value: serde_json::Value,
    pub options: RenderOptions,
    /// Whether the invocation succeeded.
    pub succeeded: bool,
}

impl fmt::Debug for RenderCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderCompletion")
            .field("context", &self.context.id())
            .field("renderer", &self.renderer)
            .field("succeeded", &self.succeeded)
            .finish()
    }
}

/// What [`invoke`] does with the context once the invocation has settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// Top-level invocations: stop the context unless it has keepalive set.
    StopUnlessKeepalive,
    /// In-context helpers: the enclosing invocation settles the context.
    Leave,
}

/// Run `renderer` against `ocx` under the invocation contract:
///
/// 1. run the strategy;
/// 2. on success, re-check cancellation so a context stopped mid-render turns
///    the success into [`Error::is_stopped`] failure;
/// 3. on failure, stop the context (a panic while stopping is logged, not
///    propagated) and return the original error;
/// 4. dispatch exactly one [`RenderCompletion`];
/// 5. with [`Settle::StopUnlessKeepalive`], stop the context unless keepalive
///    is set.
pub async fn invoke<V, R>(
    renderer: &R,
    ocx: &OutputContext,
    value: &V,
    options: &RenderOptions,
    settle: Settle,
) -> Result<Surface, Error>
where
    V: ?Sized + Serialize + Sync,
    R: Renderer<V> + ?Sized,
{
    let info = RendererInfo::of::<V, R>(renderer);

    let result = match renderer.render_into(ocx, value, options).await {
        Ok(surface) => ocx.abort_if_stopped().map(|()| surface),
        Err(error) => Err(error),
    };

    if let Err(error) = &result {
        debug!(
            context = ocx.id(),
            renderer = %info.type_name,
            stopped = error.is_stopped(),
            "render failed: {}",
            error
        );
        if !ocx.activity().stop_best_effort() {
            error!(
                context = ocx.id(),
                "ignored second-level error while stopping output context after render error"
            );
        }
    }

    let value = serde_json::to_value(value)
        .unwrap_or_else(|error| serde_json::Value::String(format!("<unserializable: {}>", error)));
    ocx.render_completions().dispatch(&RenderCompletion {
        context: ocx.clone(),
        renderer: info,
        value,
        options: options.clone(),
        succeeded: result.is_ok(),
    });

    if settle == Settle::StopUnlessKeepalive && !ocx.keepalive() {
        ocx.stop();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::surface::SurfaceSpec;
    use pretty_assertions::assert_eq;
    use quire_activity::{CancellationAction, StopState, SubscribeOptions};
    use std::sync::{Arc, Mutex};

    /// `fail` fails, `stop` stops its own context mid-render, `keep` sets
    /// keepalive, anything else succeeds.
    struct Scripted;

    #[async_trait]
    impl Renderer<str> for Scripted {
        fn type_name(&self) -> &str {
            "scripted"
        }

        fn family(&self) -> RendererFamily {
            RendererFamily::Text
        }

        async fn render_into(
            &self,
            ocx: &OutputContext,
            value: &str,
            _options: &RenderOptions,
        ) -> Result<Surface, Error> {
            let surface = ocx.create_child(SurfaceSpec::new("span"))?;
            match value {
                "fail" => Err(Error::render("scripted", "failed")),
                "stop" => {
                    ocx.stop();
                    Ok(surface)
                }
                "keep" => {
                    ocx.set_keepalive(true);
                    Ok(surface)
                }
                _ => Ok(surface),
            }
        }
    }

    fn context_with_log() -> (OutputContext, Arc<Mutex<Vec<(String, bool)>>>) {
        let ocx = OutputContext::root(&Session::default(), Surface::root("div"));
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        ocx.render_completions()
            .subscribe(
                move |completion: &RenderCompletion| {
                    sink.lock().unwrap().push((
                        completion.value.as_str().unwrap_or_default().to_string(),
                        completion.succeeded,
                    ))
                },
                SubscribeOptions::default(),
            )
            .unwrap();
        (ocx, log)
    }

    #[tokio::test]
    async fn failure_stops_context_and_completes_once() {
        let (ocx, log) = context_with_log();
        let err = invoke(&Scripted, &ocx, "fail", &RenderOptions::default(), Settle::Leave)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "scripted: failed");
        assert!(ocx.is_stopped());
        assert_eq!(*log.lock().unwrap(), vec![("fail".to_string(), false)]);
    }

    #[tokio::test]
    async fn failing_stop_handlers_still_complete_with_original_error() {
        let (ocx, log) = context_with_log();
        let _listener =
            CancellationAction::new(Some(&ocx.activity().signal()), || panic!("listener failure"))
                .unwrap();
        ocx.activity()
            .stop_states()
            .subscribe(|_: &StopState| panic!("observer failure"), SubscribeOptions::once())
            .unwrap();
        let child = ocx.create_child_ocx(SurfaceSpec::default()).unwrap();
        child
            .activity()
            .stop_states()
            .subscribe(|_: &StopState| panic!("child failure"), SubscribeOptions::once())
            .unwrap();

        let err = invoke(&Scripted, &ocx, "fail", &RenderOptions::default(), Settle::Leave)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "scripted: failed");
        assert!(ocx.is_stopped());
        assert!(child.is_stopped());
        assert_eq!(*log.lock().unwrap(), vec![("fail".to_string(), false)]);
    }

    #[tokio::test]
    async fn stop_during_render_rejects_the_output() {
        let (ocx, log) = context_with_log();
        let err = invoke(&Scripted, &ocx, "stop", &RenderOptions::default(), Settle::Leave)
            .await
            .unwrap_err();
        assert!(err.is_stopped());
        assert_eq!(*log.lock().unwrap(), vec![("stop".to_string(), false)]);
    }

    #[tokio::test]
    async fn settle_respects_keepalive() {
        let (ocx, _) = context_with_log();
        invoke(&Scripted, &ocx, "ok", &RenderOptions::default(), Settle::Leave)
            .await
            .unwrap();
        assert!(!ocx.is_stopped());

        let kept = ocx.create_child_ocx(SurfaceSpec::default()).unwrap();
        invoke(&Scripted, &kept, "keep", &RenderOptions::default(), Settle::StopUnlessKeepalive)
            .await
            .unwrap();
        assert!(!kept.is_stopped());

        invoke(&Scripted, &ocx, "ok", &RenderOptions::default(), Settle::StopUnlessKeepalive)
            .await
            .unwrap();
        assert!(!ocx.is_stopped(), "keepalive propagated from the child");

        let (plain, log) = context_with_log();
        invoke(&Scripted, &plain, "ok", &RenderOptions::default(), Settle::StopUnlessKeepalive)
            .await
            .unwrap();
        assert!(plain.is_stopped());
        assert_eq!(*log.lock().unwrap(), vec![("ok".to_string(), true)]);
    }
}
