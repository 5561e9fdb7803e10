use clap::Parser;
use miette::{Result, bail};
use quire_eval::{BatchOutcome, Document, Evaluator, Settings};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

mod cli;
mod log;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    log::init_tracing(cli.global_options.log_level, cli.global_options.log_format);

    let settings = match &cli.global_options.settings {
        Some(path) => Settings::load(path).await?,
        None => Settings::default(),
    };

    match cli.command {
        Commands::Cells { document } => {
            let document = Document::load(&document).await?;
            for cell in document.cells() {
                println!("{}\t{}", cell.id(), cell.kind());
            }
            Ok(())
        }
        Commands::Eval { document, before } => eval(&document, before.as_deref(), settings).await,
    }
}

async fn eval(path: &Path, before: Option<&str>, settings: Settings) -> Result<()> {
    let document = Document::load(path).await?;
    let evaluator = Evaluator::new(document, settings);

    let interrupt = tokio::spawn({
        let evaluator = evaluator.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, stopping evaluation");
                if let Err(error) = evaluator.perform_command("stop-all", None).await {
                    warn!("failed to stop evaluation: {}", error);
                }
            }
        }
    });

    let result = match before {
        Some(id) => evaluator.evaluate_before(id).await,
        None => evaluator.evaluate_all().await,
    };
    let outcome = match &result {
        Ok(completion) => completion.settled().await,
        Err(error) if error.is_stopped() => BatchOutcome::Stopped,
        Err(error) => BatchOutcome::Failed(error.to_string()),
    };

    // Cells that kept running in the background finish before output is printed.
    let idle = Arc::new(Notify::new());
    let wake = idle.clone();
    let subscription = evaluator.eval_states().subscribe(
        move |_: &quire_eval::EvalState| wake.notify_one(),
        Default::default(),
    )?;
    while evaluator.is_evaluating() {
        idle.notified().await;
    }
    subscription.unsubscribe();
    interrupt.abort();

    for cell in evaluator.document().cells() {
        println!("{}", cell.output().to_html());
    }

    match (result, outcome) {
        (Err(error), _) if !error.is_stopped() => Err(error.into()),
        (_, BatchOutcome::Succeeded) => Ok(()),
        (_, BatchOutcome::Stopped) => bail!("evaluation stopped"),
        (_, BatchOutcome::Failed(message)) => bail!("evaluation failed: {}", message),
    }
}
