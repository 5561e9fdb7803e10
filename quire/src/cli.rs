use crate::log::{Level, LogFormat};
use clap::{Parser, Subcommand, crate_version};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "quire",
    color = clap::ColorChoice::Auto,
    about = format!("quire {}: evaluate notebook documents cell by cell", crate_version!())
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global_options: GlobalOptions,
}

#[derive(Clone, Debug, Parser)]
pub struct GlobalOptions {
    #[arg(
        long,
        global = true,
        help = "Minimum level of logs written to stderr.",
        default_value_t,
        value_enum
    )]
    pub log_level: Level,

    #[arg(
        long,
        global = true,
        help = "Configure the output format of the logs.",
        default_value_t,
        value_enum
    )]
    pub log_format: LogFormat,

    #[arg(
        short,
        long,
        global = true,
        env = "QUIRE_SETTINGS",
        help = "Path to a YAML settings file."
    )]
    pub settings: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    #[command(about = "Evaluate a document and print each cell's output as HTML.")]
    Eval {
        #[arg(help = "Path to the document snapshot (JSON).")]
        document: PathBuf,

        #[arg(long, help = "Only evaluate the cells above this cell id.")]
        before: Option<String>,
    },
    #[command(about = "List the cells of a document.")]
    Cells {
        #[arg(help = "Path to the document snapshot (JSON).")]
        document: PathBuf,
    },
}
