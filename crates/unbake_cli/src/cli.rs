use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum, builder::{Styles, styling::{AnsiColor, Effects}}, crate_description, crate_name, crate_version};
use clap_complete::Shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormatCli {
    Raw,
    Translated,
    Decompiled,
    Serialized,
}

#[derive(Parser)]
#[command(name = crate_name!(),
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default() | Effects::BOLD | Effects::UNDERLINE)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<TopLevel>,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Decompiles a bytecode cache disassembly
    Decompile {
        #[command(subcommand)]
        command: DecompileCommand,
    },
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum DecompileCommand {
    /// Decompiles a textual disassembly listing (run the engine's
    /// disassembler on the cache first)
    File {
        /// Path to the disassembly listing, or to a snapshot with
        /// --serialized
        path: PathBuf,

        /// Output file; stdout when omitted
        #[arg(long, short)]
        out: Option<PathBuf>,

        /// The input is a snapshot of an already processed collection
        #[arg(long, default_value_t = false)]
        serialized: bool,

        /// Export format(s); multiple can be combined
        #[arg(long, value_enum, num_args = 1.., default_values_t = vec![ExportFormatCli::Decompiled])]
        emit: Vec<ExportFormatCli>,

        /// Leave outer-scope slot references unresolved
        #[arg(long, default_value_t = false)]
        keep_outer_slots: bool,
    },
}
