use clap::{CommandFactory, Parser};

use crate::cli::{Cli, DecompileCommand, ExportFormatCli, TopLevel};

mod cli;

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(TopLevel::Decompile { command }) => match command {
            DecompileCommand::File { path, out, serialized, emit, keep_outer_slots } => {
                let options =
                    unbake_lib::DecompileOptions { resolve_scopes: !keep_outer_slots };
                // progress chatter only when stdout is not the export sink
                let verbose = out.is_some();

                let col = if serialized {
                    match std::fs::read(&path) {
                        Ok(bytes) => match unbake_lib::load_snapshot(&bytes) {
                            Ok(col) => {
                                if verbose {
                                    println!(
                                        "Reading from serialized, already processed input: {}",
                                        path.display()
                                    );
                                }
                                col
                            }
                            Err(e) => {
                                eprintln!("snapshot error: {e}");
                                std::process::exit(1);
                            }
                        },
                        Err(e) => {
                            eprintln!("failed to read {path:?}: {e}");
                            std::process::exit(1);
                        }
                    }
                } else {
                    match std::fs::read_to_string(&path) {
                        Ok(text) => match unbake_lib::decompile_listing(&text, options) {
                            Ok(col) => {
                                if verbose {
                                    println!("Decompiling {} functions.", col.len());
                                }
                                col
                            }
                            Err(e) => {
                                eprintln!("decompile error: {e}");
                                std::process::exit(1);
                            }
                        },
                        Err(e) => {
                            eprintln!("failed to read {path:?}: {e}");
                            std::process::exit(1);
                        }
                    }
                };

                let wants_snapshot = emit.contains(&ExportFormatCli::Serialized);
                let kinds: Vec<unbake_lib::ExportKind> = emit
                    .iter()
                    .filter_map(|f| match f {
                        ExportFormatCli::Raw => Some(unbake_lib::ExportKind::Raw),
                        ExportFormatCli::Translated => Some(unbake_lib::ExportKind::Translated),
                        ExportFormatCli::Decompiled => Some(unbake_lib::ExportKind::Decompiled),
                        ExportFormatCli::Serialized => None,
                    })
                    .collect();

                if wants_snapshot {
                    let Some(out) = out.as_ref() else {
                        eprintln!("--emit serialized requires --out");
                        std::process::exit(1);
                    };
                    let snap_path = if kinds.is_empty() {
                        out.clone()
                    } else {
                        let mut p = out.clone().into_os_string();
                        p.push(".snap");
                        std::path::PathBuf::from(p)
                    };
                    match unbake_lib::save_snapshot(&col) {
                        Ok(bytes) => {
                            println!("Serializing to file: {}", snap_path.display());
                            if let Err(e) = std::fs::write(&snap_path, bytes) {
                                eprintln!("failed to write {snap_path:?}: {e}");
                                std::process::exit(1);
                            }
                        }
                        Err(e) => {
                            eprintln!("snapshot error: {e}");
                            std::process::exit(1);
                        }
                    }
                    if kinds.is_empty() {
                        println!("Done.");
                        return;
                    }
                }

                let text = unbake_lib::export_collection(&col, &kinds);
                match out {
                    Some(out) => {
                        println!("Exporting to file: {}", out.display());
                        if let Err(e) = std::fs::write(&out, text) {
                            eprintln!("failed to write {out:?}: {e}");
                            std::process::exit(1);
                        }
                        println!("Done.");
                    }
                    None => {
                        print!("{text}");
                    }
                }
            }
        },
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            Cli::command().print_help().unwrap();
        }
    }
}
