use anyhow::Context;
use clap::{crate_version, Arg, ArgAction, Command};

use std::fs;
use std::io;

fn main() -> anyhow::Result<()> {
    let args = Command::new("compile")
        .version(crate_version!())
        .about("Compila un subconjunto de Pascal a NASM x86 de 32 bits")
        .arg(
            Arg::new("debug")
                .short('d')
                .action(ArgAction::SetTrue)
                .help("Emit AST and symbol table dumps as assembly comments"),
        )
        .arg(
            Arg::new("file")
                .required(true)
                .value_name("FILE")
                .help("Pascal source file"),
        )
        .get_matches();

    let path = args.get_one::<String>("file").unwrap();
    let debug = args.get_flag("debug");

    let source = fs::read_to_string(path)
        .with_context(|| format!("Failed to read source file: {}", path))?;

    let stdout = io::stdout();
    let diagnostics = pascual::compile(&source, path, debug, stdout.lock())
        .context("Failed to emit assembly")?;

    if !diagnostics.is_empty() {
        eprint!("{}", diagnostics);
    }

    Ok(())
}
