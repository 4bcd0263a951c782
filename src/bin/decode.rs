//! Decode a binary file with a schema and print the decoded tree.
//!
//! Usage:
//!   binschema-decode [OPTIONS] SCHEMA FILE
//!
//! Options:
//!   --continue, -c   Record failures as error nodes and keep decoding
//!   --root=NAME      Start from struct NAME instead of the schema root
//!   --offset=N       Skip the first N bytes of FILE
//!   --quiet, -q      Print only errors
//!
//! Exits with status 1 when decoding failed or recovered from any error.
//! Set RUST_LOG (e.g. `RUST_LOG=binschema=debug`) for decoder tracing.

use anyhow::{bail, Context};
use binschema::dump::{format_errors, format_tree};
use binschema::{load_file, Decoder, ErrorMode};

fn take_flag(args: &mut Vec<String>, long: &str, short: &str) -> bool {
    if let Some(pos) = args.iter().position(|a| a == long || a == short) {
        args.remove(pos);
        true
    } else {
        false
    }
}

fn take_value(args: &mut Vec<String>, prefix: &str) -> Option<String> {
    let pos = args.iter().position(|a| a.starts_with(prefix))?;
    let arg = args.remove(pos);
    Some(arg[prefix.len()..].to_string())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mode = if take_flag(&mut args, "--continue", "-c") {
        ErrorMode::Continue
    } else {
        ErrorMode::Stop
    };
    let quiet = take_flag(&mut args, "--quiet", "-q");
    let root = take_value(&mut args, "--root=");
    let offset: usize = match take_value(&mut args, "--offset=") {
        Some(s) => s.parse().with_context(|| format!("bad --offset value '{}'", s))?,
        None => 0,
    };
    if args.len() != 2 {
        bail!("usage: binschema-decode [--continue] [--root=NAME] [--offset=N] [--quiet] SCHEMA FILE");
    }

    let schema = load_file(&args[0]).with_context(|| format!("loading schema {}", args[0]))?;
    let data = std::fs::read(&args[1]).with_context(|| format!("reading {}", args[1]))?;
    if offset > data.len() {
        bail!("--offset={} is past the end of {} ({} bytes)", offset, args[1], data.len());
    }
    let root = root.unwrap_or_else(|| schema.schema.root.clone());
    if schema.get_struct(&root).is_none() {
        bail!("unknown root struct '{}'", root);
    }

    match Decoder::new(&schema, mode).run(&data[offset..], &root) {
        Ok((tree, errors)) => {
            if !quiet {
                println!("{}", format_tree(&tree));
            }
            if !errors.is_empty() {
                eprintln!("{}", format_errors(&errors));
                eprintln!("decode: {} error(s)", errors.len());
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{}", format_errors(std::slice::from_ref(&e)));
            std::process::exit(1);
        }
    }
    Ok(())
}
