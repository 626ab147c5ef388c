#![forbid(unsafe_code)]

use std::env;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use sendfs::{SendStream, SubvolumeSet};
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "parse" => {
            let Some(path) = args.next() else {
                bail!("parse requires a stream file (or - for stdin)");
            };
            parse(&path)
        }
        "receive" => {
            let paths: Vec<String> = args.collect();
            if paths.is_empty() {
                bail!("receive requires at least one stream file (or - for stdin)");
            }
            receive(&paths)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("sendfs\n");
    println!("USAGE:");
    println!("  sendfs parse <stream-file>");
    println!("  sendfs receive <stream-file>...");
    println!();
    println!("Pass - as a stream file to read from stdin.");
    println!("`receive` applies the streams in order and prints each");
    println!("reconstructed subvolume as JSON.");
}

fn open_stream(path: &str) -> Result<SendStream<Box<dyn Read>>> {
    let reader: Box<dyn Read> = if path == "-" {
        Box::new(io::stdin())
    } else {
        let file = File::open(Path::new(path))
            .with_context(|| format!("failed to open stream file {path}"))?;
        Box::new(BufReader::new(file))
    };
    SendStream::new(reader).with_context(|| format!("{path} is not a btrfs send-stream"))
}

/// Print each item of one stream, one per line, as it parses.
fn parse(path: &str) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for item in open_stream(path)? {
        let item = item.with_context(|| format!("failed to parse {path}"))?;
        writeln!(out, "{item}")?;
    }
    Ok(())
}

/// Apply the streams in order, then freeze and render every subvolume.
fn receive(paths: &[String]) -> Result<()> {
    let mut set = SubvolumeSet::new();
    for path in paths {
        debug!(path = %path, "receiving stream");
        set.receive(open_stream(path)?)
            .with_context(|| format!("failed to apply {path}"))?;
    }
    let frozen = set.freeze().context("failed to resolve clones")?;
    if let Err(incomplete) = frozen.check_complete() {
        // Still render: partial streams are common when inspecting
        // incremental sends in isolation.
        eprintln!("warning: {incomplete}");
    }
    let rendered = frozen.render().context("failed to render subvolumes")?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for (name, tree) in rendered {
        let mut line = serde_json::Map::new();
        line.insert(name, tree);
        writeln!(out, "{}", serde_json::Value::Object(line))?;
    }
    Ok(())
}
