//! Offline rebalance tool for Stratum tree files.
//!
//! Reads every key-value pair from an existing tree file and rewrites it as
//! a densely packed tree, replacing the original atomically.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use stratum::{IntCodec, NaturalOrder, Rebalancer, StringCodec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CodecKind {
    #[value(name = "INTEGER")]
    Integer,
    #[value(name = "LONG")]
    Long,
    #[value(name = "STRING")]
    String,
    #[value(name = "DOUBLE")]
    Double,
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CodecKind::Integer => "INTEGER",
            CodecKind::Long => "LONG",
            CodecKind::String => "STRING",
            CodecKind::Double => "DOUBLE",
        };
        f.write_str(name)
    }
}

/// Rebalances Stratum B+ tree files offline.
#[derive(Debug, Parser)]
#[command(name = "stratum-rebalance", version)]
struct Cli {
    /// Path to the tree file to rebalance
    tree_file: PathBuf,

    /// B+ tree order (maximum keys per node)
    #[arg(long, default_value_t = 4)]
    order: usize,

    /// Buffer pool size in pages
    #[arg(long = "buffer-size", default_value_t = 1000)]
    buffer_size: usize,

    /// Key type
    #[arg(long = "key-type", value_enum, default_value_t = CodecKind::Integer)]
    key_type: CodecKind,

    /// Value type
    #[arg(long = "value-type", value_enum, default_value_t = CodecKind::String)]
    value_type: CodecKind,

    /// Show tree statistics before and after rebalancing
    #[arg(long)]
    stats: bool,
}

fn run(cli: &Cli) -> stratum::Result<()> {
    println!("Rebalancing tree: {}", cli.tree_file.display());
    println!("Configuration:");
    println!("  Order: {}", cli.order);
    println!("  Buffer size: {}", cli.buffer_size);
    println!("  Key type: {}", cli.key_type);
    println!("  Value type: {}", cli.value_type);
    println!();

    if cli.key_type != CodecKind::Integer || cli.value_type != CodecKind::String {
        return Err(stratum::Error::Codec(format!(
            "key type {} and value type {} combination not yet supported; \
             currently only INTEGER keys with STRING values are supported",
            cli.key_type, cli.value_type
        )));
    }

    let rebalancer: Rebalancer<i32, String> = Rebalancer::new(
        Arc::new(IntCodec),
        Arc::new(StringCodec),
        Arc::new(NaturalOrder),
        cli.order,
        cli.buffer_size,
    );

    if cli.stats {
        println!("Tree statistics before rebalancing:");
        println!("  {}", rebalancer.tree_stats(&cli.tree_file)?);
        println!();
    }

    let started = Instant::now();
    rebalancer.rebalance(&cli.tree_file)?;
    println!("Rebalancing completed in {} ms", started.elapsed().as_millis());

    if cli.stats {
        println!();
        println!("Tree statistics after rebalancing:");
        println!("  {}", rebalancer.tree_stats(&cli.tree_file)?);
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
