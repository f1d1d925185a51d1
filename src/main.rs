use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use thread_graft::RunOptions;
use tracing_subscriber::EnvFilter;

const HELP: &str = "Thread-Graft — Print a threaded comment discussion.

Usage: thread-graft [FLAGS] <post-id | url>

  --version, -V        Show version and exit
  --help,    -h        Show this help message
  --expand N           Expand every placeholder N rounds deep
  --width N            Wrap output at N columns
  --config PATH        Read configuration from PATH";

fn main() {
    init_tracing();

    let opts = match parse_args(std::env::args().skip(1)) {
        Ok(Some(opts)) => opts,
        Ok(None) => return,
        Err(err) => {
            eprintln!("error: {err}\n\n{HELP}");
            std::process::exit(2);
        }
    };

    if let Err(err) = thread_graft::run(opts) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<RunOptions>> {
    let mut opts = RunOptions::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("Thread-Graft {}", thread_graft::VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                println!("{HELP}");
                return Ok(None);
            }
            "--expand" => {
                let value = args.next().ok_or_else(|| anyhow!("--expand needs a value"))?;
                opts.expand_rounds = Some(value.parse()?);
            }
            "--width" => {
                let value = args.next().ok_or_else(|| anyhow!("--width needs a value"))?;
                opts.width = Some(value.parse()?);
            }
            "--config" => {
                let value = args.next().ok_or_else(|| anyhow!("--config needs a value"))?;
                opts.config_file = Some(PathBuf::from(value));
            }
            flag if flag.starts_with('-') => bail!("unknown flag {flag}"),
            target => {
                if !opts.target.is_empty() {
                    bail!("only one thread can be shown at a time");
                }
                opts.target = target.to_string();
            }
        }
    }
    if opts.target.is_empty() {
        bail!("missing post id or url");
    }
    Ok(Some(opts))
}
