use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use pipeline::builds::{CacheFile, Engine, Resolver};
use registry::Clients;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    // path to the pre-ordered source records, or "-" for stdin; one JSON document per
    // (source, architecture), children before parents
    sources: String,

    // resolve cache file; read at startup, written back only after a fully successful run
    #[arg(long)]
    cache: Option<PathBuf>,
}

fn fatal<T, E: Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();

    // "oisupport/staging-ARCH:BUILD" or similar
    let staging_template =
        std::env::var("META_STAGING_TEMPLATE").expect("META_STAGING_TEMPLATE must be set");

    let input = fatal(if args.sources == "-" {
        std::io::read_to_string(std::io::stdin())
    } else {
        std::fs::read_to_string(&args.sources)
    });

    let clients = Arc::new(fatal(Clients::from_env()));
    let resolver = Arc::new(Resolver::new(clients));
    if let Some(path) = &args.cache {
        resolver.enable_save();
        let cache = fatal(CacheFile::load(path));
        resolver.prime(cache.indexes).await;
    }

    let engine = fatal(Engine::new(resolver.clone(), staging_template));

    let mut stdout = std::io::stdout();
    tokio::select! {
        result = engine.run(input, &mut stdout) => fatal(result),
        _ = tokio::signal::ctrl_c() => {
            // no cache write on an interrupted run; partial progress is not trustworthy
            eprintln!("interrupted");
            std::process::exit(130);
        }
    }

    if let Some(path) = &args.cache {
        if let Some(indexes) = resolver.saved() {
            fatal(CacheFile { indexes }.save(path));
        }
    }
}
