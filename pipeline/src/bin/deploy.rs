use std::fmt::Display;
use std::sync::Arc;

use clap::Parser;
use pipeline::deploy;
use pipeline::input::RawInput;
use registry::Clients;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    // path to the push/copy request stream, or "-" for stdin; documents must arrive with
    // children before parents
    #[arg(default_value = "-")]
    input: String,
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

    let input = fatal(if args.input == "-" {
        std::io::read_to_string(std::io::stdin())
    } else {
        std::fs::read_to_string(&args.input)
    });

    let documents: Vec<RawInput> = serde_json::Deserializer::from_str(&input)
        .into_iter::<RawInput>()
        .map(fatal)
        .collect();

    let clients = Arc::new(fatal(Clients::from_env()));
    tokio::select! {
        result = deploy::run(clients, documents) => fatal(result),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            std::process::exit(130);
        }
    }
}
