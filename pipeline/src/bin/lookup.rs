use std::fmt::Display;
use std::sync::Arc;

// a simple utility for debugging index synthesis: print the synthesized index (or the tag
// list) for each argument reference

use clap::Parser;
use registry::synthesize::synthesize_index;
use registry::{Clients, Reference, Registry as _};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    images: Vec<String>,

    // list the repository's tags instead of synthesizing an index
    #[arg(long)]
    tags: bool,
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
    let clients = Arc::new(fatal(Clients::from_env()));

    for image in &args.images {
        let reference = fatal(Reference::parse(image));
        if args.tags {
            let client = fatal(clients.for_ref(&reference));
            for tag in fatal(client.list_tags(&reference.repository).await) {
                println!("{tag}");
            }
        } else {
            match fatal(synthesize_index(&clients, &reference).await) {
                Some(index) => println!("{}", fatal(pipeline::to_tab_indented_json(&index))),
                None => println!("null"),
            }
        }
    }
}
