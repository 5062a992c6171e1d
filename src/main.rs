// src/main.rs

use docdag::{cli, logging, run};

/// Exit code for a run that ended with failed nodes, error findings or a halt.
const EXIT_UNCLEAN: i32 = 2;

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(EXIT_UNCLEAN),
        Err(err) => {
            eprintln!("docdag error: {err:?}");
            std::process::exit(1);
        }
    }
}

async fn run_main() -> anyhow::Result<bool> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    run(args).await
}
