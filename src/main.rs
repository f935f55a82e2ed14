use watchtree::{cli, logging};

#[tokio::main]
async fn main() {
    let args = cli::parse();

    if let Err(e) = logging::init(args.log_level) {
        eprintln!("watchtree: failed to init logging: {e}");
        std::process::exit(1);
    }

    match watchtree::run(args).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("watchtree: {e}");
            std::process::exit(1);
        }
    }
}
