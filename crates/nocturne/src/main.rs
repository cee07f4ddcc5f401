use nocturne::{Server, ServerConfig, logging};
use tracing::error;

fn main() {
    logging::init_logging();

    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "nocturne".into());
    let port = match args.next().map(|raw| raw.parse::<u16>()) {
        Some(Ok(port)) => port,
        Some(Err(e)) => {
            error!(error = %e, "invalid port");
            eprintln!("usage: {} <port>", program);
            std::process::exit(1);
        }
        None => {
            eprintln!("usage: {} <port>", program);
            std::process::exit(1);
        }
    };

    let config = ServerConfig {
        port,
        ..ServerConfig::from_env()
    };

    if let Err(e) = Server::new(config).serve() {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
