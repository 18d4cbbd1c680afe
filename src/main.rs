use respio::config::Config;
use respio::util::{self, LogLevel};
use respio::Server;

fn main() {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).unwrap_or_else(|e| {
            eprintln!("{e}");
            std::process::exit(1);
        }),
        None => Config::default(),
    };

    util::configure_logging(config.loglevel, &config.logfile);
    util::log(LogLevel::Notice, "Server starting");

    let mut server = Server::new(config).unwrap_or_else(|e| {
        util::log(LogLevel::Warning, &format!("Could not start server: {e}"));
        std::process::exit(1);
    });

    if let Err(e) = server.run() {
        util::log(LogLevel::Warning, &format!("Fatal error in event loop: {e}"));
        std::process::exit(1);
    }
}
