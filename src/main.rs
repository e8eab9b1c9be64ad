use std::process::exit;

use argh::FromArgs;
use slog::Drain;

mod buffer;
mod config;
mod crypto;
mod error;
mod geoip;
mod proxy;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(FromArgs)]
/// Accepts encrypted client tunnels and relays them directly or through a SOCKS5 backend
struct Args {
    /// the configuration file
    #[argh(option, short = 'c')]
    config: String,

    /// minimum log level: trace, debug, info, warn, error or critical
    #[argh(option, default = "String::from(\"info\")")]
    log_level: String,

    /// runs in a single thread
    #[argh(switch)]
    single_thread: bool,

    /// tests the configuration and exit
    #[argh(switch, short = 'T')]
    test: bool,

    /// prints version
    #[argh(switch, short = 'V')]
    version: bool,
}

fn main() {
    let args: Args = argh::from_env();

    if args.version {
        println!("{VERSION}");
        exit(0);
    }

    let level = match args.log_level.parse::<slog::Level>() {
        Ok(level) => level,
        Err(_) => {
            eprintln!("unknown log level: {}", args.log_level);
            exit(1);
        }
    };

    let config = match config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {}: {e}", args.config);
            exit(1);
        }
    };
    if args.test {
        println!("ok");
        exit(0);
    }

    let logger = setup_logger(level);
    if let Err(e) = run(logger.clone(), &config, args.single_thread) {
        slog::crit!(logger, "server stopped"; "err" => %e);
        exit(1);
    }
}

fn run(logger: slog::Logger, config: &config::Config, single_thread: bool) -> anyhow::Result<()> {
    let mut builder = if single_thread {
        tokio::runtime::Builder::new_current_thread()
    } else {
        tokio::runtime::Builder::new_multi_thread()
    };
    let rt = builder.enable_all().build()?;
    let server = proxy::Server::new(logger, config)?;
    rt.block_on(server.serve())
}

fn setup_logger(level: slog::Level) -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    slog::Logger::root(drain, slog::o!("version" => VERSION))
}
