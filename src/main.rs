use std::env;
use std::path::Path;
use std::process;

use getopts::Options;
use statsd_relay::{Config, LogLevel, Relay};
use tracing::error;
use tracing_subscriber::fmt::time::ChronoLocal;

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} CONFIG", program);
    print!("{}", opts.usage(&brief));
}

fn init_logging(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_max_level(level.as_filter())
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_owned()))
        .with_target(false)
        .with_ansi(false)
        .init();
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = &args[0];

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(e) => {
            eprintln!("{}", e);
            print_usage(program, &opts);
            process::exit(1);
        }
    };
    if matches.opt_present("help") {
        print_usage(program, &opts);
        return;
    }
    if matches.free.len() != 1 {
        print_usage(program, &opts);
        process::exit(1);
    }

    let config = match Config::load(Path::new(&matches.free[0])) {
        Ok(config) => config,
        Err(e) => {
            init_logging(LogLevel::default());
            error!(error = %e, "failed to load configuration");
            process::exit(1);
        }
    };
    init_logging(config.log_level);

    let mut relay = match Relay::new(&config) {
        Ok(relay) => relay,
        Err(e) => {
            error!(error = %e, "startup failed");
            process::exit(1);
        }
    };
    if let Err(e) = relay.watch_signals() {
        error!(error = %e, "failed to install signal handlers");
        process::exit(1);
    }
    if let Err(e) = relay.run() {
        error!(error = %e, "event loop failed");
        process::exit(1);
    }
}
