use std::path::PathBuf;
use std::{env, process};

use clap::Parser;
use sleeplock::config::Config;
use sleeplock::dbus::SystemBus;
use sleeplock::dispatch;
use sleeplock::lock::InhibitMode;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Command line arguments.
#[derive(Parser, Debug)]
#[clap(author, about, version, max_term_width = 80)]
struct Options {
    /// Configuration file [default: $XDG_CONFIG_HOME/sleeplock/sleeplock.json].
    #[clap(long, short)]
    config: Option<PathBuf>,

    /// Transitions to inhibit.
    #[clap(long)]
    what: Option<String>,

    /// Name reported as the lock holder.
    #[clap(long)]
    who: Option<String>,

    /// Reason reported for holding the lock.
    #[clap(long)]
    why: Option<String>,

    /// Inhibition mode, only delay locks observe sleep.
    #[clap(long)]
    mode: Option<InhibitMode>,

    /// Method call timeout in milliseconds.
    #[clap(long)]
    timeout: Option<u64>,
}

impl Options {
    /// Apply command line overrides on top of the configuration file.
    fn apply(self, config: &mut Config) {
        if let Some(what) = self.what {
            config.inhibit.what = what;
        }
        if let Some(who) = self.who {
            config.inhibit.who = who;
        }
        if let Some(why) = self.why {
            config.inhibit.why = why;
        }
        if let Some(mode) = self.mode {
            config.inhibit.mode = mode;
        }
        if let Some(timeout) = self.timeout {
            config.call_timeout_ms = Some(timeout);
        }
    }
}

pub fn main() {
    // Setup logging.
    let directives = env::var("RUST_LOG").unwrap_or("warn,sleeplock=info".into());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    FmtSubscriber::builder().with_env_filter(env_filter).with_line_number(true).init();

    let options = Options::parse();
    let mut config = match Config::load(options.config.as_deref()) {
        Ok(config) => config,
        Err(err) => fatal(1, err),
    };
    options.apply(&mut config);
    if let Err(err) = config.validate() {
        fatal(1, err);
    }

    let bus = match SystemBus::connect(config.call_timeout()) {
        Ok(bus) => bus,
        Err(err) => fatal(2, err),
    };

    // Without the initial lock there is nothing to hand back before sleep.
    let mut dispatcher = match dispatch::start(bus, &config) {
        Ok(dispatcher) => dispatcher,
        Err(err) => fatal(3, err),
    };

    match dispatcher.run() {
        Ok(never) => match never {},
        Err(err) => fatal(4, err),
    }
}

/// Log an error and terminate.
fn fatal(code: i32, err: impl std::fmt::Display) -> ! {
    error!("{err}");
    process::exit(code);
}
