//! bot-worker - hosts one bot for a botpool server
//!
//! Spawned by the pool, one process per bot. Speaks the worker protocol on
//! stdin/stdout; logs go to stderr.
//!
//! Environment variables:
//!   BOT_IDENTITY - identity of the hosted bot (set by the pool, used in logs)
//!   LOG_LEVEL - log level (default: info)

use clap::Parser;
use tracing::{error, info};

use botpool::logging::{self, LogTarget};
use botpool::worker::{serve, KeywordResponder, Responder};

#[derive(Parser, Debug)]
#[command(name = "bot-worker")]
#[command(about = "Keyword-matching bot worker for botpool")]
#[command(version)]
struct Args {
    /// Identity of the hosted bot
    #[arg(long, env = "BOT_IDENTITY")]
    bot_identity: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    logging::init(
        &format!("botpool={},bot_worker={},warn", args.log_level, args.log_level),
        false,
        LogTarget::Stderr,
    );

    info!(
        identity = args.bot_identity.as_deref().unwrap_or("-"),
        pid = std::process::id(),
        "Worker starting"
    );

    let result = serve(tokio::io::stdin(), tokio::io::stdout(), |_, definition| {
        KeywordResponder::from_definition(definition).map(|bot| Box::new(bot) as Box<dyn Responder>)
    })
    .await;

    if let Err(e) = result {
        error!("Worker failed: {}", e);
        std::process::exit(1);
    }
}
