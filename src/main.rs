use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use feedrelay::rate_limit::RateLimitConfig;
use feedrelay::{
    start_updater, ChannelNotifier, CommandHandler, CommandRequest, Config, Database, FeedUpdater,
    HttpFeedSource, Notifier, OutboundMessage, Shutdown,
};

/// Capacity of the outbound message queue.
const OUTBOUND_CAPACITY: usize = 64;

/// How long to wait for queued messages on exit.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::load_with_env("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    // Initialize logging
    if let Err(e) = feedrelay::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        feedrelay::logging::init_console_only(&config.logging.level);
    }

    info!("feedrelay - Feed relay bot");

    let db = match Database::open_with_config(&config.database).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    let source = match HttpFeedSource::new(&config.fetch) {
        Ok(source) => Arc::new(source),
        Err(e) => {
            error!("Failed to create feed source: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = Shutdown::new();
    let (notifier, outbound) = ChannelNotifier::new(OUTBOUND_CAPACITY);
    let notifier: Arc<dyn Notifier> = Arc::new(notifier);

    let transport = tokio::spawn(print_outbound(outbound));

    let updater = FeedUpdater::from_config(
        Arc::clone(&db),
        source.clone(),
        Arc::clone(&notifier),
        &config,
    );
    let updater_task = start_updater(updater, shutdown.signal());

    let handler = Arc::new(
        CommandHandler::new(
            Arc::clone(&db),
            source,
            config.bot.clone(),
            RateLimitConfig::from(&config.requests),
        )
        .with_stop(shutdown.signal()),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let stop = shutdown.signal();
    let terminate = terminate_signal();
    tokio::pin!(terminate);

    loop {
        tokio::select! {
            _ = &mut terminate => {
                info!("Received termination signal, shutting down");
                break;
            }
            _ = stop.stopped() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let Some(request) = CommandRequest::parse_line(&line) else {
                            warn!("Ignoring malformed input: {}", line);
                            continue;
                        };
                        let handler = Arc::clone(&handler);
                        let notifier = Arc::clone(&notifier);
                        tokio::spawn(async move {
                            let reply = handler.handle(&request).await;
                            if let Err(e) = notifier.send(request.destination, &reply).await {
                                warn!("Failed to send reply to {}: {}", request.destination, e);
                            }
                        });
                    }
                    Ok(None) => {
                        info!("Input closed; waiting for termination signal");
                        (&mut terminate).await;
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read input: {}", e);
                        break;
                    }
                }
            }
        }
    }

    shutdown.trigger();
    if let Err(e) = updater_task.await {
        error!("Updater task failed: {}", e);
    }

    // Flush what is queued once the last sender is gone
    drop(handler);
    drop(notifier);
    if tokio::time::timeout(FLUSH_TIMEOUT, transport).await.is_err() {
        warn!("Outbound queue not drained before exit");
    }
    db.close().await;

    info!("Shutdown complete");
}

/// Resolve on Ctrl-C or, on unix, SIGTERM.
async fn terminate_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for interrupt: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}

/// Console transport: print every outbound message.
async fn print_outbound(mut outbound: mpsc::Receiver<OutboundMessage>) {
    while let Some(message) = outbound.recv().await {
        println!("[{}] {}", message.destination, message.text);
    }
}
