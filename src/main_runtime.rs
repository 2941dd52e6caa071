use quoteflow::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},quoteflow=debug,sqlx=warn", config.level))
    });

    // File logging is opt-in via logging.dir or QUOTEFLOW_LOG_DIR.
    let log_dir = config
        .dir
        .clone()
        .or_else(|| std::env::var("QUOTEFLOW_LOG_DIR").ok());

    // `tracing_appender::rolling::daily` panics if it can't create the initial
    // log file, so check the directory is writable first.
    let file_layer = log_dir.as_deref().and_then(|log_dir| {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                log_dir, e
            );
            return None;
        }
        let test_path = std::path::Path::new(log_dir).join(".quoteflow_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(log_dir, "quoteflow.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // The guard flushes on drop; the process holds it until exit
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    });

    let (console_layer, json_layer) = if config.json {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            ),
        )
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, log_dir) {
        eprintln!("Logging to: {}/quoteflow.log", dir);
    }
}

pub fn init_logging_simple() {
    // Minimal logging for one-shot commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
