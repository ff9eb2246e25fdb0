use anyhow::Result;
use colored::Colorize;
use lake_gateway::{
    config, init_tracing,
    context::RequestContext,
    logging::get_logger,
    server::{self, MAIN_STAN},
};
use std::path::Path;

/// Execute the start command
///
/// Loads configuration, initializes logging and runs the server until a
/// shutdown signal. Startup failures are logged at fatal level.
pub async fn execute(config_path: &Path) -> Result<()> {
    let ctx = RequestContext::with_stan(MAIN_STAN);
    let log = get_logger("lake-gateway");

    let cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            init_tracing("info", "json");
            log.fatale(&ctx, "failed to load configuration", &*err, &[]);
        }
    };

    init_tracing(&cfg.logging.level, &cfg.logging.format);
    if cfg.logging.format == "console" {
        println!("{}", "Starting lake gateway...".green());
    }

    log.infow(&ctx, "starting service lake-gateway", &[]);

    if let Err(err) = server::start_server(cfg).await {
        log.fatale(&ctx, "service failed", &*err, &[]);
    }

    Ok(())
}
