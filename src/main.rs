use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tradewire::{Config, TradingContext, WsConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradewire=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!("Starting tradewire against {}", config.connection.endpoint);

    let context = Arc::new(TradingContext::new(config, Arc::new(WsConnector))?);

    match context.connect().await? {
        Some(summary) => info!(
            "Active account {} ({} {:.2})",
            summary.active.login_id, summary.active.currency, summary.active.balance
        ),
        None => warn!("Running without authorization; trading calls will be rejected"),
    }

    // Stream ticks for the configured symbols
    let mut streams = Vec::new();
    for symbol in &context.config().symbols {
        match context
            .market()
            .subscribe_to_ticks(symbol, |tick| {
                tracing::trace!("{} {} @ {}", tick.symbol, tick.quote, tick.epoch);
            })
            .await
        {
            Ok(subscription) => streams.push(subscription),
            Err(e) => error!("Tick stream for {} failed: {}", symbol, e),
        }
    }
    info!("Streaming {} symbols", streams.len());

    // Periodic risk monitor
    let monitor = {
        let context = context.clone();
        let period = context.config().risk_monitor_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let exits = context.trades().auto_manage_contracts().await;
                if !exits.is_empty() {
                    info!("Strategy exits: {:?}", exits);
                }
                let report = context.run_risk_cycle().await;
                if report.halted || !report.closed.is_empty() {
                    warn!(
                        "Risk actions: closed {:?}, halted {}",
                        report.closed, report.halted
                    );
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    monitor.abort();
    context.disconnect().await;

    Ok(())
}
