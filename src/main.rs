use std::process;

use reactive_query::{
    QueryClient,
    config::{self, CheckArgs, Command, Settings},
    telemetry,
};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::LoadError),
    #[error(transparent)]
    Telemetry(#[from] telemetry::TelemetryError),
    #[error("failed to render configuration: {0}")]
    Render(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    let command = cli_args.command.unwrap_or_default();

    telemetry::init(&settings.logging)?;

    match command {
        Command::Check(args) => run_check(settings, &args),
    }
}

fn run_check(settings: Settings, args: &CheckArgs) -> Result<(), AppError> {
    let client = QueryClient::new(settings.engine);
    let engine = client.config();

    if args.json {
        println!("{}", serde_json::to_string_pretty(engine)?);
    } else {
        println!(
            "cache: max_entries={} sweep_interval_ms={} default_stale_time_ms={} default_cache_time_ms={}",
            engine.cache.max_entries,
            engine.cache.sweep_interval_ms,
            engine.cache.default_stale_time_ms,
            engine.cache.default_cache_time_ms,
        );
        println!("defaults: {}", describe_policy(&engine.defaults));
        for (name, policy) in &engine.features {
            println!("features.{name}: {}", describe_policy(policy));
        }
    }

    info!(features = engine.features.len(), "Configuration is valid");
    client.dispose();
    Ok(())
}

fn describe_policy(policy: &reactive_query::query::FeaturePolicy) -> String {
    let optional = |value: Option<u64>| value.map_or_else(|| "none".to_string(), |v| v.to_string());
    format!(
        "stale_time_ms={} cache_time_ms={} retries={} backoff_base_ms={} max_backoff_ms={} timeout_ms={}",
        policy.stale_time_ms,
        policy.cache_time_ms,
        policy.retries,
        policy.backoff_base_ms,
        optional(policy.max_backoff_ms),
        optional(policy.timeout_ms),
    )
}
