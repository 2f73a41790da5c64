use std::process;

use pagecache::{
    cache::{CacheConfig, LookupIndex, LookupRecord, derive_key},
    config::{self, KeyArgs, MigrateArgs, RecordsArgs},
    error::AppError,
    infra::{db::PostgresLookupIndex, error::InfraError, telemetry},
};
use serde::Serialize;
use sqlx::postgres::PgPool;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

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

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        config::Command::Key(args) => run_key(&settings, args),
        config::Command::Records(args) => run_records(&settings, args).await,
        config::Command::Migrate(args) => run_migrate(&settings, args).await,
    }
}

#[derive(Serialize)]
struct KeyReport<'a> {
    host: &'a str,
    path: &'a str,
    cookie_name: &'a str,
    page_version: &'a str,
    fingerprint: String,
    store_key: String,
}

fn run_key(settings: &config::Settings, args: KeyArgs) -> Result<(), AppError> {
    let cache = CacheConfig::from(&settings.cache);
    let fingerprint = derive_key(&args.host, &args.path, &cache.cookie_name, &args.page_version);
    let store_key = cache.namespace().store_key(&fingerprint);

    if args.json {
        let report = KeyReport {
            host: &args.host,
            path: &args.path,
            cookie_name: &cache.cookie_name,
            page_version: &args.page_version,
            fingerprint: fingerprint.into_string(),
            store_key,
        };
        let rendered = serde_json::to_string_pretty(&report)
            .map_err(|err| AppError::unexpected(format!("failed to encode report: {err}")))?;
        println!("{rendered}");
    } else {
        println!("fingerprint: {fingerprint}");
        println!("store key:   {store_key}");
    }
    Ok(())
}

async fn run_records(settings: &config::Settings, args: RecordsArgs) -> Result<(), AppError> {
    if args.lookup_identifier.trim().is_empty() {
        return Err(AppError::validation("lookup identifier must not be empty"));
    }

    let pool = connect(settings).await?;
    let index = PostgresLookupIndex::new(pool);
    let namespace = CacheConfig::from(&settings.cache).namespace();

    let records: Vec<LookupRecord> = index
        .query(
            &args.lookup_identifier,
            args.supplementary_identifier.as_deref(),
        )
        .await?;

    if args.json {
        let rendered = serde_json::to_string_pretty(&records)
            .map_err(|err| AppError::unexpected(format!("failed to encode records: {err}")))?;
        println!("{rendered}");
    } else {
        for record in &records {
            println!("{}\t{}", record, record.store_key(&namespace));
        }
    }

    info!(
        lookup_identifier = %args.lookup_identifier,
        count = records.len(),
        "Listed lookup records"
    );
    Ok(())
}

async fn run_migrate(settings: &config::Settings, _args: MigrateArgs) -> Result<(), AppError> {
    let pool = connect(settings).await?;
    PostgresLookupIndex::run_migrations(&pool)
        .await
        .map_err(InfraError::from)?;
    info!("Lookup index migrations applied");
    Ok(())
}

async fn connect(settings: &config::Settings) -> Result<PgPool, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let pool = PostgresLookupIndex::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(InfraError::from)?;
    Ok(pool)
}
