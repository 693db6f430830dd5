//! leaseq CLI: operator interface to a topic store.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use leaseq::communicator::{Communicator, Reaper};
use leaseq::config::Config;
use leaseq::db::Db;
use leaseq::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "leaseq", about = "Lease-based work queue over Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish one item onto a topic
    Publish {
        topic: String,
        /// JSON payload
        payload: String,
    },
    /// Show item counts for a topic (or every topic)
    Stats {
        topic: Option<String>,
    },
    /// Find the first item whose payload has KEY equal to VALUE
    Find {
        topic: String,
        /// Dotted payload key, e.g. "evaluation_id" or "state.epoch"
        key: String,
        /// JSON value to match
        value: String,
    },
    /// Run a standalone stale-lease reaper until Ctrl-C
    Reap,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "leaseq".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    let comm = Communicator::new(Arc::new(db), config.communicator_config().with_reaper(false));

    match cli.command {
        Command::Publish { topic, payload } => cmd_publish(&comm, &topic, &payload).await,
        Command::Stats { topic } => cmd_stats(&comm, topic).await,
        Command::Find { topic, key, value } => cmd_find(&comm, &topic, &key, &value).await,
        Command::Reap => cmd_reap(&comm).await,
    }
}

async fn cmd_publish(comm: &Communicator, topic: &str, payload: &str) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(payload)?;
    let item = comm.publish(topic, &payload).await?;
    println!("Published: {} to {topic}", item.id);
    Ok(())
}

async fn cmd_stats(comm: &Communicator, topic: Option<String>) -> anyhow::Result<()> {
    let topics = match topic {
        Some(topic) => vec![topic],
        None => comm.topics().await?,
    };

    if topics.is_empty() {
        println!("No topics found.");
        return Ok(());
    }

    println!(
        "{:<24}  {:>9}  {:>7}  {:>9}  WORK_SECS",
        "TOPIC", "UNLEASED", "LEASED", "COMPLETED"
    );
    println!("{}", "-".repeat(72));
    for topic in &topics {
        let stats = comm.topic_stats(topic).await?;
        println!(
            "{:<24}  {:>9}  {:>7}  {:>9}  {:.1}",
            topic, stats.unleased, stats.leased, stats.completed, stats.work_seconds
        );
    }
    Ok(())
}

async fn cmd_find(comm: &Communicator, topic: &str, key: &str, value: &str) -> anyhow::Result<()> {
    let value: serde_json::Value = serde_json::from_str(value)?;
    let Some(item) = comm.get_value(topic, key, &value).await? else {
        println!("No item in {topic} with {key} = {value}.");
        return Ok(());
    };

    println!("ID:          {}", item.id);
    println!("State:       {}", item.state());
    println!("Payload:     {}", serde_json::to_string_pretty(&item.payload)?);
    if let Some(start) = item.lease_start {
        println!("Lease Start: {start}");
    }
    if let Some(beat) = item.heartbeat {
        println!("Heartbeat:   {beat}");
    }
    if let Some(end) = item.lease_end {
        println!("Lease End:   {end}");
    }
    println!("Work Secs:   {:.1}", item.work_seconds);
    Ok(())
}

async fn cmd_reap(comm: &Communicator) -> anyhow::Result<()> {
    let reaper = Reaper::new(Arc::clone(comm.store()), comm.config());
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        let _ = tx.send(true);
    });

    reaper.run(comm.config().reaper_startup_delay, rx).await?;
    Ok(())
}
