use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use futures::{StreamExt, TryStreamExt};
use mail_index_core::{ContactOptions, IndexBackend, LockManager, MessageId, ThreadOptions};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mail_index_local::config::{Command, Config};
use mail_index_local::Index;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let dir = config.effective_index_dir();

    let index = Index::open(&dir, config.index_type.as_deref())
        .await
        .with_context(|| format!("Failed to open index at {}", dir.display()))?;

    // Commands that write hold the lock even when not asked to. lock-status
    // probes the lock itself and never holds it.
    let locked = match config.command {
        Command::LockStatus { .. } => false,
        Command::Optimize => true,
        _ => config.lock,
    };
    if locked {
        index.lock().await?;
        index.start_lock_heartbeat().await?;
    }

    if let Some(mut errors) = index.take_background_errors().await {
        tokio::spawn(async move {
            while let Some(error) = errors.recv().await {
                warn!("{}", error);
            }
        });
    }

    let result = tokio::select! {
        result = run(&index, config.command) => result,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping");
            Ok(())
        }
    };

    if locked {
        index.stop_lock_heartbeat().await;
        index.unlock().await?;
    }
    result
}

async fn run(index: &Index, command: Command) -> anyhow::Result<()> {
    if !matches!(command, Command::LockStatus { .. }) {
        index.load().await.context("Failed to load index")?;
    }
    let backend = index.backend();

    match command {
        Command::Info => {
            println!("dir:      {}", index.dir().display());
            println!("type:     {}", backend.name());
            println!("messages: {}", backend.size().await?);
        }
        Command::LockStatus { stale_after } => lock_status(index, stale_after).await?,
        Command::Search { query, limit } => {
            let query = backend.parse_query(&query)?;
            let mut messages = backend.each_message(&query).take(limit);
            while let Some(message) = messages.try_next().await? {
                println!(
                    "{}  {:<30}  {}  [{}]",
                    message.date.format("%Y-%m-%d %H:%M"),
                    message.from.to_string(),
                    message.subject,
                    message.labels.iter().cloned().collect::<Vec<_>>().join(" ")
                );
            }
        }
        Command::Count { query } => {
            let query = backend.parse_query(&query)?;
            println!("{}", backend.num_results_for(&query).await?);
        }
        Command::Thread {
            id,
            skip_killed,
            limit,
        } => {
            let seed = backend.build_message(&MessageId::new(id)).await?;
            let options = ThreadOptions { limit, skip_killed };
            let mut entries = backend.each_message_in_thread_for(&seed, options);
            while let Some((_, deferred)) = entries.try_next().await? {
                let message = deferred.build().await?;
                println!(
                    "{}  {}  {}",
                    message.date.format("%Y-%m-%d %H:%M"),
                    message.id,
                    message.subject
                );
            }
        }
        Command::Contacts { addresses, limit } => {
            let people = backend
                .load_contacts(&addresses, ContactOptions { limit })
                .await?;
            for person in people {
                println!("{}", person);
            }
        }
        Command::Optimize => {
            backend.optimize().await?;
            index.save().await?;
            info!("Optimized {} index", backend.name());
        }
    }

    Ok(())
}

async fn lock_status(index: &Index, stale_after: u64) -> anyhow::Result<()> {
    let lock = index.lock_manager();
    match lock.lock().await {
        Ok(()) => {
            lock.unlock().await?;
            println!("unlocked");
        }
        Err(mail_index_core::IndexError::LockHeld(info)) => {
            let stale = info.is_stale(Utc::now(), std::time::Duration::from_secs(stale_after));
            println!("locked");
            for (key, value) in info.pairs() {
                println!("  {}: {}", key, value);
            }
            if stale {
                let age = info.heartbeat_age(Utc::now()).num_seconds();
                println!("  stale: no heartbeat for {}s", age);
            }
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
