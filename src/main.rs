// Terminal chat against an in-process loopback backend.
//
//   chatline [settings.toml]
//
// Type a line to send it. Commands: /react <n> <emoji>, /peer <text>,
// /offline, /online, /fail on|off, /retry, /resubscribe, /logout, /quit.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use chatline_lib::{
    init_logging, Author, CacheEvent, ConfigService, DeliveryStatus, Draft, LoopbackBackend,
    Message, SyncContext, SyncSession, SyncSignal,
};

fn status_mark(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Pending => "…",
        DeliveryStatus::Sent => "✓",
        DeliveryStatus::Delivered => "✓✓",
        DeliveryStatus::Read => "👁",
    }
}

fn print_messages(messages: &[Message]) {
    println!("── {} messages ──", messages.len());
    // Oldest at the bottom of the scrollback is easier to read in a terminal.
    for (n, msg) in messages.iter().enumerate().rev() {
        let reactions: String = msg.reactions.iter().map(|r| r.emoji.as_str()).collect();
        println!(
            "[{:>2}] {} {:<10} {} {} {}",
            n,
            msg.created_at.format("%H:%M:%S"),
            msg.author.name,
            msg.body.preview(),
            status_mark(msg.status),
            reactions
        );
    }
}

fn describe(signal: &SyncSignal) -> String {
    match signal {
        SyncSignal::RemoteWriteFailed {
            local_id,
            reason,
            will_retry,
        } => format!(
            "send failed for {} ({}){}",
            local_id,
            reason,
            if *will_retry { ", retrying" } else { ", use /retry" }
        ),
        SyncSignal::PersistenceFailed { reason } => format!("could not save cache: {}", reason),
        SyncSignal::ReconciliationAmbiguous {
            server_id,
            candidates,
            ..
        } => format!("{} matched {} local messages", server_id, candidates.len()),
        SyncSignal::SubscriptionLost { reason } => {
            format!("feed lost: {} (use /resubscribe)", reason)
        }
        SyncSignal::ConnectivityChanged(c) => format!("now {:?}", c),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ConfigService::load(config_path.as_deref()).context("loading settings")?;
    init_logging(&config.get().log_level);

    let backend = Arc::new(LoopbackBackend::new());
    let ctx = SyncContext::from_config(backend.clone(), config.get())
        .context("opening message cache")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Your name:");
    let name = lines
        .next_line()
        .await?
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| "me".to_string());
    let me = Author::new(&name.to_lowercase(), &name);
    let peer = Author::new("peer", "Peer");

    let mut session = SyncSession::start(ctx, true).await;
    let _signals = session
        .subscribe(|event| {
            if let CacheEvent::Signal(signal) = event {
                println!("! {}", describe(signal));
            }
        })
        .await;
    print_messages(&session.snapshot().await);

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let mut parts = line.splitn(3, ' ');
        match parts.next().unwrap_or_default() {
            "" => continue,
            "/quit" => break,
            "/offline" => session.set_connectivity(false).await,
            "/online" => session.set_connectivity(true).await,
            "/resubscribe" => session.resubscribe().await,
            "/retry" => {
                let n = session.retry_failed().await;
                println!("re-sent {} messages", n);
            }
            "/fail" => backend.set_fail_writes(parts.next() == Some("on")),
            "/peer" => {
                let text = line.trim_start_matches("/peer").trim();
                backend.inject(peer.clone(), text);
            }
            "/logout" => {
                session.logout().await;
            }
            "/react" => {
                let snapshot = session.snapshot().await;
                let target = parts
                    .next()
                    .and_then(|n| n.parse::<usize>().ok())
                    .and_then(|n| snapshot.get(n));
                let emoji = parts.next().unwrap_or("👍");
                match target {
                    Some(msg) => {
                        if let Err(e) = session.add_reaction(msg.id(), emoji, &me.id).await {
                            println!("! {}", e);
                        }
                    }
                    None => println!("usage: /react <n> <emoji>"),
                }
            }
            _ => {
                if let Err(e) = session.send(Draft::text(&me.id, &me.name, line)).await {
                    println!("! {}", e);
                }
            }
        }
        // Give the loopback feed a moment to echo.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        print_messages(&session.snapshot().await);
    }

    session.shutdown().await;
    Ok(())
}
