//! Demo binary for `broker_pubsub`.
//!
//! Opens a callback subscription and several pull cursors on one channel of
//! an in-process broker, publishes a batch of messages and prints what each
//! listener receives.

mod cli;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use broker_pubsub::{Framing, MemoryBroker, PubSub, PubSubConfig, TopicStrategy};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cli::{Cli, FramingArg};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DemoMessage {
    seq: usize,
    body: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Enable structured logging for the demo.
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut builder = PubSubConfig::builder().framing(match cli.framing {
        FramingArg::Envelope => Framing::Envelope,
        FramingArg::Headers => Framing::Headers,
    });
    if let Some(topic) = cli.shared_topic.clone() {
        builder = builder.topics(TopicStrategy::Shared { topic });
    }
    let pubsub: PubSub<DemoMessage> = PubSub::new(MemoryBroker::new(), builder.build()?);

    let callbacks = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&callbacks);
    let subscription = pubsub
        .subscribe(&cli.channel, move |msg: DemoMessage| {
            seen.fetch_add(1, Ordering::Relaxed);
            println!("callback  <- #{} {}", msg.seq, msg.body);
        })
        .await?;

    let mut readers = Vec::with_capacity(cli.cursors);
    for index in 0..cli.cursors {
        let cursor = pubsub.async_iterator(&cli.channel).await?;
        let count = cli.count;
        readers.push(tokio::spawn(async move {
            for _ in 0..count {
                match cursor.next().await {
                    Ok(Some(msg)) => println!("cursor {index} <- #{} {}", msg.seq, msg.body),
                    Ok(None) | Err(_) => break,
                }
            }
        }));
    }

    for seq in 0..cli.count {
        let msg = DemoMessage {
            seq,
            body: format!("message {seq} on {}", cli.channel),
        };
        pubsub.publish(&cli.channel, &msg).await?;
    }

    for reader in readers {
        reader.await?;
    }
    pubsub.unsubscribe(subscription);
    pubsub.close().await;

    println!(
        "{} callback deliveries, {} cursors drained",
        callbacks.load(Ordering::Relaxed),
        cli.cursors
    );
    Ok(())
}
