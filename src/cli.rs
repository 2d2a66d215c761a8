//! Command line interface for the `broker-pubsub` demo binary.
//!
//! The binary drives the adapter over the in-process broker so the fan-out
//! behaviour can be observed without external infrastructure.

use clap::{Parser, ValueEnum};

/// Where the channel name travels on each record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FramingArg {
    Envelope,
    Headers,
}

/// Command line arguments for the `broker-pubsub` binary.
#[derive(Debug, Parser)]
#[command(
    name = "broker-pubsub",
    version,
    about = "Publish messages through the pub/sub adapter and watch them fan out"
)]
pub struct Cli {
    /// Channel to publish on.
    #[arg(short, long, default_value = "demo")]
    pub channel: String,

    /// Number of messages to publish.
    #[arg(short = 'n', long, default_value_t = 5)]
    pub count: usize,

    /// Number of pull cursors to open on the channel.
    #[arg(long, default_value_t = 2)]
    pub cursors: usize,

    /// Share one broker topic between all channels.
    #[arg(long)]
    pub shared_topic: Option<String>,

    /// Record framing.
    #[arg(long, value_enum, default_value_t = FramingArg::Envelope)]
    pub framing: FramingArg,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, FramingArg};

    #[test]
    fn defaults_apply_without_arguments() {
        let cli = Cli::parse_from(["broker-pubsub"]);
        assert_eq!(cli.channel, "demo");
        assert_eq!(cli.count, 5);
        assert_eq!(cli.cursors, 2);
        assert_eq!(cli.framing, FramingArg::Envelope);
        assert!(cli.shared_topic.is_none());
    }

    #[test]
    fn parses_framing_and_topic() {
        let cli = Cli::parse_from([
            "broker-pubsub",
            "--channel",
            "orders",
            "-n",
            "3",
            "--shared-topic",
            "events",
            "--framing",
            "headers",
        ]);
        assert_eq!(cli.channel, "orders");
        assert_eq!(cli.count, 3);
        assert_eq!(cli.shared_topic.as_deref(), Some("events"));
        assert_eq!(cli.framing, FramingArg::Headers);
    }
}
