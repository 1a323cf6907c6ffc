use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::config::ServeArgs;
use crate::envelope::{register_frame, Envelope};
use crate::presence::PresenceSnapshot;

#[derive(Parser, Debug)]
#[command(name = "beach-rendezvous")]
#[command(about = "Beach rendezvous signaling relay and watch client")]
#[command(after_help = "Only PORT is needed by existing deployments. The RENDEZVOUS_* \
variables are optional extensions and all have defaults.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register under a name and print presence updates and relayed envelopes
    Watch {
        /// Relay URL (e.g., ws://localhost:3000)
        #[arg(short, long, default_value = "ws://localhost:3000")]
        url: String,

        /// Display name to register
        #[arg(short, long)]
        name: String,

        /// Exit after this many frames
        #[arg(short, long)]
        count: Option<usize>,
    },
}

pub async fn run_watch_client(url: String, name: String, count: Option<usize>) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {}: {}", ws_url, e);
            return Err(anyhow!("connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow!("connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let join_text = register_frame(&name, Utc::now().timestamp_millis());
    write.send(Message::Text(join_text.into())).await?;

    let mut seen = 0usize;
    loop {
        if count.is_some_and(|limit| seen >= limit) {
            break;
        }
        let next = tokio::select! {
            next = read.next() => next,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(message) = next else {
            println!("relay closed the connection");
            break;
        };
        match message? {
            Message::Text(text) => {
                println!("{}", describe_frame(&text));
                seen += 1;
            }
            Message::Close(_) => {
                println!("relay closed the connection");
                break;
            }
            _ => {}
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}

fn describe_frame(text: &str) -> String {
    if let Ok(snapshot) = serde_json::from_str::<PresenceSnapshot>(text) {
        return format!("online ({}): {}", snapshot.users.len(), snapshot.names().join(", "));
    }
    match Envelope::parse(text) {
        Ok(envelope) => format!(
            "{} from {} -> {}: {}",
            envelope.kind().as_str(),
            envelope.sender_name().unwrap_or("?"),
            envelope.target().unwrap_or("everyone"),
            text
        ),
        Err(_) => format!("unrecognised frame: {}", text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_presence_and_envelopes() {
        let presence = r#"{"users":[{"name":"alice","id":"67e55044-10b1-426f-9247-bb680e5fe0c8","date":1}]}"#;
        assert_eq!(describe_frame(presence), "online (1): alice");

        let offer = r#"{"type":"offer","name":"alice","target":"bob"}"#;
        assert!(describe_frame(offer).starts_with("offer from alice -> bob"));

        let broadcast = r#"{"type":"ice-candidate","name":"bob"}"#;
        assert!(describe_frame(broadcast).starts_with("ice-candidate from bob -> everyone"));

        assert!(describe_frame("garbage").starts_with("unrecognised"));

        let spoof = r#"{"type":"chat","users":[{"name":"ghost","id":"67e55044-10b1-426f-9247-bb680e5fe0c8","date":1}]}"#;
        assert!(!describe_frame(spoof).starts_with("online"));
    }
}
