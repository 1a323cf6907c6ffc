use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Args;

use crate::coordinator::CoordinatorConfig;

pub const DEFAULT_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Port the HTTP and WebSocket listener binds to.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Interface to bind.
    #[arg(long, env = "RENDEZVOUS_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Directory served for any path other than `/`, `/ws` and the ops routes.
    #[arg(long, env = "RENDEZVOUS_STATIC_DIR", default_value = "public")]
    pub static_dir: PathBuf,

    /// Page served at `/`.
    #[arg(long, env = "RENDEZVOUS_INDEX_FILE", default_value = "views/index.html")]
    pub index_file: PathBuf,

    /// Frames queued per connection before it counts as a failed writer.
    #[arg(long, env = "RENDEZVOUS_CHANNEL_DEPTH", default_value_t = DEFAULT_CHANNEL_DEPTH)]
    pub channel_depth: usize,

    /// Drop answers that do not match a pending offer.
    #[arg(long, env = "RENDEZVOUS_STRICT_NEGOTIATION", default_value_t = false)]
    pub strict_negotiation: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "RENDEZVOUS_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub http: HttpConfig,
    pub channel_depth: usize,
    pub coordinator: CoordinatorConfig,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub static_dir: PathBuf,
    pub index_file: PathBuf,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            static_dir: PathBuf::from("public"),
            index_file: PathBuf::from("views/index.html"),
        }
    }
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let host: IpAddr = args
            .bind_host
            .parse()
            .with_context(|| format!("invalid bind host: {}", args.bind_host))?;
        if args.channel_depth == 0 {
            bail!("channel depth must be greater than zero");
        }

        Ok(ServerConfig {
            listen_addr: SocketAddr::new(host, args.port),
            http: HttpConfig {
                static_dir: args.static_dir,
                index_file: args.index_file,
            },
            channel_depth: args.channel_depth,
            coordinator: CoordinatorConfig {
                strict_negotiation: args.strict_negotiation,
            },
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        serve: ServeArgs,
    }

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let cli = TestCli::try_parse_from(std::iter::once("test").chain(args.iter().copied()))?;
        ServerConfig::try_from(cli.serve)
    }

    #[test]
    fn port_and_host_form_listen_addr() {
        let config = parse(&["--port", "8088", "--bind-host", "127.0.0.1"]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8088".parse().unwrap());
        assert!(!config.coordinator.strict_negotiation);
    }

    #[test]
    fn rejects_bad_host_and_zero_depth() {
        assert!(parse(&["--bind-host", "not-an-ip"]).is_err());
        assert!(parse(&["--channel-depth", "0"]).is_err());
    }

    #[test]
    fn strict_negotiation_flag() {
        let config = parse(&["--strict-negotiation"]).unwrap();
        assert!(config.coordinator.strict_negotiation);
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
    }
}
