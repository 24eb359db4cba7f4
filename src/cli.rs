use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a peer-to-peer node", long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Port to listen on, overriding the configuration
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Skip the UPnP port mapping request
    #[arg(long)]
    pub no_upnp: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Peer to connect to at startup, as host:port or host:port=peer_id
    #[arg(long = "connect", value_name = "PEER")]
    pub peers: Vec<PeerTarget>,
}

/// An outbound peer given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    pub host: String,
    pub port: u16,
    pub peer_id: String,
}

impl FromStr for PeerTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, peer_id) = match s.split_once('=') {
            Some((addr, peer_id)) if !peer_id.is_empty() => (addr, Some(peer_id)),
            Some(_) => return Err(format!("missing peer id in '{}'", s)),
            None => (s, None),
        };

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got '{}'", addr))?;
        if host.is_empty() {
            return Err(format!("missing host in '{}'", addr));
        }
        let port = port
            .parse()
            .map_err(|_| format!("invalid port '{}'", port))?;

        Ok(Self {
            host: host.to_string(),
            port,
            peer_id: peer_id.unwrap_or(addr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_target_with_id() {
        let target: PeerTarget = "10.0.0.5:9999=alice".parse().unwrap();
        assert_eq!(target.host, "10.0.0.5");
        assert_eq!(target.port, 9999);
        assert_eq!(target.peer_id, "alice");
    }

    #[test]
    fn test_peer_target_defaults_id_to_address() {
        let target: PeerTarget = "example.org:4000".parse().unwrap();
        assert_eq!(target.peer_id, "example.org:4000");
    }

    #[test]
    fn test_peer_target_rejects_garbage() {
        assert!("no-port".parse::<PeerTarget>().is_err());
        assert!(":9999".parse::<PeerTarget>().is_err());
        assert!("host:notaport".parse::<PeerTarget>().is_err());
        assert!("host:1=".parse::<PeerTarget>().is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from([
            "social-p2p",
            "--port",
            "7000",
            "--no-upnp",
            "--connect",
            "127.0.0.1:7001=bob",
            "--connect",
            "127.0.0.1:7002",
        ]);
        assert_eq!(cli.port, Some(7000));
        assert!(cli.no_upnp);
        assert_eq!(cli.peers.len(), 2);
        assert_eq!(cli.peers[1].peer_id, "127.0.0.1:7002");
    }
}
