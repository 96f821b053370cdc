use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cairn_p2p::{FileServerConfig, Handshake, MagicHandshake, NopHandshake};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "cairn-node", version)]
#[command(about = "Replicated content-addressed file store node")]
pub struct Cli {
    /// Address to listen on for peer connections
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub listen: String,

    /// Root directory for stored files
    #[arg(long, default_value = cairn_core::store::DEFAULT_ROOT)]
    pub storage_root: PathBuf,

    /// Peer to dial at startup (repeatable)
    #[arg(long = "bootstrap", value_name = "ADDR")]
    pub bootstrap: Vec<String>,

    /// Seconds to wait for peers to answer a lookup
    #[arg(long, default_value = "5")]
    pub get_timeout_secs: u64,

    /// Connection handshake; both ends must agree
    #[arg(long, value_enum, default_value_t = HandshakeKind::Nop)]
    pub handshake: HandshakeKind,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run a node until Ctrl-C
    Serve,
    /// Run two nodes in-process, store a file on one and read it from the other
    Demo {
        /// Key to store
        #[arg(long, default_value = "My Data")]
        key: String,
        /// Content to store under the key
        #[arg(long, default_value = "Gugu Gaga Iglabo ulala")]
        content: String,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    /// Accept every connection
    Nop,
    /// Exchange a magic prefix and protocol version
    Magic,
}

impl HandshakeKind {
    pub fn build(self) -> Arc<dyn Handshake> {
        match self {
            HandshakeKind::Nop => Arc::new(NopHandshake),
            HandshakeKind::Magic => Arc::new(MagicHandshake::default()),
        }
    }
}

impl Cli {
    /// Server configuration for the `serve` command.
    pub fn server_config(&self) -> FileServerConfig {
        FileServerConfig {
            listen_addr: self.listen.clone(),
            storage_root: self.storage_root.clone(),
            bootstrap_nodes: self.bootstrap.clone(),
            handshake: self.handshake.build(),
            get_timeout: Duration::from_secs(self.get_timeout_secs),
            ..FileServerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["cairn-node", "serve"]).unwrap();
        assert_eq!(cli.command, Commands::Serve);
        assert_eq!(cli.listen, "127.0.0.1:3000");
        assert_eq!(cli.storage_root, PathBuf::from("cairn_store"));
        assert!(cli.bootstrap.is_empty());
        assert_eq!(cli.handshake, HandshakeKind::Nop);

        let config = cli.server_config();
        assert_eq!(config.get_timeout, Duration::from_secs(5));
    }

    #[test]
    fn repeated_bootstrap_and_magic_handshake() {
        let cli = Cli::try_parse_from([
            "cairn-node",
            "--listen",
            "0.0.0.0:4000",
            "--bootstrap",
            "10.0.0.1:3000",
            "--bootstrap",
            "10.0.0.2:3000",
            "--handshake",
            "magic",
            "--get-timeout-secs",
            "1",
            "-vv",
            "serve",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        let config = cli.server_config();
        assert_eq!(config.listen_addr, "0.0.0.0:4000");
        assert_eq!(config.bootstrap_nodes, ["10.0.0.1:3000", "10.0.0.2:3000"]);
        assert_eq!(config.get_timeout, Duration::from_secs(1));
        assert!(format!("{:?}", config.handshake).contains("Magic"));
    }

    #[test]
    fn demo_defaults() {
        let cli = Cli::try_parse_from(["cairn-node", "demo"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Demo {
                key: "My Data".into(),
                content: "Gugu Gaga Iglabo ulala".into(),
            }
        );
    }

    #[test]
    fn unknown_handshake_is_rejected() {
        assert!(Cli::try_parse_from(["cairn-node", "--handshake", "tls", "serve"]).is_err());
    }
}
