use clap::{Args, Parser, Subcommand};

use crate::{
    framing::Framing,
    server::{DEFAULT_HOST, DEFAULT_PORT, ServerConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting TCP connections until interrupted.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Host address to listen on.
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// How messages are delimited on the wire.
    #[arg(long, value_enum, default_value_t = Framing::Raw)]
    pub framing: Framing,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            framing: args.framing,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname announced to the other participants.
    #[arg(long)]
    pub nickname: String,

    /// Host address of the relay.
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port of the relay.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Must match the relay's framing.
    #[arg(long, value_enum, default_value_t = Framing::Raw)]
    pub framing: Framing,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn server_defaults() {
        let cli = Cli::parse_from(["chat-relay", "server"]);
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(ServerConfig::from(args), ServerConfig::default());
    }

    #[test]
    fn client_accepts_line_framing() {
        let cli = Cli::parse_from([
            "chat-relay",
            "client",
            "--nickname",
            "alice",
            "--port",
            "6000",
            "--framing",
            "line",
        ]);
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert_eq!(args.nickname, "alice");
        assert_eq!(args.host, "127.0.0.1");
        assert_eq!(args.port, 6000);
        assert_eq!(args.framing, Framing::Line);
    }
}
