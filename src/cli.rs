use clap::{Parser, Subcommand};

/// MCP Gateway — multi-tenant reverse proxy for MCP servers
#[derive(Parser)]
#[command(name = "mcpgw", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway server (default).
    Serve {
        /// Override the configured API port.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Manage local principals without the UI.
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Manage API keys without the UI.
    Apikey {
        #[command(subcommand)]
        command: ApiKeyCommands,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Create a local user.
    Create {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        password: String,
        /// Repeatable; defaults to "user".
        #[arg(long = "role")]
        roles: Vec<String>,
    },
    /// List every principal.
    List,
}

#[derive(Subcommand)]
pub enum ApiKeyCommands {
    /// Issue a key for a principal; the token is printed once.
    Create {
        #[arg(long)]
        email: String,
    },
    /// List a principal's active keys.
    List {
        #[arg(long)]
        email: String,
    },
    /// Revoke a key by id.
    Revoke {
        #[arg(long)]
        email: String,
        #[arg(long)]
        id: uuid::Uuid,
    },
}
