use clap::{Parser, Subcommand};

/// qrlink: printed-label tokens, scan resolution and redirect rules
#[derive(Parser)]
#[command(name = "qrlink", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to bind (defaults to QRLINK_PORT)
        #[arg(short, long)]
        port: Option<u16>,
        /// Use in-memory storage with a small demo catalog instead of Postgres
        #[arg(long)]
        memory: bool,
    },

    /// Apply database migrations and exit
    Migrate,

    /// Manage label tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Manage redirect rules
    Rule {
        #[command(subcommand)]
        command: RuleCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Create one token for an entity
    Create {
        /// product, batch, inventory or custom
        #[arg(long)]
        entity_type: String,
        #[arg(long)]
        entity_id: String,
        #[arg(long)]
        version_id: Option<String>,
        /// RFC 3339 timestamp
        #[arg(long)]
        expires_at: Option<String>,
        #[arg(long, env = "QRLINK_ACTOR", default_value = "cli")]
        actor: String,
    },
    /// Create a print run of tokens in one transaction
    Batch {
        #[arg(long)]
        entity_type: String,
        #[arg(long)]
        entity_id: String,
        #[arg(long)]
        quantity: u32,
        #[arg(long)]
        version_id: Option<String>,
        #[arg(long, env = "QRLINK_ACTOR", default_value = "cli")]
        actor: String,
    },
    /// Show a token with its association history
    Show {
        /// Token id (UUID) or token value
        token: String,
    },
    /// Revoke a token
    Revoke {
        #[arg(long)]
        token_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long, env = "QRLINK_ACTOR", default_value = "cli")]
        actor: String,
    },
}

#[derive(Subcommand)]
pub enum RuleCommands {
    /// List redirect rules
    List {
        #[arg(long)]
        entity_type: Option<String>,
        #[arg(long)]
        entity_id: Option<String>,
        /// Include inactive rules
        #[arg(long)]
        all: bool,
    },
    /// Deactivate a rule
    Deactivate {
        #[arg(long)]
        id: String,
        #[arg(long, env = "QRLINK_ACTOR", default_value = "cli")]
        actor: String,
    },
    /// Designate the system fallback redirect
    SetFallback {
        #[arg(long)]
        url: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long, env = "QRLINK_ACTOR", default_value = "cli")]
        actor: String,
    },
}
