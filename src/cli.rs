use clap::{Parser, Subcommand};

/// Authentication and integration credential service
#[derive(Parser)]
#[command(name = "gatehouse", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to bind (defaults to GATEHOUSE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
        /// Use in-memory stores instead of Postgres and Redis
        #[arg(long)]
        memory: bool,
    },

    /// Manage the field-encryption keyset
    Keyset {
        #[command(subcommand)]
        command: KeysetCommands,
    },

    /// Manage the token signing key
    SigningKey {
        #[command(subcommand)]
        command: SigningKeyCommands,
    },

    /// Encrypt plaintext values left in a secret column
    EncryptColumn {
        #[arg(long)]
        table: String,
        #[arg(long)]
        column: String,
        #[arg(long, default_value = "500")]
        batch_size: usize,
        #[arg(long, default_value = "1000")]
        progress_every: usize,
    },

    /// Issue personal access tokens and API tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
pub enum KeysetCommands {
    /// Print a new base64 keyset with one key
    Generate,
    /// Add a new primary key to OPENLANE_TINK_KEYSET and print the result
    Rotate,
    /// Disable all but the newest keys
    DisableOld {
        #[arg(long, default_value = "2")]
        keep: usize,
    },
    /// Show key ids and status. Key material is never printed.
    Info,
}

#[derive(Subcommand)]
pub enum SigningKeyCommands {
    /// Print a new base64 PKCS#8 Ed25519 key
    Generate,
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Create a personal access token for a user
    CreatePat {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        name: String,
        /// Organizations the token is authorized for
        #[arg(long, value_delimiter = ',', required = true)]
        organization_ids: Vec<String>,
        /// Lifetime in days; omit for a non-expiring token
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
    /// Create an API token owned by an organization
    CreateApi {
        #[arg(long)]
        organization_id: String,
        #[arg(long)]
        name: String,
        #[arg(long, value_delimiter = ',')]
        scopes: Vec<String>,
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
}
