use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_PATH: &str = "./groupchat.toml";

// Flags left unset are skipped when serialized, so TOML and env values still
// apply underneath them.
/// Group chat server
#[derive(Parser, Serialize, Clone, Debug)]
#[command(name = "groupchat", version, about = "Group-scoped real-time chat server")]
pub struct Cli {
    /// Port to listen on [default: 3001]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    #[serde(skip)]
    pub config: String,

    /// SQLite database URL [default: sqlite://groupchat.db?mode=rwc]
    #[arg(long, env = "DATABASE_URL")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Maximum pooled database connections [default: 16]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_db_connections: Option<u32>,

    /// Secret used to sign and verify session tokens
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,

    /// Lifetime of issued session tokens, in seconds [default: 28800]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_ttl_secs: Option<i64>,

    /// Outbound events buffered per connection before it is dropped as too slow [default: 256]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_queue_capacity: Option<usize>,

    /// Email of the admin account created on first start [default: master@ed.com]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_email: Option<String>,

    /// Log a session token for the admin account on startup
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub print_admin_token: bool,

    /// Enable structured JSON logging
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub database_url: String,
    pub max_db_connections: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    pub token_ttl_secs: i64,
    pub send_queue_capacity: usize,
    pub admin_email: String,
    pub print_admin_token: bool,
    pub json_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            bind_address: "0.0.0.0".to_string(),
            database_url: "sqlite://groupchat.db?mode=rwc".to_string(),
            max_db_connections: 16,
            jwt_secret: None,
            token_ttl_secs: 8 * 60 * 60,
            send_queue_capacity: 256,
            admin_email: "master@ed.com".to_string(),
            print_admin_token: false,
            json_logs: false,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (GROUPCHAT_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment(Cli::parse()).extract()
    }

    fn figment(cli: Cli) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("GROUPCHAT_"))
            .merge(Serialized::defaults(cli))
    }

    pub fn token_ttl(&self) -> time::Duration {
        time::Duration::seconds(self.token_ttl_secs)
    }
}
