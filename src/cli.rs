//! Command-line surface for `stabctl` (spec §4.7 / §6 CLI table).

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "stabctl", version, about = "Stabsstelle edge sync agent")]
pub struct Cli {
    /// Override the config directory (else $STABCTL_CONFIG_DIR, else platform default).
    #[arg(long, global = true)]
    pub config_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate a license key against the central authority (or offline cache).
    Validate {
        #[arg(long, env = "LICENSE_KEY")]
        license_key: String,
    },
    /// Register this device with the central authority.
    Register {
        #[arg(long, env = "LICENSE_KEY")]
        license_key: String,
    },
    /// Check whether the current license is valid, without contacting the server.
    Check,
    /// Print device identity and license/sync status as JSON.
    Info,
    /// Run one sync cycle and exit.
    Sync {
        #[arg(long, value_enum, default_value = "bidirectional")]
        mode: SyncModeArg,
    },
    /// Run the initial bulk import from the central authority.
    Initial,
    /// Run the scheduler loop until terminated.
    Daemon {
        /// Override the configured sync interval, in seconds.
        #[arg(long)]
        interval: Option<u64>,
        /// Legacy API key used for heartbeat pings; omit to disable heartbeats.
        #[arg(long, env = "API_KEY")]
        api_key: Option<String>,
    },
    /// Send a single heartbeat and exit.
    Heartbeat {
        #[arg(long, env = "API_KEY")]
        api_key: String,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum SyncModeArg {
    Push,
    Pull,
    Bidirectional,
}

impl From<SyncModeArg> for stabsstelle_sync::SyncMode {
    fn from(value: SyncModeArg) -> Self {
        match value {
            SyncModeArg::Push => stabsstelle_sync::SyncMode::Push,
            SyncModeArg::Pull => stabsstelle_sync::SyncMode::Pull,
            SyncModeArg::Bidirectional => stabsstelle_sync::SyncMode::Bidirectional,
        }
    }
}
