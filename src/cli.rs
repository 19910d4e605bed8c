//! CLI argument definitions for ghb.

use clap::{Args, Parser, Subcommand};

use crate::github::{Entity, EntityKind};

/// ghb - manage self-hosted GitHub Actions runners under GNU pies.
#[derive(Parser, Debug)]
#[command(name = "ghb")]
#[command(version, about = "Manage self-hosted GitHub Actions runners under GNU pies", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Set up the GHB subsystem
    Setup {
        /// Your GitHub user name
        user: String,
    },

    /// Add a runner
    Add {
        #[command(flatten)]
        entity: EntityArgs,

        /// Project name
        project: Option<String>,

        /// Project URL
        #[arg(short, long, value_name = "URL")]
        url: Option<String>,

        /// Registration token (bypasses the token cache)
        #[arg(short, long, value_name = "STRING")]
        token: Option<String>,

        /// Extra labels in addition to the default
        #[arg(short, long, value_name = "STRING")]
        labels: Option<String>,
    },

    /// Delete a runner
    Delete {
        #[command(flatten)]
        entity: EntityArgs,

        /// Project name
        project: String,

        /// Runner number (defaults to the last one)
        number: Option<u32>,

        /// Keep the configured runner directory
        #[arg(short, long, conflicts_with = "force")]
        keep: bool,

        /// Force removal of the runner directory
        #[arg(short, long)]
        force: bool,

        /// Removal token
        #[arg(long, value_name = "STRING")]
        token: Option<String>,
    },

    /// List existing runners
    List {
        /// Verbosely list each runner location
        #[arg(short, long)]
        verbose: bool,
    },

    /// Check ghb system status
    Status {
        /// Increase verbosity
        #[arg(short, long)]
        verbose: bool,
    },

    /// Start the GNU pies supervisor
    Start,

    /// Stop the GNU pies supervisor
    Stop,

    /// Restart the GNU pies supervisor
    Restart,

    /// Check the current configuration
    Configcheck {
        /// Show the configuration
        #[arg(short, long)]
        list: bool,
    },

    /// Manage personal access tokens
    Pat {
        #[command(flatten)]
        entity: EntityArgs,

        /// Set a new PAT
        #[arg(short = 's', long = "set", value_name = "STRING")]
        set: Option<String>,

        /// Expiration time: +DURATION or "YYYY-MM-DD HH:MM:SS"
        #[arg(short, long, value_name = "STRING")]
        expires: Option<String>,

        /// Delete the PAT
        #[arg(short, long, conflicts_with = "set")]
        delete: bool,

        /// List all keys for the given entity
        #[arg(short, long)]
        all: bool,
    },
}

/// The GitHub scope a command operates on; exactly one must be given.
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct EntityArgs {
    /// Organization
    #[arg(long, value_name = "NAME")]
    pub org: Option<String>,

    /// Enterprise
    #[arg(long, value_name = "NAME")]
    pub enterprise: Option<String>,

    /// Repository: OWNER or OWNER/PROJECT
    #[arg(long, value_name = "NAME")]
    pub repo: Option<String>,
}

impl EntityArgs {
    pub fn entity(&self) -> Entity {
        if let Some(name) = &self.org {
            Entity::new(EntityKind::Org, name)
        } else if let Some(name) = &self.enterprise {
            Entity::new(EntityKind::Enterprise, name)
        } else {
            let name = self.repo.as_ref().expect("clap enforces the entity group");
            Entity::new(EntityKind::Repo, name)
        }
    }
}
