//! CLI command definitions and dispatch.

pub mod browse;
pub mod profiles;
pub mod remove;
pub mod transfer;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::debug;

use cloudshelf_core::config::AppConfig;
use cloudshelf_core::result::AppResult;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_storage::factory;

use crate::output::OutputFormat;

/// Cloudshelf: one command line for many object stores
#[derive(Debug, Parser)]
#[command(name = "cloudshelf", version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config/cloudshelf.toml")]
    pub config: String,

    /// Storage profile to use instead of the default one
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "table")]
    pub format: OutputFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List configured profiles
    Profiles,
    /// Test connectivity of one profile, or all with --all
    Test(profiles::TestArgs),
    /// List objects and folders
    Ls(browse::LsArgs),
    /// Find objects whose key contains a term
    Search(browse::SearchArgs),
    /// Show object metadata
    Info(browse::KeyArgs),
    /// Check whether an object exists
    Exists(browse::KeyArgs),
    /// Print a size-limited preview of an object
    Cat(browse::CatArgs),
    /// Print an object's URL
    Url(browse::UrlArgs),
    /// Upload a local file
    Upload(transfer::UploadArgs),
    /// Download an object to a local file
    Download(transfer::DownloadArgs),
    /// Delete objects
    Rm(remove::RmArgs),
}

/// Loaded configuration plus the global flags every command shares.
pub struct Context {
    /// Application configuration.
    pub config: AppConfig,
    /// Explicit `--profile`, if any.
    pub profile: Option<String>,
    /// Selected output format.
    pub format: OutputFormat,
}

impl Context {
    /// Build the provider for the selected profile.
    pub async fn provider(&self) -> AppResult<(String, Arc<dyn StorageProvider>)> {
        let name = match &self.profile {
            Some(name) => name.clone(),
            None => self.config.default_profile_name()?,
        };
        let profile = self.config.profile(&name)?;
        debug!(profile = %name, kind = %profile.provider_type(), "Building provider");
        let provider = factory::build(profile, self.config.transfer.clone()).await?;
        Ok((name, provider))
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(&self, config: AppConfig) -> AppResult<()> {
        let ctx = Context {
            config,
            profile: self.profile.clone(),
            format: self.format,
        };
        match &self.command {
            Commands::Profiles => profiles::list(&ctx),
            Commands::Test(args) => profiles::test(args, &ctx).await,
            Commands::Ls(args) => browse::ls(args, &ctx).await,
            Commands::Search(args) => browse::search(args, &ctx).await,
            Commands::Info(args) => browse::info(args, &ctx).await,
            Commands::Exists(args) => browse::exists(args, &ctx).await,
            Commands::Cat(args) => browse::cat(args, &ctx).await,
            Commands::Url(args) => browse::url(args, &ctx).await,
            Commands::Upload(args) => transfer::upload(args, &ctx).await,
            Commands::Download(args) => transfer::download(args, &ctx).await,
            Commands::Rm(args) => remove::execute(args, &ctx).await,
        }
    }
}
