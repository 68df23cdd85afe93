//! Profile listing and connection test commands.

use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use cloudshelf_core::result::AppResult;
use cloudshelf_core::types::ConnectionStatus;
use cloudshelf_storage::StorageManager;

use super::Context;
use crate::output;

/// Arguments for the test command
#[derive(Debug, Args)]
pub struct TestArgs {
    /// Test every configured profile
    #[arg(short, long)]
    pub all: bool,
}

/// Profile display row
#[derive(Debug, Serialize, Tabled)]
struct ProfileRow {
    /// Profile name
    name: String,
    /// Provider type
    provider: String,
    /// Bucket, container, or repository
    bucket: String,
    /// Custom domain
    domain: String,
    /// Private
    private: String,
    /// Default
    default: String,
}

/// Connection test display row
#[derive(Debug, Serialize, Tabled)]
struct StatusRow {
    /// Profile name
    profile: String,
    /// Result
    status: String,
    /// Message or error
    detail: String,
}

impl StatusRow {
    fn new(profile: String, status: &ConnectionStatus) -> Self {
        Self {
            profile,
            status: if status.success { "✓ ok" } else { "✗ failed" }.to_string(),
            detail: status
                .message
                .clone()
                .or_else(|| status.error.clone())
                .unwrap_or_default(),
        }
    }
}

/// List configured profiles without contacting any backend.
pub fn list(ctx: &Context) -> AppResult<()> {
    let default = ctx.config.default_profile_name().ok();
    let rows: Vec<ProfileRow> = ctx
        .config
        .profiles
        .iter()
        .map(|(name, profile)| ProfileRow {
            name: name.clone(),
            provider: profile.provider_type().display_name().to_string(),
            bucket: profile.backend.bucket_label(),
            domain: profile.custom_domain.clone().unwrap_or_else(|| "-".into()),
            private: if profile.private { "yes" } else { "no" }.to_string(),
            default: if default.as_deref() == Some(name.as_str()) { "✓" } else { "" }.to_string(),
        })
        .collect();
    output::print_list(&rows, ctx.format);
    Ok(())
}

/// Test one profile, or every profile with `--all`.
pub async fn test(args: &TestArgs, ctx: &Context) -> AppResult<()> {
    if args.all {
        let manager = StorageManager::from_config(&ctx.config).await;
        let results = manager.test_all().await;
        match ctx.format {
            output::OutputFormat::Json => output::print_json(&results),
            output::OutputFormat::Table => {
                let rows: Vec<StatusRow> = results
                    .iter()
                    .map(|(name, status)| StatusRow::new(name.clone(), status))
                    .collect();
                output::print_list(&rows, ctx.format);
            }
        }
        return Ok(());
    }

    let (name, provider) = ctx.provider().await?;
    let status = provider.test_connection().await;
    output::print_record(
        &status,
        &[
            ("Profile", name),
            ("Provider", provider.provider_type().display_name().to_string()),
            ("Success", status.success.to_string()),
            (
                "Detail",
                status
                    .message
                    .clone()
                    .or_else(|| status.error.clone())
                    .unwrap_or_default(),
            ),
        ],
        ctx.format,
    );
    Ok(())
}
