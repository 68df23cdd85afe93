//! Object deletion command.

use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use cloudshelf_core::AppError;
use cloudshelf_core::result::AppResult;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_core::types::{DeleteOutcome, ListOptions};

use super::Context;
use crate::output::{self, OutputFormat};

/// Arguments for the rm command
#[derive(Debug, Args)]
pub struct RmArgs {
    /// Keys to delete; with --recursive, prefixes
    #[arg(required = true)]
    pub keys: Vec<String>,
    /// Delete every object under each given prefix
    #[arg(short, long)]
    pub recursive: bool,
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

/// Failed deletion display row
#[derive(Debug, Serialize, Tabled)]
struct FailureRow {
    /// Key
    key: String,
    /// Reason
    error: String,
}

/// Delete one key directly, several through the batched path.
pub async fn execute(args: &RmArgs, ctx: &Context) -> AppResult<()> {
    let (name, provider) = ctx.provider().await?;

    let keys = if args.recursive {
        expand_prefixes(provider.as_ref(), &args.keys).await?
    } else {
        args.keys.clone()
    };
    if keys.is_empty() {
        output::print_warning("Nothing to delete");
        return Ok(());
    }

    if (keys.len() > 1 || args.recursive) && !args.yes {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!("Delete {} object(s) from '{name}'?", keys.len()))
            .default(false)
            .interact()
            .map_err(|e| AppError::internal(format!("Input error: {e}")))?;
        if !confirmed {
            output::print_warning("Aborted");
            return Ok(());
        }
    }

    let outcome = if let [key] = keys.as_slice() {
        provider.delete_file(key).await?;
        DeleteOutcome {
            deleted: vec![key.clone()],
            failed: Vec::new(),
        }
    } else {
        provider.delete_files(&keys).await?
    };

    report(&outcome, ctx.format);
    if outcome.is_complete() {
        Ok(())
    } else {
        Err(AppError::partial_failure(format!(
            "{} of {} deletions failed",
            outcome.failed.len(),
            keys.len()
        )))
    }
}

/// Every key under each prefix, walking all listing pages.
async fn expand_prefixes(provider: &dyn StorageProvider, prefixes: &[String]) -> AppResult<Vec<String>> {
    let mut keys = Vec::new();
    for prefix in prefixes {
        let mut options = ListOptions::recursive(prefix.clone());
        loop {
            let page = provider.list_files(&options).await?;
            keys.extend(page.files.into_iter().map(|f| f.key));
            match page.next_continuation_token {
                Some(token) => options = options.resume(Some(token)),
                None => break,
            }
        }
    }
    keys.sort();
    keys.dedup();
    Ok(keys)
}

fn report(outcome: &DeleteOutcome, format: OutputFormat) {
    if format == OutputFormat::Json {
        output::print_json(outcome);
        return;
    }
    output::print_success(&format!("Deleted {} object(s)", outcome.deleted.len()));
    if !outcome.failed.is_empty() {
        let rows: Vec<FailureRow> = outcome
            .failed
            .iter()
            .map(|f| FailureRow {
                key: f.key.clone(),
                error: f.error.clone(),
            })
            .collect();
        output::print_list(&rows, format);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudshelf_core::config::provider::{BackendConfig, LocalConfig, ProviderConfig};
    use cloudshelf_core::config::transfer::TransferConfig;
    use cloudshelf_storage::providers::LocalStorageProvider;

    #[tokio::test]
    async fn test_expand_prefixes_walks_every_page() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            let path = dir.path().join("logs").join(format!("{i}.log"));
            tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
            tokio::fs::write(&path, b"x").await.unwrap();
        }
        tokio::fs::write(dir.path().join("keep.txt"), b"x").await.unwrap();

        let profile = ProviderConfig::new(BackendConfig::Local(LocalConfig {
            root_path: dir.path().display().to_string(),
        }));
        let provider = LocalStorageProvider::new(profile, TransferConfig::default())
            .await
            .unwrap();

        let keys = expand_prefixes(&provider, &["logs/".to_string()]).await.unwrap();
        assert_eq!(keys.len(), 5);
        assert!(keys.iter().all(|k| k.starts_with("logs/")));
    }
}
