//! Read-only object commands: listing, search, metadata, previews, URLs.

use std::time::Duration;

use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use cloudshelf_core::result::AppResult;
use cloudshelf_core::types::{ListOptions, ListResult, ObjectEntry, SearchOptions};

use super::Context;
use crate::output::{self, OutputFormat};

/// Arguments for the ls command
#[derive(Debug, Args)]
pub struct LsArgs {
    /// Key prefix to list under
    #[arg(default_value = "")]
    pub prefix: String,
    /// List every key under the prefix without grouping into folders
    #[arg(short, long)]
    pub recursive: bool,
    /// Page size
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub max_keys: u32,
    /// Resume from a continuation token printed by a previous page
    #[arg(short, long)]
    pub token: Option<String>,
    /// Follow continuation tokens until the listing is exhausted
    #[arg(short, long)]
    pub all: bool,
}

/// Arguments for the search command
#[derive(Debug, Args)]
pub struct SearchArgs {
    /// Case-insensitive substring to look for in keys
    pub term: String,
    /// Only search under this prefix
    #[arg(long, default_value = "")]
    pub prefix: String,
    /// Stop after this many matches
    #[arg(short, long)]
    pub limit: Option<usize>,
}

/// A single object key
#[derive(Debug, Args)]
pub struct KeyArgs {
    /// Object key
    pub key: String,
}

/// Arguments for the cat command
#[derive(Debug, Args)]
pub struct CatArgs {
    /// Object key
    pub key: String,
    /// Largest object to print, in bytes
    #[arg(short, long)]
    pub max_size: Option<u64>,
}

/// Arguments for the url command
#[derive(Debug, Args)]
pub struct UrlArgs {
    /// Object key
    pub key: String,
    /// Sign the URL, valid for this many seconds
    #[arg(short, long)]
    pub expires: Option<u64>,
    /// Sign the URL with the configured default lifetime
    #[arg(short, long)]
    pub signed: bool,
}

/// Listing display row
#[derive(Debug, Serialize, Tabled)]
struct EntryRow {
    /// Key
    key: String,
    /// Size
    size: String,
    /// Last modified
    modified: String,
    /// Storage class
    class: String,
}

impl From<&ObjectEntry> for EntryRow {
    fn from(entry: &ObjectEntry) -> Self {
        Self {
            key: entry.key.clone(),
            size: output::format_bytes(entry.size),
            modified: output::format_time(entry.last_modified),
            class: entry.storage_class.clone(),
        }
    }
}

/// List one page, or every page with `--all`.
pub async fn ls(args: &LsArgs, ctx: &Context) -> AppResult<()> {
    let (_, provider) = ctx.provider().await?;
    let mut options = if args.recursive {
        ListOptions::recursive(args.prefix.clone())
    } else {
        ListOptions::under(args.prefix.clone())
    };
    options.max_keys = args.max_keys;
    options.continuation_token = args.token.clone();

    let mut listing = provider.list_files(&options).await?;
    while args.all && listing.is_truncated {
        options = options.resume(listing.next_continuation_token.take());
        let page = provider.list_files(&options).await?;
        listing.files.extend(page.files);
        listing.folders.extend(page.folders);
        listing.next_continuation_token = page.next_continuation_token;
        listing.is_truncated = page.is_truncated;
    }

    match ctx.format {
        OutputFormat::Json => output::print_json(&listing),
        OutputFormat::Table => print_listing(&listing),
    }
    Ok(())
}

fn print_listing(listing: &ListResult) {
    let rows: Vec<EntryRow> = listing
        .folders
        .iter()
        .map(|folder| EntryRow {
            key: folder.key.clone(),
            size: "-".into(),
            modified: "-".into(),
            class: "DIR".into(),
        })
        .chain(listing.files.iter().map(EntryRow::from))
        .collect();
    output::print_list(&rows, OutputFormat::Table);
    if let Some(token) = &listing.next_continuation_token {
        println!("More results available; continue with --token {token}");
    }
}

/// Search keys by substring.
pub async fn search(args: &SearchArgs, ctx: &Context) -> AppResult<()> {
    let (_, provider) = ctx.provider().await?;
    let options = SearchOptions {
        prefix: args.prefix.clone(),
        page_size: ctx.config.transfer.search_page_size,
        limit: args.limit,
    };
    let result = provider.search_files(&args.term, &options).await?;
    match ctx.format {
        OutputFormat::Json => output::print_json(&result),
        OutputFormat::Table => {
            let rows: Vec<EntryRow> = result.files.iter().map(EntryRow::from).collect();
            output::print_list(&rows, OutputFormat::Table);
            println!("{} match(es)", result.total);
        }
    }
    Ok(())
}

/// Print object metadata.
pub async fn info(args: &KeyArgs, ctx: &Context) -> AppResult<()> {
    let (_, provider) = ctx.provider().await?;
    let info = provider.get_file_info(&args.key).await?;
    output::print_record(
        &info,
        &[
            ("Key", info.key.clone()),
            ("Size", format!("{} ({} bytes)", output::format_bytes(info.size), info.size)),
            ("Modified", output::format_time(info.last_modified)),
            ("ETag", info.etag.clone().unwrap_or_else(|| "-".into())),
            ("Content type", info.content_type.clone().unwrap_or_else(|| "-".into())),
            ("Storage class", info.storage_class.clone()),
        ],
        ctx.format,
    );
    Ok(())
}

/// Print whether an object exists.
pub async fn exists(args: &KeyArgs, ctx: &Context) -> AppResult<()> {
    let (_, provider) = ctx.provider().await?;
    let exists = provider.file_exists(&args.key).await?;
    match ctx.format {
        OutputFormat::Json => output::print_json(&exists),
        OutputFormat::Table => println!("{exists}"),
    }
    Ok(())
}

/// Print a text preview.
pub async fn cat(args: &CatArgs, ctx: &Context) -> AppResult<()> {
    let (_, provider) = ctx.provider().await?;
    let preview = provider.get_file_content(&args.key, args.max_size).await?;
    match ctx.format {
        OutputFormat::Json => output::print_json(&preview),
        OutputFormat::Table if preview.too_large => output::print_warning(&format!(
            "'{}' is {} which exceeds the preview limit; use download instead",
            args.key,
            output::format_bytes(preview.size)
        )),
        OutputFormat::Table => {
            if preview.binary {
                output::print_warning("Binary content");
            }
            if let Some(content) = &preview.content {
                println!("{content}");
            }
        }
    }
    Ok(())
}

/// Print the public or signed URL of an object.
pub async fn url(args: &UrlArgs, ctx: &Context) -> AppResult<()> {
    let (_, provider) = ctx.provider().await?;
    let url = match (args.expires, args.signed) {
        (Some(secs), _) => {
            provider
                .get_presigned_url(&args.key, Some(Duration::from_secs(secs)))
                .await?
        }
        (None, true) => provider.get_presigned_url(&args.key, None).await?,
        (None, false) => provider.get_public_url(&args.key).await?,
    };
    match ctx.format {
        OutputFormat::Json => output::print_json(&url),
        OutputFormat::Table => println!("{url}"),
    }
    Ok(())
}
