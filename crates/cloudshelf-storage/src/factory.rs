//! Maps a normalized profile to its Facade.

use std::sync::Arc;

use tracing::debug;

use cloudshelf_core::config::provider::ProviderConfig;
use cloudshelf_core::config::transfer::TransferConfig;
use cloudshelf_core::result::AppResult;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_core::types::ProviderType;

use crate::providers::{
    AzureStorageProvider, B2StorageProvider, CosStorageProvider, DropboxStorageProvider,
    GithubStorageProvider, LocalStorageProvider, OssStorageProvider, QiniuStorageProvider,
    S3StorageProvider, UpyunStorageProvider, WebDavStorageProvider,
};

/// Construct the provider for `profile`, normalizing it first.
pub async fn build(
    profile: ProviderConfig,
    transfer: TransferConfig,
) -> AppResult<Arc<dyn StorageProvider>> {
    let profile = profile.normalize()?;
    debug!(provider = %profile.provider_type(), "Building storage provider");

    let provider: Arc<dyn StorageProvider> = match profile.provider_type() {
        ProviderType::S3 => Arc::new(S3StorageProvider::new(profile, transfer)?),
        ProviderType::Oss => Arc::new(OssStorageProvider::new(profile, transfer)?),
        ProviderType::Cos => Arc::new(CosStorageProvider::new(profile, transfer)?),
        ProviderType::Qiniu => Arc::new(QiniuStorageProvider::new(profile, transfer)?),
        ProviderType::Upyun => Arc::new(UpyunStorageProvider::new(profile, transfer)?),
        ProviderType::Github => Arc::new(GithubStorageProvider::new(profile, transfer)?),
        ProviderType::Webdav => Arc::new(WebDavStorageProvider::new(profile, transfer)?),
        ProviderType::Azure => Arc::new(AzureStorageProvider::new(profile, transfer)?),
        ProviderType::B2 => Arc::new(B2StorageProvider::new(profile, transfer)?),
        ProviderType::Dropbox => Arc::new(DropboxStorageProvider::new(profile, transfer)?),
        ProviderType::Local => Arc::new(LocalStorageProvider::new(profile, transfer).await?),
    };
    Ok(provider)
}
