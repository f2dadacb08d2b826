//! Registry of configured drives and the chunk allocation policy.

use crate::error::{ErrorKind, Result};
use crate::provider::OfflineProvider;
#[cfg(feature = "s3")]
use crate::provider::{S3Options, S3Provider};
use crate::service::Service;
use crate::status::Status;
use crate::ProviderHandle;
use cirrus_meta::{DriveRecord, Repository};
use exn::{OptionExt, ResultExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::instrument;

/// Largest quota a drive row can hold (the metadata store keeps signed
/// 64-bit integers).
pub const MAX_DRIVE_QUOTA: u64 = i64::MAX as u64;

/// Builds the provider implementation for a drive row.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, id: &str, service: Service) -> Result<ProviderHandle>;
}

impl<F> ProviderFactory for F
where
    F: Fn(&str, Service) -> Result<ProviderHandle> + Send + Sync,
{
    fn build(&self, id: &str, service: Service) -> Result<ProviderHandle> {
        self(id, service)
    }
}

/// The production factory: offline drives under `data_dir`, S3 drives from
/// the configured bucket.
#[derive(Debug, Clone)]
pub struct ServiceFactory {
    data_dir: PathBuf,
    #[cfg(feature = "s3")]
    s3: Option<S3Options>,
}

impl ServiceFactory {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            #[cfg(feature = "s3")]
            s3: None,
        }
    }

    #[cfg(feature = "s3")]
    pub fn with_s3(mut self, options: S3Options) -> Self {
        self.s3 = Some(options);
        self
    }
}

impl ProviderFactory for ServiceFactory {
    fn build(&self, id: &str, service: Service) -> Result<ProviderHandle> {
        match service {
            Service::Offline => Ok(Arc::new(OfflineProvider::new(&self.data_dir, id)?)),
            #[cfg(feature = "s3")]
            Service::S3 => {
                let options = self.s3.clone().ok_or_raise(|| ErrorKind::UnknownService(service.to_string()))?;
                // Each drive gets its own prefix so several can share a bucket.
                let prefix = match &options.prefix {
                    Some(prefix) => format!("{}/{id}", prefix.trim_end_matches('/')),
                    None => id.to_string(),
                };
                Ok(Arc::new(S3Provider::new(S3Options { prefix: Some(prefix), ..options })))
            },
            #[cfg(any(test, feature = "mock"))]
            Service::Mock => Ok(Arc::new(crate::provider::MockProvider::default())),
        }
    }
}

/// Snapshot of one registered drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drive {
    pub id: String,
    pub service: Service,
    pub description: String,
    pub quota: u64,
    /// Number of chunks placed on the drive.
    pub chunks: u64,
    pub status: Status,
    pub dirty: bool,
}

impl Drive {
    fn record(&self) -> DriveRecord {
        DriveRecord {
            id: self.id.clone(),
            service: self.service.tag().to_string(),
            description: self.description.clone(),
            quota: self.quota,
            chunks: self.chunks,
        }
    }
}

struct Entry {
    drive: Drive,
    provider: ProviderHandle,
}

#[derive(Default)]
struct Inner {
    /// Registration order, which is also the allocation tie-break order.
    entries: Vec<Entry>,
    dust: Vec<String>,
}

impl Inner {
    fn entry_mut(&mut self, id: &str) -> Result<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.drive.id == id)
            .ok_or_raise(|| ErrorKind::DriveNotFound(id.to_string()))
    }
}

/// All configured drives.
///
/// Holds each drive's persisted attributes, its live [`Status`] and its
/// provider handle. Provider calls are always made with the internal lock
/// released.
pub struct DriveProviders {
    repo: Repository,
    factory: Arc<dyn ProviderFactory>,
    inner: RwLock<Inner>,
}

impl DriveProviders {
    pub fn new(repo: Repository, factory: impl ProviderFactory + 'static) -> Self {
        Self { repo, factory: Arc::new(factory), inner: RwLock::new(Inner::default()) }
    }

    /// Load every persisted drive and bring it up.
    ///
    /// A row with an unknown service tag is a configuration error and fails
    /// the whole load. A drive whose provider fails to initialize is kept in
    /// [`Status::Error`].
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        let records = self.repo.fetch_drives().await.or_raise(|| ErrorKind::Metadata)?;
        let mut loaded = Vec::with_capacity(records.len());
        for record in records {
            let service: Service = record.service.parse()?;
            let provider = self.factory.build(&record.id, service)?;
            let drive = Drive {
                id: record.id,
                service,
                description: record.description,
                quota: record.quota,
                chunks: record.chunks,
                status: Status::Unknown,
                dirty: false,
            };
            loaded.push(Entry { drive, provider });
        }
        let ids: Vec<String> = loaded.iter().map(|entry| entry.drive.id.clone()).collect();
        self.inner.write().await.entries.extend(loaded);
        for id in ids {
            self.connect(&id).await?;
        }
        tracing::info!(drives = self.inner.read().await.entries.len(), "drives loaded");
        Ok(())
    }

    /// Create a new drive of the given service.
    ///
    /// The quota starts at the provider's maximum.
    #[instrument(skip_all, fields(service = %service))]
    pub async fn add(&self, service: Service) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let provider = self.factory.build(&id, service)?;
        let quota = provider.max_quota();
        self.attach(&id, service, service.default_description(), quota, provider).await?;
        Ok(id)
    }

    /// Register a drive with an already-built provider and connect it.
    ///
    /// Quotas above [`MAX_DRIVE_QUOTA`] are capped.
    pub async fn attach(
        &self,
        id: &str,
        service: Service,
        description: &str,
        quota: u64,
        provider: ProviderHandle,
    ) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.entries.iter().any(|entry| entry.drive.id == id) {
                exn::bail!(ErrorKind::InvalidState(format!("drive {id} is already registered")));
            }
            let drive = Drive {
                id: id.to_string(),
                service,
                description: description.to_string(),
                quota: quota.min(MAX_DRIVE_QUOTA),
                chunks: 0,
                status: Status::Unknown,
                dirty: true,
            };
            inner.entries.push(Entry { drive, provider });
        }
        self.connect(id).await
    }

    /// `Unknown/Error → Connecting → Ready | Error(code)`.
    async fn connect(&self, id: &str) -> Result<()> {
        let provider = {
            let mut inner = self.inner.write().await;
            let entry = inner.entry_mut(id)?;
            entry.drive.status = Status::Connecting;
            entry.provider.clone()
        };
        let outcome = provider.initialize().await;
        let mut inner = self.inner.write().await;
        let entry = inner.entry_mut(id)?;
        match outcome {
            Ok(()) => {
                entry.drive.status = Status::Ready;
                tracing::info!(drive = %id, service = %entry.drive.service, "drive ready");
            },
            Err(err) => {
                entry.drive.status = Status::Error(err.error_code());
                tracing::warn!(drive = %id, error = %err, "drive failed to initialize");
            },
        }
        Ok(())
    }

    /// Retry initialization of a drive that is in an error state.
    pub async fn reconnect(&self, id: &str) -> Result<Status> {
        let status = self.drive(id).await?.status;
        if !status.can_become(Status::Connecting) {
            exn::bail!(ErrorKind::InvalidState(format!("cannot reconnect a drive that is {status}")));
        }
        self.connect(id).await?;
        Ok(self.drive(id).await?.status)
    }

    /// Unregister an empty drive. It is deleted from the metadata store on
    /// the next [`synchronize`](Self::synchronize).
    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let index = inner
            .entries
            .iter()
            .position(|entry| entry.drive.id == id)
            .ok_or_raise(|| ErrorKind::DriveNotFound(id.to_string()))?;
        if inner.entries[index].drive.chunks > 0 {
            exn::bail!(ErrorKind::DriveNotEmpty(id.to_string()));
        }
        let entry = inner.entries.remove(index);
        inner.dust.push(entry.drive.id);
        Ok(())
    }

    pub async fn set_quota(&self, id: &str, quota: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.entry_mut(id)?;
        let max = entry.provider.max_quota().min(MAX_DRIVE_QUOTA);
        if quota > max {
            exn::bail!(ErrorKind::InvalidQuota(quota, max));
        }
        entry.drive.quota = quota;
        entry.drive.dirty = true;
        Ok(())
    }

    pub async fn set_description(&self, id: &str, description: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.entry_mut(id)?;
        entry.drive.description = description.into();
        entry.drive.dirty = true;
        Ok(())
    }

    /// `Disabled → Ready`.
    pub async fn enable(&self, id: &str) -> Result<()> {
        self.transition(id, Status::Disabled, Status::Ready).await
    }

    /// `Ready → Disabled`. Disabled drives keep serving reads of the chunks
    /// they hold but receive no new allocations.
    pub async fn disable(&self, id: &str) -> Result<()> {
        self.transition(id, Status::Ready, Status::Disabled).await
    }

    async fn transition(&self, id: &str, from: Status, to: Status) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.entry_mut(id)?;
        if entry.drive.status != from {
            exn::bail!(ErrorKind::InvalidState(format!("drive {id} is {}, expected {from}", entry.drive.status)));
        }
        entry.drive.status = to;
        Ok(())
    }

    /// Pick the drive for a new chunk: the `Ready` drive with the most
    /// remaining quota, where `used(drive_id)` reports the bytes already
    /// placed on a drive. Ties go to the earliest registered drive.
    pub async fn next_allocatable(&self, used: impl Fn(&str) -> u64) -> Result<String> {
        let inner = self.inner.read().await;
        let mut best: Option<(&Drive, u64)> = None;
        for drive in inner.entries.iter().map(|entry| &entry.drive).filter(|drive| drive.status.is_ready()) {
            let remaining = drive.quota.saturating_sub(used(&drive.id));
            if best.is_none_or(|(_, current)| remaining > current) {
                best = Some((drive, remaining));
            }
        }
        match best {
            None => exn::bail!(ErrorKind::NoProviderAvailable),
            Some((_, 0)) => exn::bail!(ErrorKind::DriveFull),
            Some((drive, _)) => Ok(drive.id.clone()),
        }
    }

    pub async fn increment_chunks(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.entry_mut(id)?;
        entry.drive.chunks += 1;
        entry.drive.dirty = true;
        Ok(())
    }

    pub async fn decrement_chunks(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.entry_mut(id)?;
        entry.drive.chunks = entry.drive.chunks.saturating_sub(1);
        entry.drive.dirty = true;
        Ok(())
    }

    /// Provider handle of a registered drive.
    pub async fn provider(&self, id: &str) -> Result<ProviderHandle> {
        let inner = self.inner.read().await;
        inner
            .entries
            .iter()
            .find(|entry| entry.drive.id == id)
            .map(|entry| entry.provider.clone())
            .ok_or_raise(|| ErrorKind::DriveNotFound(id.to_string()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.entries.iter().any(|entry| entry.drive.id == id)
    }

    pub async fn drive(&self, id: &str) -> Result<Drive> {
        let inner = self.inner.read().await;
        inner
            .entries
            .iter()
            .find(|entry| entry.drive.id == id)
            .map(|entry| entry.drive.clone())
            .ok_or_raise(|| ErrorKind::DriveNotFound(id.to_string()))
    }

    /// All drives in registration order.
    pub async fn drives(&self) -> Vec<Drive> {
        self.inner.read().await.entries.iter().map(|entry| entry.drive.clone()).collect()
    }

    /// Upsert dirty drives, then delete removed ones.
    ///
    /// On failure the dirty flags and the dust list are restored so the
    /// next call retries the same work.
    #[instrument(skip(self))]
    pub async fn synchronize(&self) -> Result<()> {
        let (records, dust) = {
            let mut inner = self.inner.write().await;
            let mut records = Vec::new();
            for entry in inner.entries.iter_mut().filter(|entry| entry.drive.dirty) {
                entry.drive.dirty = false;
                records.push(entry.drive.record());
            }
            (records, std::mem::take(&mut inner.dust))
        };
        if records.is_empty() && dust.is_empty() {
            return Ok(());
        }
        let result = async {
            self.repo.upsert_drives(&records).await?;
            self.repo.delete_drives(&dust).await
        }
        .await;
        if let Err(err) = result {
            let mut inner = self.inner.write().await;
            for record in &records {
                if let Ok(entry) = inner.entry_mut(&record.id) {
                    entry.drive.dirty = true;
                }
            }
            inner.dust.extend(dust);
            return Err(err.raise(ErrorKind::Metadata));
        }
        tracing::debug!(upserted = records.len(), deleted = dust.len(), "drives synchronized");
        Ok(())
    }

    /// `any → Disconnecting → Disconnected` for every drive.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let targets: Vec<(String, ProviderHandle)> = {
            let mut inner = self.inner.write().await;
            inner
                .entries
                .iter_mut()
                .filter(|entry| entry.drive.status.can_become(Status::Disconnecting))
                .map(|entry| {
                    entry.drive.status = Status::Disconnecting;
                    (entry.drive.id.clone(), entry.provider.clone())
                })
                .collect()
        };
        for (id, provider) in targets {
            if let Err(err) = provider.shutdown().await {
                tracing::warn!(drive = %id, error = %err, "drive shutdown failed");
            }
            if let Ok(entry) = self.inner.write().await.entry_mut(&id) {
                entry.drive.status = Status::Disconnected;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use cirrus_meta::Database;

    async fn registry() -> DriveProviders {
        let db = Database::connect_in_memory().await.unwrap();
        DriveProviders::new(Repository::from(&db), |_: &str, _: Service| -> Result<ProviderHandle> {
            Ok(Arc::new(MockProvider::default()))
        })
    }

    async fn attach(registry: &DriveProviders, id: &str, quota: u64, provider: MockProvider) {
        registry.attach(id, Service::Mock, "test", quota, Arc::new(provider)).await.unwrap();
    }

    fn usage<'a>(pairs: &'a [(&'a str, u64)]) -> impl Fn(&str) -> u64 + 'a {
        move |id| pairs.iter().find(|(drive, _)| *drive == id).map(|(_, used)| *used).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_allocation_picks_most_remaining() {
        let registry = registry().await;
        attach(&registry, "a", 100, MockProvider::default()).await;
        attach(&registry, "b", 100, MockProvider::default()).await;
        attach(&registry, "c", 100, MockProvider::default()).await;

        let used = [("a", 10), ("b", 50), ("c", 5)];
        assert_eq!(registry.next_allocatable(usage(&used)).await.unwrap(), "c");
        // Same snapshot, same answer.
        assert_eq!(registry.next_allocatable(usage(&used)).await.unwrap(), "c");

        let used = [("a", 10), ("b", 0), ("c", 5)];
        assert_eq!(registry.next_allocatable(usage(&used)).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_allocation_ties_use_registration_order() {
        let registry = registry().await;
        attach(&registry, "z", 100, MockProvider::default()).await;
        attach(&registry, "a", 100, MockProvider::default()).await;
        assert_eq!(registry.next_allocatable(|_| 0).await.unwrap(), "z");
    }

    #[tokio::test]
    async fn test_allocation_exhaustion() {
        let registry = registry().await;
        let err = registry.next_allocatable(|_| 0).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NoProviderAvailable));

        attach(&registry, "a", 64, MockProvider::default()).await;
        let err = registry.next_allocatable(|_| 64).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::DriveFull));

        registry.disable("a").await.unwrap();
        let err = registry.next_allocatable(|_| 0).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NoProviderAvailable));
        registry.enable("a").await.unwrap();
        assert_eq!(registry.next_allocatable(|_| 0).await.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_failed_initialize_sets_error_code() {
        let registry = registry().await;
        attach(&registry, "bad", 100, MockProvider::default().with_login_failure()).await;
        attach(&registry, "gone", 100, MockProvider::default().unreachable()).await;
        assert_eq!(registry.drive("bad").await.unwrap().status, Status::Error(crate::ErrorCode::LoginFailed));
        assert_eq!(registry.drive("gone").await.unwrap().status, Status::Error(crate::ErrorCode::Unreachable));
        // Error drives never receive chunks.
        let err = registry.next_allocatable(|_| 0).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NoProviderAvailable));
        assert!(registry.disable("bad").await.is_err());
    }

    #[tokio::test]
    async fn test_remove_requires_empty_drive() {
        let registry = registry().await;
        attach(&registry, "a", 100, MockProvider::default()).await;
        registry.increment_chunks("a").await.unwrap();
        let err = registry.remove("a").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::DriveNotEmpty(_)));

        registry.decrement_chunks("a").await.unwrap();
        registry.remove("a").await.unwrap();
        assert!(!registry.contains("a").await);
        let err = registry.remove("a").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::DriveNotFound(_)));
    }

    #[tokio::test]
    async fn test_set_quota_is_bounded_by_provider() {
        let registry = registry().await;
        attach(&registry, "a", 10, MockProvider::default().with_max_quota(100)).await;
        registry.set_quota("a", 100).await.unwrap();
        let err = registry.set_quota("a", 101).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidQuota(101, 100)));
        assert_eq!(registry.drive("a").await.unwrap().quota, 100);
    }

    #[tokio::test]
    async fn test_synchronize_and_reload() {
        let db = Database::connect_in_memory().await.unwrap();
        let factory = |_: &str, _: Service| -> Result<ProviderHandle> { Ok(Arc::new(MockProvider::default())) };
        let registry = DriveProviders::new(Repository::from(&db), factory);
        let id = registry.add(Service::Mock).await.unwrap();
        registry.set_description(&id, "Primary").await.unwrap();
        registry.increment_chunks(&id).await.unwrap();
        registry.synchronize().await.unwrap();
        assert!(registry.drives().await.iter().all(|drive| !drive.dirty));
        // Nothing left to do.
        registry.synchronize().await.unwrap();

        let reloaded = DriveProviders::new(Repository::from(&db), factory);
        reloaded.initialize().await.unwrap();
        let drive = reloaded.drive(&id).await.unwrap();
        assert_eq!(drive.description, "Primary");
        assert_eq!(drive.chunks, 1);
        assert_eq!(drive.status, Status::Ready);
        assert!(!drive.dirty);
    }

    #[tokio::test]
    async fn test_oversized_quota_is_capped_and_persisted() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);
        let registry = DriveProviders::new(repo.clone(), |_: &str, _: Service| -> Result<ProviderHandle> {
            Ok(Arc::new(MockProvider::default().with_max_quota(u64::MAX)))
        });
        let id = registry.add(Service::Mock).await.unwrap();
        attach(&registry, "big", u64::MAX, MockProvider::default().with_max_quota(u64::MAX)).await;
        assert_eq!(registry.drive(&id).await.unwrap().quota, MAX_DRIVE_QUOTA);
        assert_eq!(registry.drive("big").await.unwrap().quota, MAX_DRIVE_QUOTA);

        let err = registry.set_quota("big", u64::MAX).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidQuota(_, MAX_DRIVE_QUOTA)));

        registry.synchronize().await.unwrap();
        let rows = repo.fetch_drives().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.quota == MAX_DRIVE_QUOTA));
    }

    #[tokio::test]
    async fn test_removed_drive_is_deleted_on_synchronize() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);
        let registry =
            DriveProviders::new(repo.clone(), |_: &str, _: Service| -> Result<ProviderHandle> {
                Ok(Arc::new(MockProvider::default()))
            });
        let id = registry.add(Service::Mock).await.unwrap();
        registry.synchronize().await.unwrap();
        registry.remove(&id).await.unwrap();
        registry.synchronize().await.unwrap();
        assert!(repo.fetch_drives().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_service_fails_initialize() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);
        repo.upsert_drives(&[DriveRecord {
            id: "d1".to_string(),
            service: "dropbox-drive-service".to_string(),
            description: "Dropbox".to_string(),
            quota: 1,
            chunks: 0,
        }])
        .await
        .unwrap();
        let registry = DriveProviders::new(repo, |_: &str, _: Service| -> Result<ProviderHandle> {
            Ok(Arc::new(MockProvider::default()))
        });
        let err = registry.initialize().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownService(_)));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let registry = registry().await;
        attach(&registry, "a", 1, MockProvider::default()).await;
        attach(&registry, "b", 1, MockProvider::default().with_expired_credentials()).await;
        registry.shutdown().await;
        for drive in registry.drives().await {
            assert_eq!(drive.status, Status::Disconnected);
        }
    }

    #[tokio::test]
    async fn test_service_factory_builds_offline() {
        let dir = tempfile::tempdir().unwrap();
        let factory = ServiceFactory::new(dir.path());
        let provider = factory.build("d1", Service::Offline).unwrap();
        provider.initialize().await.unwrap();
        assert!(dir.path().join("drive/offline-drive-service/d1/storage").is_dir());
    }
}
