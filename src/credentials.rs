//! Credential store: owns the OAuth token pair and hands out valid access tokens
//!
//! No other component reads the [`Credential`] directly; everything goes
//! through [`TokenSource::valid_token`], which refreshes an expired token at
//! most once per process. A failed refresh is terminal: the store remembers it
//! and fails every later request without touching the network again.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{LabelerError, Result};
use crate::models::Credential;

/// Anything that can produce a currently valid bearer token
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn valid_token(&self) -> Result<String>;
}

/// Exchanges a refresh token for a new credential
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, credential: &Credential) -> Result<Credential>;
}

/// Snapshot for the `status` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialStatus {
    pub present: bool,
    pub expiry: Option<DateTime<Utc>>,
    pub expired: bool,
    pub has_refresh_token: bool,
    pub revoked: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    credential: Option<Credential>,
    /// Set once a refresh has failed; never cleared except by `accept`
    revoked: Option<String>,
    refreshes: u32,
}

pub struct CredentialStore {
    path: PathBuf,
    refresher: Option<Arc<dyn TokenRefresher>>,
    refresh_skew: Duration,
    state: Mutex<StoreState>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .field("refresh_skew", &self.refresh_skew)
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Open the store, reading any persisted credential from `path`
    ///
    /// A missing file is not an error; the store simply has no credential
    /// until one is accepted.
    pub async fn open(
        path: impl Into<PathBuf>,
        refresher: Option<Arc<dyn TokenRefresher>>,
        refresh_skew: Duration,
    ) -> Result<Self> {
        let path = path.into();
        let credential = load_credential(&path).await?;

        match &credential {
            Some(c) => debug!("Loaded credential from {:?} (expires {})", path, c.expiry),
            None => debug!("No credential stored at {:?}", path),
        }

        Ok(Self {
            path,
            refresher,
            refresh_skew,
            state: Mutex::new(StoreState {
                credential,
                ..StoreState::default()
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist and install a freshly authorized credential
    pub async fn accept(&self, credential: Credential) -> Result<()> {
        let mut state = self.state.lock().await;
        persist_credential(&self.path, &credential).await?;
        state.credential = Some(credential);
        state.revoked = None;
        info!("Stored new credential at {:?}", self.path);
        Ok(())
    }

    pub async fn status(&self) -> CredentialStatus {
        let state = self.state.lock().await;
        let now = Utc::now();
        match &state.credential {
            Some(c) => CredentialStatus {
                present: true,
                expiry: Some(c.expiry),
                expired: c.is_expired(now, Duration::zero()),
                has_refresh_token: c.has_refresh_token(),
                revoked: state.revoked.is_some(),
            },
            None => CredentialStatus {
                present: false,
                expiry: None,
                expired: false,
                has_refresh_token: false,
                revoked: state.revoked.is_some(),
            },
        }
    }

    /// Number of successful refreshes performed by this process
    pub async fn refresh_count(&self) -> u32 {
        self.state.lock().await.refreshes
    }

    pub async fn current(&self) -> Option<Credential> {
        self.state.lock().await.credential.clone()
    }
}

#[async_trait]
impl TokenSource for CredentialStore {
    async fn valid_token(&self) -> Result<String> {
        // Held across the refresh so concurrent callers share one attempt
        let mut state = self.state.lock().await;

        if let Some(reason) = &state.revoked {
            return Err(LabelerError::AuthError(format!(
                "credential unusable after failed refresh: {}",
                reason
            )));
        }

        let credential = match &state.credential {
            Some(c) => c.clone(),
            None => {
                return Err(LabelerError::AuthError(
                    "no stored credential; run `gmail-labeler auth` first".to_string(),
                ))
            }
        };

        if !credential.is_expired(Utc::now(), self.refresh_skew) {
            return Ok(credential.access_token);
        }

        if !credential.has_refresh_token() {
            state.revoked = Some("no refresh token".to_string());
            return Err(LabelerError::AuthError(
                "access token expired and no refresh token is stored; run `gmail-labeler auth`"
                    .to_string(),
            ));
        }

        let refresher = match &self.refresher {
            Some(r) => r.clone(),
            None => {
                return Err(LabelerError::AuthError(
                    "access token expired and no OAuth client is configured to refresh it"
                        .to_string(),
                ))
            }
        };

        debug!("Access token expired at {}, refreshing", credential.expiry);
        let refreshed = match refresher.refresh(&credential).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                state.revoked = Some(e.to_string());
                return Err(LabelerError::AuthError(format!("token refresh failed: {}", e)));
            }
        };

        if let Err(e) = persist_credential(&self.path, &refreshed).await {
            state.revoked = Some(format!("could not persist refreshed credential: {}", e));
            return Err(LabelerError::AuthError(format!(
                "could not persist refreshed credential: {}",
                e
            )));
        }

        info!("Refreshed access token (valid until {})", refreshed.expiry);
        let token = refreshed.access_token.clone();
        state.credential = Some(refreshed);
        state.refreshes += 1;
        Ok(token)
    }
}

#[async_trait]
impl<T: TokenSource + ?Sized> TokenSource for Arc<T> {
    async fn valid_token(&self) -> Result<String> {
        (**self).valid_token().await
    }
}

async fn load_credential(path: &Path) -> Result<Option<Credential>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| LabelerError::AuthError(format!("credential file {:?} is corrupt: {}", path, e)))
}

/// Write the credential next to its destination, sync it, then rename it
/// over the old record
async fn persist_credential(path: &Path, credential: &Credential) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = temp_path_for(path);
    let content = serde_json::to_vec_pretty(credential)?;

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(&content).await?;
    file.sync_all().await?;
    drop(file);

    secure_token_file(&tmp_path).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "credential".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}

/// Restrict the credential file to its owner (0600)
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

// Windows relies on the user profile ACLs
#[cfg(windows)]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    mockall::mock! {
        pub Refresher {}

        #[async_trait]
        impl TokenRefresher for Refresher {
            async fn refresh(&self, credential: &Credential) -> Result<Credential>;
        }
    }

    fn credential(access: &str, expires_in: Duration) -> Credential {
        Credential {
            access_token: access.to_string(),
            refresh_token: "refresh-1".to_string(),
            expiry: Utc::now() + expires_in,
        }
    }

    async fn store_with(
        dir: &TempDir,
        stored: Option<Credential>,
        refresher: Option<MockRefresher>,
    ) -> CredentialStore {
        let path = dir.path().join("credential.json");
        if let Some(c) = stored {
            tokio::fs::write(&path, serde_json::to_string(&c).unwrap())
                .await
                .unwrap();
        }
        let refresher = refresher.map(|r| Arc::new(r) as Arc<dyn TokenRefresher>);
        CredentialStore::open(path, refresher, Duration::seconds(60))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_returned_without_refresh() {
        let dir = TempDir::new().unwrap();
        let mut refresher = MockRefresher::new();
        refresher.expect_refresh().times(0);

        let store = store_with(
            &dir,
            Some(credential("live", Duration::hours(1))),
            Some(refresher),
        )
        .await;

        assert_eq!(store.valid_token().await.unwrap(), "live");
        assert_eq!(store.refresh_count().await, 0);
    }

    #[tokio::test]
    async fn test_expired_token_refreshed_and_persisted() {
        let dir = TempDir::new().unwrap();
        let mut refresher = MockRefresher::new();
        refresher.expect_refresh().times(1).returning(|old| {
            Ok(Credential {
                access_token: "fresh".to_string(),
                refresh_token: old.refresh_token.clone(),
                expiry: Utc::now() + Duration::hours(1),
            })
        });

        let store = store_with(
            &dir,
            Some(credential("stale", Duration::seconds(-10))),
            Some(refresher),
        )
        .await;

        assert_eq!(store.valid_token().await.unwrap(), "fresh");
        // Second call is served from memory
        assert_eq!(store.valid_token().await.unwrap(), "fresh");
        assert_eq!(store.refresh_count().await, 1);

        let on_disk: Credential = serde_json::from_str(
            &tokio::fs::read_to_string(store.path()).await.unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk.access_token, "fresh");
        assert_eq!(on_disk.refresh_token, "refresh-1");
    }

    #[tokio::test]
    async fn test_token_inside_skew_window_is_refreshed() {
        let dir = TempDir::new().unwrap();
        let mut refresher = MockRefresher::new();
        refresher.expect_refresh().times(1).returning(|old| {
            Ok(Credential {
                access_token: "fresh".to_string(),
                refresh_token: old.refresh_token.clone(),
                expiry: Utc::now() + Duration::hours(1),
            })
        });

        let store = store_with(
            &dir,
            Some(credential("nearly", Duration::seconds(30))),
            Some(refresher),
        )
        .await;

        assert_eq!(store.valid_token().await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_failed_refresh_is_fatal_and_not_retried() {
        let dir = TempDir::new().unwrap();
        let mut refresher = MockRefresher::new();
        refresher
            .expect_refresh()
            .times(1)
            .returning(|_| Err(LabelerError::AuthError("invalid_grant".to_string())));

        let stale = credential("stale", Duration::seconds(-10));
        let store = store_with(&dir, Some(stale.clone()), Some(refresher)).await;

        let first = store.valid_token().await.unwrap_err();
        assert!(matches!(first, LabelerError::AuthError(_)));
        assert!(first.to_string().contains("invalid_grant"));

        // No second network attempt
        let second = store.valid_token().await.unwrap_err();
        assert!(matches!(second, LabelerError::AuthError(_)));
        assert!(store.status().await.revoked);

        // Stored record untouched
        let on_disk: Credential = serde_json::from_str(
            &tokio::fs::read_to_string(store.path()).await.unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk, stale);
    }

    #[tokio::test]
    async fn test_missing_credential_is_auth_error() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, None, None).await;

        let err = store.valid_token().await.unwrap_err();
        assert!(matches!(err, LabelerError::AuthError(_)));
        assert!(!store.status().await.present);
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_is_auth_error() {
        let dir = TempDir::new().unwrap();
        let mut refresher = MockRefresher::new();
        refresher.expect_refresh().times(0);

        let mut stale = credential("stale", Duration::seconds(-10));
        stale.refresh_token = String::new();
        let store = store_with(&dir, Some(stale), Some(refresher)).await;

        assert!(matches!(
            store.valid_token().await,
            Err(LabelerError::AuthError(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let dir = TempDir::new().unwrap();
        let mut refresher = MockRefresher::new();
        refresher.expect_refresh().times(1).returning(|old| {
            Ok(Credential {
                access_token: "fresh".to_string(),
                refresh_token: old.refresh_token.clone(),
                expiry: Utc::now() + Duration::hours(1),
            })
        });

        let store = Arc::new(
            store_with(
                &dir,
                Some(credential("stale", Duration::seconds(-10))),
                Some(refresher),
            )
            .await,
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.valid_token().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "fresh");
        }
        assert_eq!(store.refresh_count().await, 1);
    }

    #[tokio::test]
    async fn test_accept_persists_and_clears_revocation() {
        let dir = TempDir::new().unwrap();
        let mut refresher = MockRefresher::new();
        refresher
            .expect_refresh()
            .times(1)
            .returning(|_| Err(LabelerError::AuthError("revoked".to_string())));

        let store = store_with(
            &dir,
            Some(credential("stale", Duration::seconds(-10))),
            Some(refresher),
        )
        .await;
        assert!(store.valid_token().await.is_err());

        store
            .accept(credential("granted", Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(store.valid_token().await.unwrap(), "granted");
        let status = store.status().await;
        assert!(status.present);
        assert!(!status.revoked);
        assert!(!status.expired);

        // No temporary file left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_accept_creates_parent_directories_and_secures_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("credential.json");
        let store = CredentialStore::open(&path, None, Duration::seconds(60))
            .await
            .unwrap();

        store
            .accept(credential("granted", Duration::hours(1)))
            .await
            .unwrap();
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = tokio::fs::metadata(&path).await.unwrap().permissions();
            assert_eq!(perms.mode() & 0o777, 0o600);
        }

        let reopened = CredentialStore::open(&path, None, Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(reopened.valid_token().await.unwrap(), "granted");
    }

    #[tokio::test]
    async fn test_corrupt_credential_file_is_auth_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credential.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let err = CredentialStore::open(&path, None, Duration::seconds(60))
            .await
            .unwrap_err();
        assert!(matches!(err, LabelerError::AuthError(_)));
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let tmp = temp_path_for(Path::new("/a/b/credential.json"));
        assert_eq!(tmp, PathBuf::from("/a/b/.credential.json.tmp"));
    }
}
