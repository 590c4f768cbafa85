use crate::auth::credentials::CredentialRecord;
use crate::auth::pool::{AccountPool, Group, SharedFlight};
use crate::auth::refresher::schedule_refresh;
use crate::error::{AppError, AppResult};
use crate::upstream::{ProjectLookup, TokenResponse, UpstreamClient};
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// The two upstream operations the credential lifecycle depends on, behind a
/// seam so the single-flight machinery is testable without a network.
pub trait TokenBroker: Send + Sync + 'static {
    fn exchange_refresh(&self, refresh_token: String) -> BoxFuture<'_, AppResult<TokenResponse>>;
    fn lookup_project(&self, access_token: String) -> BoxFuture<'_, AppResult<ProjectLookup>>;
}

impl TokenBroker for UpstreamClient {
    fn exchange_refresh(&self, refresh_token: String) -> BoxFuture<'_, AppResult<TokenResponse>> {
        async move { self.refresh_token(&refresh_token).await }.boxed()
    }

    fn lookup_project(&self, access_token: String) -> BoxFuture<'_, AppResult<ProjectLookup>> {
        async move { self.load_project_id(&access_token).await }.boxed()
    }
}

/// Usable serving identity for one attempt.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_token: String,
    pub project_id: String,
    pub email: Option<String>,
    pub file_path: PathBuf,
    pub key: String,
}

pub struct AuthManager {
    pool: Mutex<AccountPool>,
    broker: Arc<dyn TokenBroker>,
}

impl AuthManager {
    pub fn new(broker: Arc<dyn TokenBroker>, auths_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            pool: Mutex::new(AccountPool::new(auths_dir)),
            broker,
        })
    }

    pub async fn load_accounts(self: &Arc<Self>) -> AppResult<usize> {
        let mut pool = self.pool.lock().await;
        let count = pool.load()?;
        for idx in 0..pool.len() {
            self.install_timer(&mut pool, idx);
        }
        Ok(count)
    }

    pub async fn pool_len(&self) -> usize {
        self.pool.lock().await.len()
    }

    pub async fn account_keys(&self) -> Vec<(usize, String)> {
        self.pool.lock().await.keys()
    }

    pub async fn rotate(&self, group: Group) {
        self.pool.lock().await.rotate(group);
    }

    pub async fn add_account(self: &Arc<Self>, record: CredentialRecord) -> AppResult<PathBuf> {
        let mut pool = self.pool.lock().await;
        let path = pool.upsert(record)?;
        if let Some(idx) = pool.index_of_path(&path) {
            self.install_timer(&mut pool, idx);
        }
        Ok(path)
    }

    pub async fn delete_account(&self, file_name: &str) -> AppResult<()> {
        self.pool.lock().await.delete(file_name)
    }

    /// Usable credentials for the group's current account: settles any
    /// in-flight refresh, refreshes when expired, then guarantees a project
    /// id before returning.
    pub async fn get_credentials(self: &Arc<Self>, group: Group) -> AppResult<Credentials> {
        let path = {
            let pool = self.pool.lock().await;
            if pool.is_empty() {
                return Err(AppError::Account("no accounts loaded".to_string()));
            }
            let idx = pool.current_index(group);
            pool.accounts[idx].file_path.clone()
        };
        self.credentials_for_path(path).await
    }

    /// Same contract as `get_credentials` for an explicit pool index, used
    /// when the quota selector has already chosen the account. The index is
    /// re-validated under the lock before use.
    pub async fn get_credentials_at(self: &Arc<Self>, idx: usize) -> AppResult<Credentials> {
        let path = {
            let pool = self.pool.lock().await;
            let account = pool
                .accounts
                .get(idx)
                .ok_or_else(|| AppError::Account(format!("account index {} out of range", idx)))?;
            account.file_path.clone()
        };
        self.credentials_for_path(path).await
    }

    /// Fresh access token without the project-id requirement; the quota
    /// refresher probes accounts that may not be eligible to serve.
    pub async fn access_token_at(self: &Arc<Self>, idx: usize) -> AppResult<(String, String)> {
        let path = {
            let pool = self.pool.lock().await;
            let account = pool
                .accounts
                .get(idx)
                .ok_or_else(|| AppError::Account(format!("account index {} out of range", idx)))?;
            account.file_path.clone()
        };
        self.ensure_fresh(&path).await?;

        let pool = self.pool.lock().await;
        let idx = pool
            .index_of_path(&path)
            .ok_or_else(|| AppError::Account("account removed".to_string()))?;
        let account = &pool.accounts[idx];
        Ok((account.record.access_token.clone(), account.key()))
    }

    async fn credentials_for_path(self: &Arc<Self>, path: PathBuf) -> AppResult<Credentials> {
        self.ensure_fresh(&path).await?;
        self.ensure_project_id(&path).await?;

        let pool = self.pool.lock().await;
        let idx = pool
            .index_of_path(&path)
            .ok_or_else(|| AppError::Account("account removed".to_string()))?;
        let account = &pool.accounts[idx];
        let project_id = account
            .record
            .project_id
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AppError::Account("account has no project id".to_string()))?;

        Ok(Credentials {
            access_token: account.record.access_token.clone(),
            project_id,
            email: account.record.email.clone(),
            file_path: account.file_path.clone(),
            key: account.key(),
        })
    }

    async fn ensure_fresh(self: &Arc<Self>, path: &PathBuf) -> AppResult<()> {
        // Settle whatever refresh is already in flight before judging expiry.
        let pending = {
            let pool = self.pool.lock().await;
            let idx = pool
                .index_of_path(path)
                .ok_or_else(|| AppError::Account("account removed".to_string()))?;
            pool.accounts[idx].in_flight_refresh.clone()
        };
        if let Some(flight) = pending {
            let _ = flight.await;
        }

        let now = chrono::Utc::now().timestamp_millis();
        let flight = {
            let mut pool = self.pool.lock().await;
            let idx = pool
                .index_of_path(path)
                .ok_or_else(|| AppError::Account("account removed".to_string()))?;
            if !pool.accounts[idx].record.is_expired(now) {
                return Ok(());
            }
            self.join_refresh_flight(&mut pool, idx)
        };
        flight.await.map_err(AppError::OAuth)?;
        Ok(())
    }

    async fn ensure_project_id(self: &Arc<Self>, path: &PathBuf) -> AppResult<()> {
        let flight = {
            let mut pool = self.pool.lock().await;
            let idx = pool
                .index_of_path(path)
                .ok_or_else(|| AppError::Account("account removed".to_string()))?;
            let account = &mut pool.accounts[idx];
            if account
                .record
                .project_id
                .as_deref()
                .is_some_and(|p| !p.is_empty())
            {
                return Ok(());
            }
            match &account.in_flight_project_id {
                Some(flight) => flight.clone(),
                None => {
                    let flight = self.spawn_project_flight(path.clone());
                    account.in_flight_project_id = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await.map_err(AppError::Account)?;
        Ok(())
    }

    /// Forces a refresh for the account behind `path`, joining an existing
    /// flight if one is already running. Entry point for the timer.
    pub async fn refresh_by_path(self: &Arc<Self>, path: PathBuf) -> Result<(), String> {
        let flight = {
            let mut pool = self.pool.lock().await;
            let idx = pool
                .index_of_path(&path)
                .ok_or_else(|| "account removed".to_string())?;
            self.join_refresh_flight(&mut pool, idx)
        };
        flight.await.map(|_| ())
    }

    fn join_refresh_flight(
        self: &Arc<Self>,
        pool: &mut AccountPool,
        idx: usize,
    ) -> SharedFlight<CredentialRecord> {
        match &pool.accounts[idx].in_flight_refresh {
            Some(flight) => flight.clone(),
            None => {
                let flight = self.spawn_refresh_flight(pool.accounts[idx].file_path.clone());
                pool.accounts[idx].in_flight_refresh = Some(flight.clone());
                flight
            }
        }
    }

    fn spawn_refresh_flight(self: &Arc<Self>, path: PathBuf) -> SharedFlight<CredentialRecord> {
        let weak = Arc::downgrade(self);
        let shared = async move {
            let result = run_refresh(weak.clone(), path.clone()).await;
            if let Some(manager) = weak.upgrade() {
                let mut pool = manager.pool.lock().await;
                if let Some(idx) = pool.index_of_path(&path) {
                    pool.accounts[idx].in_flight_refresh = None;
                }
            }
            result
        }
        .boxed()
        .shared();

        // Drive the flight to completion even if every caller is cancelled.
        tokio::spawn({
            let flight = shared.clone();
            async move {
                let _ = flight.await;
            }
        });
        shared
    }

    fn spawn_project_flight(self: &Arc<Self>, path: PathBuf) -> SharedFlight<String> {
        let weak = Arc::downgrade(self);
        let shared = async move {
            let result = run_project_resolution(weak.clone(), path.clone()).await;
            if let Some(manager) = weak.upgrade() {
                let mut pool = manager.pool.lock().await;
                if let Some(idx) = pool.index_of_path(&path) {
                    pool.accounts[idx].in_flight_project_id = None;
                }
            }
            result
        }
        .boxed()
        .shared();

        tokio::spawn({
            let flight = shared.clone();
            async move {
                let _ = flight.await;
            }
        });
        shared
    }

    fn install_timer(self: &Arc<Self>, pool: &mut AccountPool, idx: usize) {
        let account = &mut pool.accounts[idx];
        let path = account.file_path.clone();
        let key = account.key();
        let expiry = account.record.expiry_ms;
        let weak = Arc::downgrade(self);

        let handle = schedule_refresh(key, expiry, move || {
            let weak = weak.clone();
            let path = path.clone();
            async move {
                match weak.upgrade() {
                    Some(manager) => manager.refresh_by_path(path).await,
                    None => Err("auth manager shut down".to_string()),
                }
            }
            .boxed()
        });

        account.cancel_timer();
        account.refresh_timer = Some(handle);
    }
}

async fn run_refresh(
    weak: Weak<AuthManager>,
    path: PathBuf,
) -> Result<CredentialRecord, String> {
    let manager = weak.upgrade().ok_or("auth manager shut down")?;

    let (refresh_token, previous) = {
        let pool = manager.pool.lock().await;
        let idx = pool
            .index_of_path(&path)
            .ok_or_else(|| "account removed".to_string())?;
        let record = pool.accounts[idx].record.clone();
        (record.refresh_token.clone(), record)
    };

    let token = manager
        .broker
        .exchange_refresh(refresh_token.clone())
        .await
        .map_err(|e| e.to_string())?;

    let mut record = CredentialRecord {
        access_token: token.access_token.clone(),
        expiry_ms: token.expiry_ms(),
        refresh_token: token.refresh_token.unwrap_or(refresh_token),
        token_type: token.token_type.or(previous.token_type),
        scope: token.scope.or(previous.scope),
        email: previous.email,
        project_id: previous.project_id,
    };

    if record.project_id.as_deref().unwrap_or("").is_empty() {
        match resolve_project(&*manager.broker, &record.access_token).await {
            Ok(project_id) => record.project_id = Some(project_id),
            Err(e) => warn!("Project resolution during refresh failed: {}", e),
        }
    }

    {
        let mut pool = manager.pool.lock().await;
        let idx = pool
            .index_of_path(&path)
            .ok_or_else(|| "account removed during refresh".to_string())?;
        pool.accounts[idx].record = record.clone();
        pool.persist_at(idx).map_err(|e| e.to_string())?;
        manager.install_timer(&mut pool, idx);
    }

    info!("Refreshed credentials for {:?}", path.file_name());
    Ok(record)
}

async fn run_project_resolution(weak: Weak<AuthManager>, path: PathBuf) -> Result<String, String> {
    let manager = weak.upgrade().ok_or("auth manager shut down")?;

    let access_token = {
        let pool = manager.pool.lock().await;
        let idx = pool
            .index_of_path(&path)
            .ok_or_else(|| "account removed".to_string())?;
        pool.accounts[idx].record.access_token.clone()
    };

    let project_id = resolve_project(&*manager.broker, &access_token).await?;

    {
        let mut pool = manager.pool.lock().await;
        let idx = pool
            .index_of_path(&path)
            .ok_or_else(|| "account removed during project resolution".to_string())?;
        pool.accounts[idx].record.project_id = Some(project_id.clone());
        pool.persist_at(idx).map_err(|e| e.to_string())?;
    }

    Ok(project_id)
}

async fn resolve_project(broker: &dyn TokenBroker, access_token: &str) -> Result<String, String> {
    let lookup = broker
        .lookup_project(access_token.to_string())
        .await
        .map_err(|e| e.to_string())?;

    if let Some(project_id) = lookup.project_id.filter(|p| !p.is_empty()) {
        return Ok(project_id);
    }

    if lookup.raw_body.contains("paidTier") {
        let synthesized = synthesize_project_id();
        info!(
            "No companion project in loadCodeAssist body; synthesized {}",
            synthesized
        );
        return Ok(synthesized);
    }

    Err("account is not eligible".to_string())
}

/// `{adjective}-{noun}-{5 base36 chars}`, the shape the upstream accepts for
/// accounts it never assigned a companion project to.
pub fn synthesize_project_id() -> String {
    const ADJECTIVES: [&str; 6] = ["amber", "quiet", "rapid", "solid", "vivid", "lunar"];
    const NOUNS: [&str; 6] = ["delta", "ridge", "orbit", "maple", "pearl", "cedar"];

    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    let suffix: String = (0..5)
        .map(|_| {
            let digit = rng.gen_range(0..36u32);
            char::from_digit(digit, 36).unwrap_or('0')
        })
        .collect();

    format!("{}-{}-{}", adjective, noun, suffix)
}
