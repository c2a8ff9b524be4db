use std::{sync::Arc, time::Duration};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    accounts::{AccountSettings, ChannelAccountsService},
    api::handler::AppState,
    config::Config,
    error::{AppError, AppResult},
    events::ChannelEventProducer,
    ledger::LedgerTracker,
    middleware::RateLimitLayer,
    network::{HorizonClient, NetworkClient},
    server,
    shutdown::{self, ShutdownSignal},
    signing::{
        custody::{CustodySignatureService, HttpCustodyTransport},
        env::EnvSignatureService,
        keys::is_valid_public_key,
        pool::PoolSignatureService,
        resolver::DistributionAccountResolver,
        vault::KeyVault,
        SignatureService,
    },
    store::{
        memory::{MemoryPaymentStore, MemoryTssStore},
        models::{AccountState, DistributionAccount, SigningBackend},
        postgres::{PgPaymentStore, PgTssStore},
        DistributionAccountStore, PaymentStore, TransactionStore,
    },
    submitter::{EngineSettings, ProcessingLimiter, SubmitterEngine},
    sync::{CompletionSync, PaymentToSubmitter, ReadyPaymentCanceller},
    worker::{WorkerPool, WorkerSettings},
};

/// Completion events buffered between the engine and the sync consumer.
const EVENT_CHANNEL_CAPACITY: usize = 1024;
/// How long background tasks get to finish after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

struct Stores {
    transactions: Arc<dyn TransactionStore>,
    accounts: Arc<dyn DistributionAccountStore>,
    payments: Arc<dyn PaymentStore>,
}

struct Signing {
    /// Signs for the distribution account.
    signer: Arc<dyn SignatureService>,
    resolver: Arc<DistributionAccountResolver>,
    /// Pool backend only: channel accounts sourcing each transaction.
    accounts: Option<Arc<ChannelAccountsService>>,
}

/// Wires every component, runs the HTTP server, and drains background tasks on shutdown.
pub async fn run(config: Config) -> AppResult<()> {
    info!("Initializing application components ...");
    config.validate()?;

    let stores = initialize_stores(&config).await?;

    let network: Arc<dyn NetworkClient> = Arc::new(HorizonClient::new(&config.horizon_url, config.network_timeout())?);
    let ledger = Arc::new(LedgerTracker::new(
        network.clone(),
        Duration::from_millis(config.ledger_ttl_ms),
        Duration::from_millis(config.ledger_refresh_interval_ms),
        config.network_timeout(),
    ));
    let latest = ledger
        .refresh()
        .await
        .map_err(|e| AppError::Fatal(format!("ledger tracker cannot reach {}: {}", config.horizon_url, e)))?;
    info!("✅ Ledger tracker initialized at ledger {}", latest);

    let signing = initialize_signing(&config, &stores, network.clone(), ledger.clone()).await?;
    info!("✅ {} signature service ready", signing.resolver.backend());

    let (producer, receiver) = ChannelEventProducer::new(EVENT_CHANNEL_CAPACITY);
    let mut engine = SubmitterEngine::new(
        stores.transactions.clone(),
        signing.signer.clone(),
        network.clone(),
        ledger.clone(),
        Arc::new(producer),
        EngineSettings::from_config(&config),
    );
    if let Some(accounts) = &signing.accounts {
        engine = engine.with_channels(accounts.clone());
    }
    let engine = Arc::new(engine);
    let workers = Arc::new(WorkerPool::new(
        stores.transactions.clone(),
        stores.payments.clone(),
        engine,
        Arc::new(ProcessingLimiter::new(config.batch_size)),
        WorkerSettings::from_config(&config),
    ));
    let completion = Arc::new(CompletionSync::new(
        stores.transactions.clone(),
        stores.payments.clone(),
        config.sync_batch_size,
    ));
    let handoff = Arc::new(PaymentToSubmitter::new(
        stores.payments.clone(),
        stores.transactions.clone(),
        signing.resolver.clone(),
        config.batch_size,
    ));
    let canceller = Arc::new(ReadyPaymentCanceller::new(
        stores.payments.clone(),
        config.inactivity_cancel_days,
    ));

    let (trigger, shutdown) = shutdown::channel();
    let tenants = vec![config.tenant_id.clone()];
    let sync_interval = Duration::from_secs(config.sync_interval_secs);

    let mut handles: Vec<JoinHandle<()>> = vec![ledger.clone().start(shutdown.clone())];
    handles.extend(workers.start(shutdown.clone()));
    handles.push(completion.clone().start(tenants.clone(), sync_interval, shutdown.clone()));
    handles.push(completion.clone().consume(receiver, shutdown.clone()));
    handles.push(handoff.clone().start(tenants, sync_interval, shutdown.clone()));
    handles.push(
        canceller.start(Duration::from_secs(config.cancel_sweep_interval_secs), shutdown.clone()),
    );
    info!("✅ {} background tasks started", handles.len());

    let state = AppState {
        payments: stores.payments.clone(),
        transactions: stores.transactions.clone(),
        ledger,
        handoff,
        completion,
        accounts: signing.accounts,
        backend: config.signing_backend,
    };
    let app = server::create_app(state, RateLimitLayer::new(60, 60));

    tokio::spawn(async move {
        shutdown::os_signal().await;
        info!("🛑 Shutdown requested");
        trigger.trigger();
    });

    server::run_server(app, &config.bind_address, shutdown.clone()).await?;
    drain(handles, shutdown).await;
    Ok(())
}

async fn drain(handles: Vec<JoinHandle<()>>, shutdown: ShutdownSignal) {
    if !shutdown.is_triggered() {
        warn!("server stopped without a shutdown request");
    }
    let joined = tokio::time::timeout(DRAIN_TIMEOUT, futures::future::join_all(handles)).await;
    match joined {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    error!("background task ended abnormally: {}", e);
                }
            }
            info!("✓ Background tasks stopped");
        }
        Err(_) => warn!("background tasks still running after {:?}, exiting", DRAIN_TIMEOUT),
    }
}

async fn initialize_stores(config: &Config) -> AppResult<Stores> {
    if config.uses_memory_store() {
        warn!("⚠️  Using in-memory stores, nothing survives a restart");
        let tss = Arc::new(MemoryTssStore::new());
        return Ok(Stores {
            transactions: tss.clone(),
            accounts: tss,
            payments: Arc::new(MemoryPaymentStore::new()),
        });
    }

    let pool = initialize_database(&config.database_url).await?;
    let tss = Arc::new(PgTssStore::new(pool.clone()));
    Ok(Stores {
        transactions: tss.clone(),
        accounts: tss,
        payments: Arc::new(PgPaymentStore::new(pool)),
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
        .map_err(|e| AppError::Fatal(format!("database unreachable: {}", e)))?;

    info!("✓ Database pool configured: 50 max connections");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}

fn env_signer(seed: Option<&str>, passphrase: &str) -> AppResult<Arc<EnvSignatureService>> {
    let seed = seed.ok_or_else(|| AppError::Fatal("distribution seed is not set".into()))?;
    EnvSignatureService::new(seed, passphrase)
        .map(Arc::new)
        .map_err(|e| AppError::Fatal(format!("distribution seed is invalid: {}", e)))
}

/// Builds the configured Signature Service. Any misconfiguration is fatal.
async fn initialize_signing(
    config: &Config,
    stores: &Stores,
    network: Arc<dyn NetworkClient>,
    ledger: Arc<LedgerTracker>,
) -> AppResult<Signing> {
    let passphrase = config.network_passphrase.as_str();

    match config.signing_backend {
        SigningBackend::Env => {
            let signer = env_signer(config.distribution_seed.as_deref(), passphrase)?;
            let account = signer.public_key().to_string();
            register_fixed_account(stores, &account, SigningBackend::Env).await?;
            Ok(Signing {
                resolver: Arc::new(DistributionAccountResolver::fixed(SigningBackend::Env, account)),
                signer,
                accounts: None,
            })
        }
        SigningBackend::Custody => {
            let account = config
                .distribution_public_key
                .clone()
                .filter(|key| is_valid_public_key(key))
                .ok_or_else(|| AppError::Fatal("custody distribution public key is invalid".into()))?;
            let url = config.custody_url.as_deref().unwrap_or_default();
            let signer = Arc::new(CustodySignatureService::new(
                Arc::new(HttpCustodyTransport::new(url)),
                &account,
                passphrase,
                config.custody_timeout(),
            ));
            register_fixed_account(stores, &account, SigningBackend::Custody).await?;
            Ok(Signing {
                resolver: Arc::new(DistributionAccountResolver::fixed(SigningBackend::Custody, account)),
                signer,
                accounts: None,
            })
        }
        SigningBackend::Pool => {
            let vault = KeyVault::new(config.key_encryption_passphrase.as_deref().unwrap_or_default())
                .map_err(|e| AppError::Fatal(format!("key encryption passphrase rejected: {}", e)))?;
            let pool = Arc::new(PoolSignatureService::new(stores.accounts.clone(), vault, passphrase));
            let funder = env_signer(config.distribution_seed.as_deref(), passphrase)?;
            let funder_account = funder.public_key().to_string();
            // payments are debited from the funder; channels only source them
            register_fixed_account(stores, &funder_account, SigningBackend::Env).await?;

            let accounts = Arc::new(ChannelAccountsService::new(
                stores.accounts.clone(),
                pool,
                funder.clone(),
                funder_account.clone(),
                network,
                ledger,
                AccountSettings::from_config(config),
            )?);
            let active = accounts
                .ensure_count(config.num_channel_accounts)
                .await
                .map_err(|e| AppError::Fatal(format!("channel accounts unavailable: {}", e)))?;
            if active.is_empty() {
                return Err(AppError::Fatal("no active channel accounts".into()));
            }
            info!("✅ {} channel accounts active", active.len());

            Ok(Signing {
                resolver: Arc::new(DistributionAccountResolver::fixed(SigningBackend::Pool, funder_account)),
                signer: funder,
                accounts: Some(accounts),
            })
        }
    }
}

async fn register_fixed_account(stores: &Stores, account: &str, backend: SigningBackend) -> AppResult<()> {
    stores
        .accounts
        .upsert(DistributionAccount::new(account, backend, AccountState::Active), None)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TEST_NETWORK_PASSPHRASE;
    use crate::network::mock::MockNetwork;
    use crate::signing::keys::KeyPair;

    fn config(backend: SigningBackend) -> Config {
        let mut config = Config::from_env().unwrap();
        config.database_url = "memory".into();
        config.signing_backend = backend;
        config.network_passphrase = TEST_NETWORK_PASSPHRASE.into();
        config
    }

    fn tracker(network: Arc<MockNetwork>) -> Arc<LedgerTracker> {
        Arc::new(LedgerTracker::new(
            network,
            Duration::from_secs(5),
            Duration::from_secs(1),
            Duration::from_millis(200),
        ))
    }

    #[tokio::test]
    async fn test_env_backend_registers_its_account() {
        let key = KeyPair::random();
        let mut config = config(SigningBackend::Env);
        config.distribution_seed = Some(key.secret_seed());
        let stores = initialize_stores(&config).await.unwrap();
        let network = Arc::new(MockNetwork::at_ledger(3));

        let signing = initialize_signing(&config, &stores, network.clone(), tracker(network))
            .await
            .unwrap();
        assert_eq!(signing.signer.backend(), SigningBackend::Env);
        assert_eq!(signing.resolver.resolve("default"), key.public_key());
        let account = stores.accounts.get_account(key.public_key()).await.unwrap();
        assert_eq!(account.state, AccountState::Active);
    }

    #[tokio::test]
    async fn test_bad_seed_is_fatal() {
        let mut config = config(SigningBackend::Env);
        config.distribution_seed = Some("SNOTAKEY".into());
        let stores = initialize_stores(&config).await.unwrap();
        let network = Arc::new(MockNetwork::at_ledger(3));

        let result = initialize_signing(&config, &stores, network.clone(), tracker(network)).await;
        assert!(matches!(result, Err(AppError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_pool_backend_provisions_channel_accounts() {
        let funder = KeyPair::random();
        let mut config = config(SigningBackend::Pool);
        config.distribution_seed = Some(funder.secret_seed());
        config.key_encryption_passphrase = Some("secret".into());
        config.num_channel_accounts = 2;
        let stores = initialize_stores(&config).await.unwrap();
        let network = Arc::new(MockNetwork::at_ledger(3));
        network.set_sequence(funder.public_key(), 10);

        let signing = initialize_signing(&config, &stores, network.clone(), tracker(network))
            .await
            .unwrap();
        let accounts = signing.accounts.expect("pool backend manages channel accounts");
        assert_eq!(accounts.funder_account(), funder.public_key());
        assert_eq!(signing.resolver.resolve("default"), funder.public_key());
        assert_eq!(signing.resolver.backend(), SigningBackend::Pool);

        // the funder pays; it signs alongside the channels
        let funder_record = stores.accounts.get_account(funder.public_key()).await.unwrap();
        assert_eq!(funder_record.state, AccountState::Active);
        let channels = stores
            .accounts
            .list_accounts(Some(SigningBackend::Pool), Some(AccountState::Active))
            .await
            .unwrap();
        assert_eq!(channels.len(), 2);
    }

    #[tokio::test]
    async fn test_custody_key_must_be_valid() {
        let mut config = config(SigningBackend::Custody);
        config.custody_url = Some("http://localhost:9".into());
        config.distribution_public_key = Some("GBAD".into());
        let stores = initialize_stores(&config).await.unwrap();
        let network = Arc::new(MockNetwork::at_ledger(3));

        let result = initialize_signing(&config, &stores, network.clone(), tracker(network)).await;
        assert!(matches!(result, Err(AppError::Fatal(_))));
    }
}
