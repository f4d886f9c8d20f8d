use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, Command};
use log::{error, info};

use vaulthalla::config::Config;
use vaulthalla::crypto::{InMemoryMasterKeyProvider, KeyMaterial, MasterKeyProvider};
use vaulthalla::db::{queries, Pool};
use vaulthalla::error::VaultResult;
use vaulthalla::fsops::FsOps;
use vaulthalla::manager::StorageManager;
use vaulthalla::path::PathRoots;
use vaulthalla::registry::EntryRegistry;
use vaulthalla::s3::{S3Client, S3Credentials};
use vaulthalla::scheduler::SyncController;
use vaulthalla::storage::Engine;
use vaulthalla::types::{ROOT_ENTRY_ID, VaultType};
use vaulthalla::workerpool::WorkerPool;
use vaulthalla::{crypto, fuse_bridge, logging};

/// How often the sync controller ticks over the active vault set. Not
/// currently exposed in `Config`; a fixed interval matches the teacher's
/// own `background_worker.rs`, which has no configurable period either.
const SYNC_TICK_INTERVAL_SECS: u64 = 30;

fn main() {
    let matches = Command::new("vaulthalla")
        .version("0.1.0")
        .about("FUSE-mediated vault filesystem unifying local disk and S3-compatible storage")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .takes_value(true)
                .help("configuration file path")
                .required(true),
        )
        .get_matches();

    let config_path = matches.value_of("config").expect("required arg");
    let config = Config::load(Path::new(config_path)).expect("failed to load config");

    logging::init(&config.logging);
    info!("vaulthalla starting, config loaded from {}", config_path);

    if let Err(err) = run(config) {
        error!("fatal startup error: {}", err);
        std::process::exit(1);
    }
}

fn run(config: Config) -> VaultResult<()> {
    let mountpoint = PathBuf::from(&config.fuse.root_mount_path);
    if !mountpoint.exists() {
        return Err(vaulthalla::error::VaultError::InvalidArgument(format!(
            "mount point {} does not exist",
            mountpoint.display()
        )));
    }

    let backing_root = PathBuf::from(config.backing_root());
    std::fs::create_dir_all(&backing_root)?;
    let db_path = backing_root.join(format!("{}.sqlite3", config.database.name));
    let pool = Pool::open(&db_path, config.database.pool_size)?;

    let master_key_provider: Arc<dyn MasterKeyProvider> = if config.dev.enabled {
        info!("dev.enabled is set: using an ephemeral in-memory master key");
        Arc::new(InMemoryMasterKeyProvider::ephemeral())
    } else {
        // The hardware-backed (TPM) key provider is out of scope for this
        // crate (see SPEC_FULL.md §1); a fixed, process-lifetime key takes
        // its place until that binding exists.
        Arc::new(InMemoryMasterKeyProvider::new(KeyMaterial::generate()))
    };

    let vaults = pool.with_conn(queries::list_active_vaults)?;

    let mut roots = PathRoots::new(mountpoint.clone(), backing_root.clone());
    for vault in &vaults {
        roots.register_vault(vault.id, &vault.mount_point);
    }

    let manager = StorageManager::new(pool.clone());
    for vault in vaults {
        let engine = match vault.vault_type {
            VaultType::Local => Engine::new_local(vault.clone(), roots.clone()),
            VaultType::S3 => build_cloud_engine(&pool, &master_key_provider, &config, vault.clone(), roots.clone())?,
        };
        manager.register(vault.id, engine);
    }

    let registry = EntryRegistry::new();
    let root_entry = pool.with_conn(|conn| queries::get_entry_by_id(conn, ROOT_ENTRY_ID))?;
    registry.seed_root(root_entry);

    let fsops = Arc::new(FsOps::new(pool.clone(), registry, manager));
    let worker_pool = WorkerPool::hardware_sized();
    info!("worker pool sized to {} threads", worker_pool.capacity());

    let sync_workers = Arc::new(WorkerPool::hardware_sized());
    let controller = Arc::new(SyncController::new(
        pool,
        fsops.clone(),
        sync_workers,
        master_key_provider.clone(),
        Duration::from_secs(SYNC_TICK_INTERVAL_SECS),
    ));
    let shutdown = controller.shutdown_flag();

    let sync_controller = controller.clone();
    let sync_thread = std::thread::spawn(move || sync_controller.run());

    install_signal_handler(shutdown.clone());

    // The FUSE receive loop blocks this thread for the life of the
    // mount (§5): dedicated thread, not the async runtime.
    let mount_result = fuse_bridge::mount(fsops, worker_pool, &config.fuse.root_mount_path, config.fuse.allow_other);

    shutdown.store(true, Ordering::SeqCst);
    let _ = sync_thread.join();

    mount_result
}

fn build_cloud_engine(
    pool: &Pool,
    master_key_provider: &Arc<dyn MasterKeyProvider>,
    config: &Config,
    vault: vaulthalla::types::Vault,
    roots: PathRoots,
) -> VaultResult<Engine> {
    let api_key_id = vault.api_key_id.ok_or_else(|| {
        vaulthalla::error::VaultError::InvalidArgument(format!("S3 vault {} has no api_key_id", vault.id))
    })?;
    let api_key = pool.with_conn(|conn| queries::get_api_key(conn, api_key_id))?;

    let master_key = master_key_provider.master_key()?;
    let wrap_iv = crypto::iv_from_base64(&api_key.iv)?;
    let secret_key = crypto::unwrap(&api_key.encrypted_secret_access_key, &master_key, &wrap_iv)?;
    let secret_access_key = String::from_utf8(secret_key.as_bytes().to_vec())
        .map_err(|e| vaulthalla::error::VaultError::Corrupt(e.to_string()))?;

    let creds = S3Credentials {
        access_key: api_key.access_key.clone(),
        secret_access_key,
        region: api_key.region.clone(),
        endpoint: api_key.endpoint.clone(),
    };
    let bucket = vault.bucket.clone().ok_or_else(|| {
        vaulthalla::error::VaultError::InvalidArgument(format!("S3 vault {} has no bucket", vault.id))
    })?;
    let client = S3Client::new(creds, bucket);

    let vault_key = pool
        .with_conn(|conn| queries::current_vault_key(conn, vault.id))?
        .ok_or_else(|| vaulthalla::error::VaultError::InvalidArgument(format!("vault {} has no data key provisioned", vault.id)))?;
    let key_wrap_iv = crypto::iv_from_base64(&vault_key.wrap_iv)?;
    let data_key = crypto::unwrap(&vault_key.wrapped_key, &master_key, &key_wrap_iv)?;

    Ok(Engine::new_cloud(vault, roots, client, pool.clone(), config.caching.clone(), data_key, vault_key.version))
}

#[cfg(unix)]
fn install_signal_handler(shutdown: Arc<std::sync::atomic::AtomicBool>) {
    // SIGTERM/SIGINT set the process-wide interrupt flag observed between
    // scheduler ticks (§5's cancellation contract); the FUSE thread is
    // unblocked by the kernel unmounting the filesystem separately.
    unsafe {
        SHUTDOWN_FLAG = Some(shutdown);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
    }
}

static mut SHUTDOWN_FLAG: Option<Arc<std::sync::atomic::AtomicBool>> = None;

extern "C" fn handle_signal(_sig: libc::c_int) {
    unsafe {
        if let Some(flag) = SHUTDOWN_FLAG.as_ref() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}
