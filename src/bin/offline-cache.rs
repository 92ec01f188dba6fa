use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use offline_cache::{
    AppConfig, Cache, CacheStorage, DiskCacheStorage, LifecycleEvent, LogObserver,
    MemoryCacheStorage, Observers, ReqwestNetwork, StatsObserver, StorageBackend, Worker,
    WorkerHost,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Serve,
    Install,
    Activate,
    List,
}

struct CliArgs {
    command: Command,
    config_path: Option<PathBuf>,
    origin: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    storage_dir: Option<PathBuf>,
    memory: bool,
}

impl CliArgs {
    /// Command line flags win over the config file.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(origin) = &self.origin {
            config.network.origin.clone_from(origin);
        }
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = &self.storage_dir {
            config.storage.dir.clone_from(dir);
            config.storage.backend = StorageBackend::Disk;
        }
        if self.memory {
            config.storage.backend = StorageBackend::Memory;
        }
    }
}

fn require_value(args: &[String], i: usize, flag: &str) -> String {
    args.get(i).cloned().unwrap_or_else(|| {
        eprintln!("Error: {flag} requires a value");
        std::process::exit(1);
    })
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = env::args().skip(1).collect();

    let mut command = None;
    let mut config_path = None;
    let mut origin = None;
    let mut host = None;
    let mut port = None;
    let mut storage_dir = None;
    let mut memory = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                i += 1;
                config_path = Some(PathBuf::from(require_value(&args, i, "--config")));
            }
            "--origin" => {
                i += 1;
                origin = Some(require_value(&args, i, "--origin"));
            }
            "--host" => {
                i += 1;
                host = Some(require_value(&args, i, "--host"));
            }
            "-p" | "--port" => {
                i += 1;
                let value = require_value(&args, i, "--port");
                port = Some(value.parse().unwrap_or_else(|_| {
                    eprintln!("Error: invalid port: {value}");
                    std::process::exit(1);
                }));
            }
            "--storage-dir" => {
                i += 1;
                storage_dir = Some(PathBuf::from(require_value(&args, i, "--storage-dir")));
            }
            "--memory" => memory = true,
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') && command.is_none() => {
                command = Some(match arg {
                    "serve" => Command::Serve,
                    "install" => Command::Install,
                    "activate" => Command::Activate,
                    "list" => Command::List,
                    other => {
                        eprintln!("Unknown command: {other}");
                        print_usage();
                        std::process::exit(1);
                    }
                });
            }
            _ => {
                eprintln!("Unknown option: {}", args[i]);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    CliArgs {
        command: command.unwrap_or(Command::Serve),
        config_path,
        origin,
        host,
        port,
        storage_dir,
        memory,
    }
}

fn print_usage() {
    eprintln!("Usage: offline-cache [COMMAND] [OPTIONS]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  serve               Install, activate and proxy requests cache first (default)");
    eprintln!("  install             Fetch the asset manifest into the primary cache");
    eprintln!("  activate            Delete caches that are not allow-listed");
    eprintln!("  list                Show caches and their entries");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <FILE> TOML configuration file");
    eprintln!("  --origin <URL>      Origin that relative URLs resolve against");
    eprintln!("  --host <HOST>       Proxy bind address (default: 127.0.0.1)");
    eprintln!("  -p, --port <PORT>   Proxy bind port (default: 9724)");
    eprintln!("  --storage-dir <DIR> Store caches on disk under DIR");
    eprintln!("  --memory            Keep caches in memory only");
    eprintln!("  -h, --help          Show this help");
}

async fn list_caches<S: CacheStorage>(storage: &S) -> offline_cache::Result<()> {
    let names = storage.keys().await?;
    if names.is_empty() {
        println!("No caches");
        return Ok(());
    }
    for name in names {
        let keys = storage.open(&name).await?.keys().await?;
        println!("{name} ({} entries)", keys.len());
        for key in keys {
            println!("  {key}");
        }
    }
    Ok(())
}

async fn run<S: CacheStorage + 'static>(
    command: Command,
    config: &AppConfig,
    storage: S,
) -> offline_cache::Result<()> {
    let stats = Arc::new(StatsObserver::new());
    let observers = Observers::new()
        .with(Arc::new(LogObserver))
        .with(stats.clone());
    let network = ReqwestNetwork::new(&config.network)?;
    let worker = Worker::new(config.worker.clone(), storage, network)
        .with_observer(Arc::new(observers));

    match command {
        Command::List => list_caches(worker.storage()).await,
        Command::Install => {
            let report = worker.install().await?;
            println!(
                "Cached {} entries ({} bytes) in {}",
                report.entries, report.bytes, report.cache_name
            );
            Ok(())
        }
        Command::Activate => {
            let report = worker.activate().await?;
            println!(
                "Kept {:?}, deleted {:?}",
                report.kept, report.deleted
            );
            Ok(())
        }
        Command::Serve => {
            let host = Arc::new(WorkerHost::new(worker));
            if let Err(e) = host.dispatch(LifecycleEvent::Install).await {
                log::error!("Install failed: {e}");
                if host.state().can_intercept_fetch() {
                    log::info!("Serving from caches left by the previous install");
                } else {
                    log::warn!("No previous install, requests go straight to the network");
                }
            } else if let Err(e) = host.dispatch(LifecycleEvent::Activate).await {
                log::warn!("Activation finished with errors: {e}");
            }
            serve(host, stats, config).await
        }
    }
}

#[cfg(feature = "server")]
async fn serve<S: CacheStorage + 'static>(
    host: Arc<WorkerHost<S, ReqwestNetwork>>,
    stats: Arc<StatsObserver>,
    config: &AppConfig,
) -> offline_cache::Result<()> {
    offline_cache::server::run_server(host, stats, &config.server).await
}

#[cfg(not(feature = "server"))]
async fn serve<S: CacheStorage + 'static>(
    _host: Arc<WorkerHost<S, ReqwestNetwork>>,
    _stats: Arc<StatsObserver>,
    _config: &AppConfig,
) -> offline_cache::Result<()> {
    eprintln!("Proxy support not compiled in");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> offline_cache::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args();
    let mut config = AppConfig::load_or_default(args.config_path.as_deref())?;
    args.apply(&mut config);

    match config.storage.backend {
        StorageBackend::Memory => run(args.command, &config, MemoryCacheStorage::new()).await,
        StorageBackend::Disk => {
            log::info!("Using cache storage at {}", config.storage.dir.display());
            let storage = DiskCacheStorage::new(config.storage.dir.clone());
            run(args.command, &config, storage).await
        }
    }
}
