//! Mount a nimbus object-storage server as a local filesystem.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use nimbus_api::{ApiClient, ApiError, CliRunner, HttpRunner, ObjectApi, Runner};
use nimbus_fs::config::{CacheMode, CacheOptions, ConfigOptions};
use nimbus_fs::filedata::cache_manager::CacheManager;
use nimbus_fs::fuse::{serve, FuseAdapter};
use nimbus_fs::item::Item;
use nimbus_fs::Mount;

/// Exit code for bad usage.
const EXIT_USAGE: i32 = 1;
/// Exit code for backend initialization failure.
const EXIT_BACKEND: i32 = 2;
/// Exit code for bridge/mount failure.
const EXIT_MOUNT: i32 = 3;

#[derive(Parser)]
#[command(version, about = "Mount a nimbus server as a local filesystem.")]
struct Args {
    /// Where to mount the filesystem.
    #[arg(long)]
    mount: PathBuf,

    /// Server API base URL.
    #[arg(long, conflicts_with = "apipath")]
    apiurl: Option<String>,

    /// Path to a local server CLI installation.
    #[arg(long)]
    apipath: Option<PathBuf>,

    /// Account to sign in as.
    #[arg(long)]
    username: Option<String>,

    /// Environment variable holding the account password.
    #[arg(long, default_value = "NIMBUS_PASSWORD")]
    password_env: String,

    /// Reject all writes regardless of server permissions.
    #[arg(long)]
    read_only: bool,

    /// Log verbosity (repeatable value: 1=info, 2=debug, 3=trace).
    #[arg(long, value_name = "LEVEL", num_args = 0..=1, default_missing_value = "2")]
    debug: Option<u8>,

    /// File data caching behavior.
    #[arg(long, value_parser = parse_cache_mode, default_value = "normal")]
    cachemode: CacheMode,

    /// Page size for file data, in bytes.
    #[arg(long, default_value_t = 128 * 1024)]
    pagesize: usize,

    /// Seconds a folder listing stays fresh.
    #[arg(long, default_value_t = 15)]
    folder_refresh: u64,

    /// Cache memory budget, in bytes.
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    memory_limit: u64,

    /// Dirty-data budget as transfer time, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    dirty_msec: u64,

    /// Pretend chmod succeeds instead of returning ENOTSUP.
    #[arg(long)]
    fake_chmod: bool,

    /// Pretend chown succeeds instead of returning ENOTSUP.
    #[arg(long)]
    fake_chown: bool,

    /// Extra FUSE mount options (repeatable).
    #[arg(short = 'o', value_name = "OPTION")]
    fuse_options: Vec<String>,
}

fn parse_cache_mode(value: &str) -> Result<CacheMode, String> {
    match value {
        "none" => Ok(CacheMode::None),
        "memory" => Ok(CacheMode::Memory),
        "normal" => Ok(CacheMode::Normal),
        other => Err(format!("unknown cache mode '{other}'")),
    }
}

fn init_tracing(level: Option<u8>) {
    let directive = match level {
        None => "nimbus_fs=info,nimbus_api=info",
        Some(0 | 1) => "nimbus_fs=info,nimbus_api=info",
        Some(2) => "nimbus_fs=debug,nimbus_api=debug",
        Some(_) => "nimbus_fs=trace,nimbus_api=trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(EXIT_USAGE);
        }
    };

    if args.apiurl.is_none() && args.apipath.is_none() {
        eprintln!("one of --apiurl or --apipath is required");
        std::process::exit(EXIT_USAGE);
    }

    init_tracing(args.debug);

    let code = match (&args.apiurl, &args.apipath) {
        (Some(url), _) => match HttpRunner::new(url) {
            Ok(runner) => run(args, runner),
            Err(e) => {
                error!(error = %e, "failed to build HTTP transport");
                EXIT_BACKEND
            }
        },
        (None, Some(path)) => {
            let path = path.clone();
            run_cli(args, path)
        }
        (None, None) => unreachable!("checked above"),
    };
    std::process::exit(code);
}

fn run_cli(args: Args, path: PathBuf) -> i32 {
    run(args, CliRunner::new(path))
}

fn run<R: Runner + 'static>(args: Args, runner: R) -> i32 {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return EXIT_BACKEND;
        }
    };

    let client = Arc::new(ApiClient::new(runner));

    // Backend bootstrap: session, server config, account limits. Errors
    // here are surfaced immediately — transparent retries only start
    // once the daemon reaches steady state.
    let setup = runtime.block_on(bootstrap(&args, &client));
    let (mount, root, cache) = match setup {
        Ok(parts) => parts,
        Err(e) => {
            error!(error = %e, "backend initialization failed");
            return EXIT_BACKEND;
        }
    };

    client.enable_retry();
    info!(mountpoint = %args.mount.display(), backend = %client.name(), "mounting");

    let adapter = FuseAdapter::new(Arc::clone(&mount), Arc::clone(&root), runtime.handle().clone());
    let served = serve(adapter, &args.mount, args.read_only, &args.fuse_options);

    // Unmounted (or failed): push dirty data out, close the session and
    // stop the cache workers. Teardown flushes are nothrow so it always
    // completes.
    runtime.block_on(async {
        if let Err(e) = root.flush_tree(true).await {
            error!(error = %e, "final flush failed");
        }
        if let Err(e) = client.close_session().await {
            error!(error = %e, "session teardown failed");
        }
        cache.shutdown().await;
    });

    match served {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "mount failed");
            EXIT_MOUNT
        }
    }
}

async fn bootstrap<R: Runner + 'static>(
    args: &Args,
    client: &Arc<ApiClient<R>>,
) -> Result<(Arc<Mount>, Arc<Item>, Arc<CacheManager>), ApiError> {
    if let Some(username) = &args.username {
        let password = std::env::var(&args.password_env).unwrap_or_default();
        if password.is_empty() && client.requires_session() {
            return Err(ApiError::AuthFailed);
        }
        if !password.is_empty() {
            client.authenticate(username, &password, None).await?;
        }
    }

    let server = client.server_config().await?;
    info!(apiversion = server.apiversion, "connected");

    let limits = if args.cachemode == CacheMode::Memory {
        None
    } else {
        client.account_limits().await.ok()
    };

    let options = ConfigOptions {
        cache_mode: args.cachemode,
        page_size: args.pagesize.max(4096),
        refresh_interval: Duration::from_secs(args.folder_refresh),
        read_only: args.read_only || server.readonly,
        fake_chmod: args.fake_chmod,
        fake_chown: args.fake_chown,
        ..ConfigOptions::default()
    };

    let cache = CacheManager::spawn(CacheOptions {
        memory_limit: args.memory_limit,
        max_dirty_time: Duration::from_millis(args.dirty_msec),
        ..CacheOptions::default()
    });

    let api: Arc<dyn ObjectApi> = Arc::clone(client) as Arc<dyn ObjectApi>;
    let mount = Mount::new(
        api,
        options,
        Arc::clone(&cache),
        limits.and_then(|l| l.upload_maxbytes),
    );
    let root = Item::super_root(&mount);

    Ok((mount, root, cache))
}
