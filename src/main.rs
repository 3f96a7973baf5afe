use climate_tray::client::{self, HttpTransport, Transport};
use climate_tray::config::Config;
use climate_tray::registry::{self, Registry};
use climate_tray::services::climate::ClimateService;
use climate_tray::services::devices::{DeviceService, StateListener};
use climate_tray::services::scheduler::Callbacks;
use climate_tray::services::simulator::SimulatedController;
use climate_tray::services::version;
use log::{error, info, warn};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

mod env_file;

/// Where the `.env` values came from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EnvSource {
    /// `--env-file PATH`; must exist.
    Explicit(PathBuf),
    /// `./.env`, used only when present.
    WorkingDir(PathBuf),
}

#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    env_file: Option<PathBuf>,
    /// Poll and match once, print the result and exit.
    once: bool,
}

/// Logs the active presets after every matching pass.
struct LogListener;

impl StateListener for LogListener {
    fn refresh(&self, registry: &Registry) {
        let active = registry.active_presets().map(|p| p.name.as_str()).collect::<Vec<_>>();
        if active.is_empty() {
            info!("No preset active");
        } else {
            info!("Active preset(s): {}", active.join(", "));
        }
        if !registry.is_any_device_enabled_and_working() {
            warn!("No enabled device is working");
        }
    }
}

pub fn run(once: bool) -> Result<(), String> {
    // 1) Load config and registry
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (registry={}, poll_interval={}s, http_timeout={}s, proxy={}, match_rule={:?}, simulate={})",
        cfg.registry_file.display(),
        cfg.poll_interval.as_secs(),
        cfg.http_timeout.as_secs(),
        cfg.proxy.as_ref().map(|p| format!("{}:{}", p.host, p.port)).unwrap_or_else(|| "-".to_string()),
        cfg.match_rule,
        cfg.simulate
    );

    let registry = Registry::load(&cfg.registry_file)?;
    info!(
        "Registry loaded: {} device(s), {} preset(s)",
        registry.devices.len(),
        registry.presets.len()
    );
    for device in &registry.devices {
        info!("{}", device.describe_settings());
    }

    // 2) Transport
    let agent = client::build_agent(cfg.proxy.as_ref(), cfg.http_timeout).map_err(|e| format!("HTTP client setup failed: {}", e))?;
    let transport: Box<dyn Transport> = if cfg.simulate {
        let simulator = SimulatedController::new(rand::random());
        simulator.populate(&registry);
        info!("Using simulated controllers");
        Box::new(simulator)
    } else {
        Box::new(HttpTransport::new(agent.clone()))
    };

    let registry = registry.into_shared();
    let service = DeviceService::new(transport, registry.clone(), cfg.match_rule).with_listener(Box::new(LogListener));

    // 3) One-shot mode: poll on this thread and print
    if once {
        let summary = service.update();
        let registry = registry::lock(&registry);
        for device in &registry.devices {
            println!("{}", device.describe_state());
        }
        for preset in &registry.presets {
            println!("[{}] {}", if preset.active { "x" } else { " " }, preset.name);
        }
        info!(
            "Poll complete: working={}, failed={}, discarded={}",
            summary.working, summary.failed, summary.discarded
        );
        return Ok(());
    }

    // 4) Background worker with the recurring poll
    let mut climate = ClimateService::start(service, cfg.poll_interval)?;
    let period = climate
        .schedule_recurring_poll(cfg.poll_interval.as_secs())
        .map_err(|e| format!("scheduling the poll failed: {}", e))?;
    info!("Polling every {}s", period.as_secs());

    match (cfg.version_check_enabled, cfg.version_check_url.clone()) {
        (true, Some(url)) => {
            let callbacks = Callbacks::new()
                .on_success(|found: &Option<version::BuildInfo>| match found {
                    Some(info) => info!(
                        "Version {} is available{}",
                        info.version,
                        info.url.as_deref().map(|u| format!(" at {}", u)).unwrap_or_default()
                    ),
                    None => info!("Running the latest version"),
                })
                .on_error(|e| warn!("Version check failed: {}", e));
            climate
                .submit_ad_hoc(move |_| Ok(version::check_version(&agent, &url)?), callbacks)
                .map_err(|e| format!("submitting the version check failed: {}", e))?;
        }
        (true, None) => info!("Version check skipped: VERSION_CHECK_URL is not set"),
        (false, _) => info!("Version check disabled via VERSION_CHECK_ENABLED"),
    }

    climate.join();
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = OsString>) -> Result<CliArgs, String> {
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let arg = arg
            .into_string()
            .map_err(|a| format!("argument is not valid UTF-8: {}", a.to_string_lossy()))?;
        let path = match arg.as_str() {
            "--once" => {
                parsed.once = true;
                continue;
            }
            "--" => break,
            "--env-file" => args.next().map(PathBuf::from),
            other => match other.strip_prefix("--env-file=") {
                Some(value) => Some(value).filter(|v| !v.is_empty()).map(PathBuf::from),
                None => return Err(format!("unrecognised argument: {}", other)),
            },
        };
        let path = path.ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
        if parsed.env_file.replace(path).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }
    Ok(parsed)
}

/// Picks the `.env` file to load, if any.
fn env_source(args: &CliArgs, cwd: &Path) -> Result<Option<EnvSource>, String> {
    match &args.env_file {
        Some(path) if path.is_file() => Ok(Some(EnvSource::Explicit(path.clone()))),
        Some(path) => Err(format!("env file not found: {}", path.display())),
        None => {
            let default = cwd.join(".env");
            Ok(default.is_file().then_some(EnvSource::WorkingDir(default)))
        }
    }
}

fn prepare() -> Result<(CliArgs, Option<(EnvSource, usize)>), String> {
    let args = parse_args(std::env::args_os().skip(1))?;
    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let loaded = match env_source(&args, &cwd)? {
        Some(source) => {
            let path = match &source {
                EnvSource::Explicit(p) | EnvSource::WorkingDir(p) => p,
            };
            let applied = env_file::load(path)?;
            Some((source, applied))
        }
        None => None,
    };
    Ok((args, loaded))
}

fn main() {
    let (args, loaded) = match prepare() {
        Ok(prepared) => prepared,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // After the .env file so RUST_LOG from it applies.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    match loaded {
        Some((EnvSource::Explicit(path), applied)) => {
            info!("Loaded {} variable(s) from {}", applied, path.display())
        }
        Some((EnvSource::WorkingDir(path), applied)) => {
            info!("Loaded {} variable(s) from default .env file {}", applied, path.display())
        }
        None => {}
    }

    info!(
        "climate-tray {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(args.once) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
