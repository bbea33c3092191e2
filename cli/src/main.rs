use anyhow::{anyhow, bail, Context};
use clap::{ArgAction, Args, Parser, Subcommand};
use netrecon_core::settings::LoggingSettings;
use netrecon_core::{
    hosts_table, load_scan_result, save_scan_result, scans_table, targets_table,
    FormatterRegistry, Repository, ScanConfig, ScanError, ScanResult, ScanTarget,
    ScannerRegistry, Settings, SqliteStore,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DEFAULT_SCANNER: &str = "nmap";

#[derive(Debug, Parser)]
#[command(author, version, about = "Network reconnaissance with nmap and masscan")]
struct NetreconCli {
    /// Config file (default: ./netrecon.toml, ./configs/netrecon.toml, ~/.netrecon/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan a target with one of the available scanners
    Scan(ScanArgs),
    /// List the scanners found on this system
    Scanners,
    /// Manage scan targets
    Target {
        #[command(subcommand)]
        command: TargetCommand,
    },
    /// Inspect stored scan results
    #[command(name = "result")]
    Results {
        #[command(subcommand)]
        command: ResultCommand,
    },
    /// Show or create the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Host, range, or domain to scan
    target: String,
    /// Scanner to use (nmap, masscan)
    #[arg(short, long)]
    scanner: Option<String>,
    /// Port specification, e.g. 22,80,8000-8100
    #[arg(short, long)]
    ports: Option<String>,
    /// Timing template (0-5 for nmap)
    #[arg(short = 'T', long)]
    timing: Option<String>,
    /// Additional scanner arguments, split like a shell would; added after a preset's own
    #[arg(short = 'A', long = "args", allow_hyphen_values = true)]
    arguments: Option<String>,
    /// Packets per second (masscan)
    #[arg(long)]
    rate: Option<u32>,
    /// Deadline in seconds; 0 disables it
    #[arg(long)]
    timeout: Option<u64>,
    /// Named preset from the config file
    #[arg(long)]
    preset: Option<String>,
    /// Adapter option (format: key=value), e.g. scripts=http-title or banners=true
    #[arg(long = "option", value_parser = parse_key_val, value_name = "KEY=VALUE", action = ArgAction::Append)]
    options: Vec<(String, String)>,
    /// Write a rendered report to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Report format for --output
    #[arg(short, long, default_value = "json")]
    format: String,
    /// Do not store the result
    #[arg(long)]
    no_save: bool,
    /// Print the result as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum TargetCommand {
    /// Register a target
    Add {
        target: String,
        description: Option<String>,
    },
    /// List registered targets
    List,
}

#[derive(Debug, Subcommand)]
enum ResultCommand {
    /// List stored scans, newest first
    List {
        /// Only scans of this target
        #[arg(long)]
        target: Option<Uuid>,
    },
    /// Show one stored scan
    Show {
        id: Uuid,
        /// Output JSON instead of a human-readable summary
        #[arg(long)]
        json: bool,
    },
    /// Render a stored scan in another format
    Export {
        id: Uuid,
        #[arg(short, long, default_value = "json")]
        format: String,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective settings as TOML
    Show,
    /// Write a default config file
    Init {
        /// Destination (default: ~/.netrecon/config.toml)
        #[arg(long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = NetreconCli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load config")?;
    init_logging(cli.verbose, &settings.logging)?;

    match cli.command {
        Command::Scan(args) => run_scan(&settings, args).await?,
        Command::Scanners => list_scanners(&settings),
        Command::Target { command } => run_target(&settings, command)?,
        Command::Results { command } => run_result(&settings, command)?,
        Command::Config { command } => run_config(&settings, command)?,
    }

    Ok(())
}

/// `RUST_LOG` wins, then `-v`, then the configured level. Logs go to stderr.
fn init_logging(verbose: bool, logging: &LoggingSettings) -> anyhow::Result<()> {
    let fallback = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .with_context(|| format!("invalid log level '{fallback}'"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match logging.format.as_str() {
        "text" | "" => builder.init(),
        "compact" => builder.compact().init(),
        other => bail!("unsupported log format '{other}' (expected text or compact)"),
    }
    Ok(())
}

fn open_store(settings: &Settings) -> anyhow::Result<SqliteStore> {
    let path = settings.storage.database_path();
    SqliteStore::open(&path)
        .with_context(|| format!("failed to open store at {}", path.display()))
}

fn build_scan_config(settings: &Settings, args: &ScanArgs) -> anyhow::Result<(String, ScanConfig)> {
    let preset = match &args.preset {
        Some(name) => Some(
            settings
                .scanner
                .presets
                .get(name)
                .ok_or_else(|| anyhow!("unknown preset '{name}'"))?,
        ),
        None => None,
    };

    let scanner = args
        .scanner
        .clone()
        .or_else(|| preset.and_then(|preset| preset.scanner.clone()))
        .unwrap_or_else(|| DEFAULT_SCANNER.to_string());

    let mut config = match preset {
        Some(preset) => preset.apply(ScanConfig::new())?,
        None => ScanConfig::new(),
    };
    if let Some(ports) = &args.ports {
        config.ports = Some(ports.clone());
    }
    if config.port_spec().is_none() {
        config.ports = Some(settings.scanner.default_ports.clone());
    }
    if let Some(timing) = &args.timing {
        config.timing = Some(timing.clone());
    }
    if let Some(line) = &args.arguments {
        config = config.extend_argument_line(line)?;
    }
    config.rate = Some(args.rate.unwrap_or(settings.scanner.max_rate));
    config.timeout = match args.timeout {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => settings.scanner.default_timeout(),
    };
    for (key, value) in &args.options {
        config.options.insert(key.clone(), value.clone());
    }

    Ok((scanner, config))
}

async fn run_scan(settings: &Settings, args: ScanArgs) -> anyhow::Result<()> {
    let (scanner_name, config) = build_scan_config(settings, &args)?;
    let registry = ScannerRegistry::discover(&settings.scanner);
    let scanner = registry.get(&scanner_name).ok_or_else(|| {
        anyhow!(
            "scanner '{scanner_name}' not available (available: {})",
            display_names(&registry.names())
        )
    })?;

    let formatters = FormatterRegistry::with_defaults();
    if args.output.is_some() {
        formatters.get(&args.format)?;
    }

    let store = if args.no_save {
        None
    } else {
        Some(open_store(settings)?)
    };
    let target_id = match &store {
        Some(store) => store.find_target(&args.target)?.map(|target| target.id),
        None => None,
    };

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping scan");
            signal.cancel();
        }
    });

    let (result, failure) = match scanner.scan(&cancel, &args.target, &config).await {
        Ok(result) => (result, None),
        Err(ScanError::Execution { result, source }) => (*result, Some(source)),
        Err(err) => return Err(err.into()),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    if let Some(store) = &store {
        save_scan_result(store, target_id, &result).context("failed to save scan result")?;
        info!(scan_id = %result.id, "scan result saved");
    }

    if let Some(path) = &args.output {
        formatters.format_and_save(&result, &args.format, path)?;
    }

    if let Some(source) = failure {
        return Err(anyhow::Error::new(source)
            .context(format!("{} scan of {} failed", result.scanner, result.target)));
    }
    Ok(())
}

fn list_scanners(settings: &Settings) {
    let registry = ScannerRegistry::discover(&settings.scanner);
    if registry.is_empty() {
        println!("No scanners available. Install nmap or masscan, or set scanner.nmap_path / scanner.masscan_path.");
        return;
    }
    println!("Available scanners:");
    for name in registry.names() {
        println!("  - {name}");
    }
}

fn run_target(settings: &Settings, command: TargetCommand) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    match command {
        TargetCommand::Add {
            target,
            description,
        } => {
            if let Some(existing) = store.find_target(&target)? {
                bail!("target '{target}' is already registered as {}", existing.id);
            }
            let target = ScanTarget::new(target, description.unwrap_or_default());
            store.create_target(&target)?;
            println!(
                "Added target {} ({}) as {}",
                target.target,
                target.kind.as_str(),
                target.id
            );
        }
        TargetCommand::List => {
            let targets = store.list_targets()?;
            if targets.is_empty() {
                println!("No targets registered.");
            } else {
                println!("{}", targets_table(&targets));
            }
        }
    }
    Ok(())
}

fn run_result(settings: &Settings, command: ResultCommand) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    match command {
        ResultCommand::List { target } => {
            if let Some(id) = target {
                store.get_target(id)?;
            }
            let scans = store.list_scans(target)?;
            if scans.is_empty() {
                println!("No stored scans.");
            } else {
                println!("{}", scans_table(&scans));
            }
        }
        ResultCommand::Show { id, json } => {
            let result = load_scan_result(&store, id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }
        }
        ResultCommand::Export { id, format, output } => {
            let result = load_scan_result(&store, id)?;
            let formatters = FormatterRegistry::with_defaults();
            match output {
                Some(path) => {
                    formatters.format_and_save(&result, &format, &path)?;
                    println!("Wrote {format} report to {}", path.display());
                }
                None => {
                    let bytes = formatters.render(&result, &format)?;
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&bytes)?;
                    stdout.flush()?;
                }
            }
        }
    }
    Ok(())
}

fn run_config(settings: &Settings, command: ConfigCommand) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Show => print!("{}", settings.to_toml()?),
        ConfigCommand::Init { path, force } => {
            let path = match path {
                Some(path) => path,
                None => Settings::default_path()?,
            };
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            Settings::default().save(&path)?;
            println!("Wrote default config to {}", path.display());
        }
    }
    Ok(())
}

fn print_summary(result: &ScanResult) {
    println!("Scan {}", result.id);
    println!("  target:   {}", result.target);
    println!("  scanner:  {}", result.scanner);
    println!("  status:   {}", result.status);
    println!("  duration: {}", result.duration);
    println!(
        "  hosts:    {} ({} ports)",
        result.hosts.len(),
        result.port_count()
    );
    if let Some(error) = &result.error {
        println!("  error:    {error}");
    }
    if !result.hosts.is_empty() {
        println!("\n{}", hosts_table(result));
    }
}

fn display_names(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 || parts[0].trim().is_empty() {
        return Err(format!("expected KEY=VALUE, got '{s}'"));
    }
    Ok((parts[0].trim().to_string(), parts[1].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_args(extra: &[&str]) -> ScanArgs {
        let mut argv = vec!["netrecon", "scan", "10.0.0.1"];
        argv.extend_from_slice(extra);
        match NetreconCli::parse_from(argv).command {
            Command::Scan(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn scan_defaults_come_from_settings() {
        let settings = Settings::default();
        let (scanner, config) =
            build_scan_config(&settings, &scan_args(&[])).expect("build config");

        assert_eq!(scanner, "nmap");
        assert_eq!(config.ports.as_deref(), Some("1-1000"));
        assert_eq!(config.rate, Some(1000));
        assert_eq!(config.timeout, Some(Duration::from_secs(300)));
        assert!(config.timing.is_none());
        assert!(config.arguments.is_empty());
    }

    #[test]
    fn flags_override_preset_values() {
        let mut settings = Settings::default();
        settings.scanner.presets.insert(
            "sweep".to_string(),
            netrecon_core::Preset {
                scanner: Some("masscan".to_string()),
                ports: Some("1-65535".to_string()),
                arguments: Some("--wait 0".to_string()),
                timing: None,
            },
        );

        let args = scan_args(&[
            "--preset",
            "sweep",
            "--ports",
            "80,443",
            "--rate",
            "20000",
            "--timeout",
            "0",
            "--option",
            "banners=true",
        ]);
        let (scanner, config) = build_scan_config(&settings, &args).expect("build config");

        assert_eq!(scanner, "masscan");
        assert_eq!(config.ports.as_deref(), Some("80,443"));
        assert_eq!(config.arguments, vec!["--wait", "0"]);
        assert_eq!(config.rate, Some(20000));
        assert_eq!(config.timeout, None);
        assert!(config.option_enabled("banners"));
    }

    #[test]
    fn extra_arguments_follow_the_preset_arguments() {
        let mut settings = Settings::default();
        settings.scanner.presets.insert(
            "quiet".to_string(),
            netrecon_core::Preset {
                scanner: Some("masscan".to_string()),
                ports: None,
                arguments: Some("--wait 0".to_string()),
                timing: None,
            },
        );

        let args = scan_args(&["--preset", "quiet", "--args=--banners --retries 2"]);
        let (_, config) = build_scan_config(&settings, &args).expect("build config");
        assert_eq!(
            config.arguments,
            vec!["--wait", "0", "--banners", "--retries", "2"]
        );
    }

    #[test]
    fn unknown_preset_is_an_error() {
        let err = build_scan_config(&Settings::default(), &scan_args(&["--preset", "nope"]))
            .expect_err("missing preset");
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn key_value_options_require_a_key() {
        assert_eq!(
            parse_key_val("scripts=http-title,ssl-cert"),
            Ok(("scripts".to_string(), "http-title,ssl-cert".to_string()))
        );
        assert!(parse_key_val("=value").is_err());
        assert!(parse_key_val("novalue").is_err());
    }
}
