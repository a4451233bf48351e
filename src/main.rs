mod progress;

use std::{
    env,
    fmt,
    fs::File,
    io::{self, stderr, Stderr},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{debug, Level, log_enabled};
use serde::{Deserialize, Serialize};
use tokio::{signal::ctrl_c, task};

use fuslib::{
    catalogue::Catalogue,
    crypto::FusKeys,
    metadata::{BinaryNature, FirmwareMetadata},
    session::{FusSession, SessionBuilder},
    transfer::{self, DEFAULT_BLOCK_SIZE, TransferError, TransferOptions, TransferPipeline},
    version::FwVersion,
};

use progress::{BinarySize, DrawMode, ProgressReporter};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
enum FirmwareType {
    #[default]
    Home,
    Factory,
}

impl From<FirmwareType> for BinaryNature {
    fn from(value: FirmwareType) -> Self {
        match value {
            FirmwareType::Home => Self::Home,
            FirmwareType::Factory => Self::Factory,
        }
    }
}

impl fmt::Display for FirmwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Home => f.write_str("home"),
            Self::Factory => f.write_str("factory"),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => f.write_str("debug"),
            Self::Trace => f.write_str("trace"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct Config {
    fus_fixed_key: Option<String>,
    fus_flexible_key_suffix: Option<String>,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push(format!("{PKG_NAME}.conf"));
        p
    })
}

fn load_config_file(user_path: Option<&Path>) -> Result<Option<Config>> {
    let default_path = default_config_path();
    let path = user_path.or(default_path.as_deref());

    match path {
        Some(p) => {
            let file = match File::open(p) {
                Ok(f) => f,
                Err(e) => {
                    return if e.kind() == io::ErrorKind::NotFound {
                        Ok(None)
                    } else {
                        Err(e).context(format!("Could not open file: {p:?}"))
                    };
                }
            };

            let config = serde_json::from_reader(file)
                .context(format!("Could not parse config file: {p:?}"))?;

            Ok(Some(config))
        }
        None => Ok(None),
    }
}

/// Load FUS keys from the following list in order:
/// * User-supplied command line arguments
/// * Environment variables
/// * Config file
/// * Built-in keys
fn load_keys(opts: &FusOpts, config: &Option<Config>) -> Result<FusKeys> {
    let fixed_key = opts.fus_fixed_key
        .as_ref()
        .or_else(|| config.as_ref().and_then(|c| c.fus_fixed_key.as_ref()));
    let flexible_key_suffix = opts.fus_flexible_key_suffix
        .as_ref()
        .or_else(|| config.as_ref().and_then(|c| c.fus_flexible_key_suffix.as_ref()));

    match (fixed_key, flexible_key_suffix) {
        (None, None) => Ok(FusKeys::default()),
        (Some(k), Some(s)) => Ok(FusKeys::new(k.as_bytes(), s.as_bytes())?),
        _ => Err(anyhow!("The FUS fixed key and flexible key suffix must be specified together")),
    }
}

/// Device selection shared by all commands
#[derive(Debug, Args)]
struct DeviceOpts {
    /// Device's model number (eg. SM-N986U)
    #[arg(short, long)]
    model: String,
    /// Region/CSC code (eg. TMB)
    #[arg(short, long)]
    region: String,
    /// Firmware type (home or factory)
    ///
    /// This option allows the firmware type (also known as "binary nature") to
    /// be selected. By default, the "home" firmware is used.
    #[arg(value_enum, short = 't', long, default_value_t)]
    firmware_type: FirmwareType,
}

/// Connection and key options shared by all commands
#[derive(Debug, Args)]
struct FusOpts {
    /// Ignore TLS validation for HTTPS connections
    ///
    /// By default, all HTTPS connections (eg. to FUS) will validate the TLS
    /// certificate against the system's CA trust store.
    #[arg(long, global = true)]
    ignore_tls_validation: bool,
    /// Do not use the proxy configured in the environment
    #[arg(long, global = true)]
    no_proxy: bool,
    /// FUS fixed key
    ///
    /// If unspecified, the key is loaded from the `FUS_FIXED_KEY` environment
    /// variable, followed by the `fus_fixed_key` config file variable. The
    /// built-in key is used if none of those are set.
    #[arg(long, env = "FUS_FIXED_KEY", global = true)]
    fus_fixed_key: Option<String>,
    /// FUS flexible key suffix
    ///
    /// If unspecified, the key is loaded from the `FUS_FLEXIBLE_KEY_SUFFIX`
    /// environment variable, followed by the `fus_flexible_key_suffix` config
    /// file variable. The built-in key is used if none of those are set.
    #[arg(long, env = "FUS_FLEXIBLE_KEY_SUFFIX", global = true)]
    fus_flexible_key_suffix: Option<String>,
    /// Config file path
    ///
    /// If unspecified, the default config file path is used. The config file
    /// can store the FUS keys to avoid needing to set environment variables or
    /// pass them as command-line arguments.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DownloadOpts {
    #[command(flatten)]
    device: DeviceOpts,
    /// Version number (latest if unspecified)
    ///
    /// This is the version number of the firmware to download. The format is:
    /// "<PDA>/<CSC>[/<Phone>/<Data>]". If <Phone> or <Data> are omitted, then
    /// they're set to the same value as <PDA>. If no version is specified, then
    /// the latest available version is queried from the FOTA server.
    #[arg(short, long)]
    version: Option<FwVersion>,
    /// Output path
    ///
    /// By default, the output path is the filename returned by the server (with
    /// the encryption extension removed when decrypting). This does not present
    /// a security issue because all path components are ignored.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Decrypt the firmware while downloading
    #[arg(short, long)]
    decrypt: bool,
    /// Download from scratch even if the output file exists
    #[arg(long)]
    no_resume: bool,
    /// Skip the CRC32 check
    #[arg(long)]
    no_verify: bool,
    /// Number of bytes to write at a time
    ///
    /// Must be a multiple of 16 when decrypting.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,
    /// Do not check that the version is listed in the FOTA catalogue
    #[arg(long)]
    skip_catalogue: bool,
}

#[derive(Debug, Args)]
struct DecryptOpts {
    #[command(flatten)]
    device: DeviceOpts,
    /// Version number of the encrypted firmware
    #[arg(short, long)]
    version: FwVersion,
    /// Encrypted firmware file
    #[arg(short, long)]
    input: PathBuf,
    /// Output path (input path without the encryption extension if unspecified)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Number of bytes to decrypt at a time
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,
}

#[derive(Debug, Args)]
struct ListOpts {
    #[command(flatten)]
    device: DeviceOpts,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download (and optionally decrypt) a firmware
    Download(DownloadOpts),
    /// Decrypt a previously downloaded firmware
    Decrypt(DecryptOpts),
    /// List the firmware versions available for a device
    List(ListOpts),
}

/// A simple tool for downloading official firmware files from FUS.
#[derive(Debug, Parser)]
#[command(author, version)]
struct Opts {
    #[command(subcommand)]
    command: Command,
    #[command(flatten)]
    fus: FusOpts,
    /// Set logging verbosity
    ///
    /// By default, no log messages are printed out. If set to 'debug', log
    /// messages of the implementation details (such as the FUS requests and
    /// responses) are printed out. If set to 'trace', I/O read and write
    /// messages are also printed out, which can be extremely verbose. This
    /// option overrides the RUST_LOG environment variable, which would
    /// otherwise be respected if this option was not passed.
    #[arg(value_enum, long, global = true)]
    loglevel: Option<LogLevel>,
}

/// Create a progress reporter that is cancelled by Ctrl-C.
fn create_reporter() -> ProgressReporter<Stderr> {
    let cancelled = Arc::new(AtomicBool::new(false));

    {
        let cancelled = cancelled.clone();
        tokio::spawn(async move {
            if ctrl_c().await.is_ok() {
                debug!("Received interrupt");
                cancelled.store(true, Ordering::SeqCst);
            }
        });
    }

    let mut reporter = ProgressReporter::new(stderr(), cancelled);
    if log_enabled!(Level::Debug) {
        // Redrawing the same line would clobber log messages
        reporter.set_mode(DrawMode::Append);
    }

    reporter
}

/// Strip the directory components from a server-provided file name.
fn local_file_name(name: &str) -> Result<PathBuf> {
    Path::new(name)
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("Invalid file name from server: {name:?}"))
}

fn print_metadata(metadata: &FirmwareMetadata) {
    println!("Firmware info:");
    println!("- Model: {} ({})", metadata.model,
             metadata.model_display_name.as_deref().unwrap_or("unknown"));
    println!("- Region: {}", metadata.region);
    println!("- Version: {}", metadata.version);
    println!("- OS: {} {}", metadata.platform.as_deref().unwrap_or(""), metadata.os_version);
    println!("- Type: {}", metadata.nature);
    println!("- File: {}{}", metadata.model_path, metadata.file_name);
    println!("- Size: {} bytes", metadata.size);
    println!("- CRC32: {:08X}", u32::from_be_bytes(metadata.crc));
    println!("- Date: {}", metadata.last_modified.as_deref().unwrap_or("unknown"));
}

async fn connect(builder: &SessionBuilder) -> Result<FusSession> {
    debug!("Authenticating with FUS");

    builder.connect().await.context("Could not authenticate with FUS")
}

async fn download(builder: &SessionBuilder, opts: DownloadOpts) -> Result<()> {
    let device = &opts.device;
    let catalogue = Catalogue::new(builder.http_client()?);

    let version = match opts.version {
        Some(v) => {
            if !opts.skip_catalogue {
                debug!("Checking that {v} is listed in the catalogue");

                let listed = catalogue.firmware_exists(&device.model, &device.region,
                                                       &v.to_string(), true).await
                    .context("Failed to query firmware catalogue")?;
                if !listed {
                    bail!("Firmware {v} is not listed for {}/{}", device.model, device.region);
                }
            }
            v
        }
        None => {
            if opts.skip_catalogue {
                bail!("A version must be specified when skipping the catalogue");
            }

            debug!("Querying latest firmware version");

            let history = catalogue.history(&device.model, &device.region).await
                .context("Failed to query firmware catalogue")?;
            history.latest.version.parse::<FwVersion>()
                .context(format!("Invalid latest version: {:?}", history.latest.version))?
        }
    };

    let mut session = connect(builder).await?;

    debug!("Querying FUS for firmware information");

    let metadata = FirmwareMetadata::fetch(&mut session, &version, &device.model,
                                           &device.region, device.firmware_type.into()).await
        .context("Failed to query firmware information")?;

    debug!("Full firmware info: {metadata:#?}");
    print_metadata(&metadata);

    let output = match opts.output {
        Some(p) => p,
        None if opts.decrypt => local_file_name(metadata.decrypted_file_name())?,
        None => local_file_name(&metadata.file_name)?,
    };

    debug!("Output path: {output:?}");

    metadata.initialize_transfer(&mut session).await
        .context("Failed to initialize download")?;

    let options = TransferOptions {
        resume: !opts.no_resume,
        decrypt_inline: opts.decrypt,
        verify_checksum: !opts.no_verify,
        block_size: opts.block_size,
    };
    let pipeline = TransferPipeline::new(&metadata, &output, options);
    let mut reporter = create_reporter();

    let result = pipeline.run(&mut session, &mut reporter).await;
    reporter.finish()?;

    let report = match result {
        Ok(r) => r,
        Err(TransferError::Cancelled { offset }) => {
            bail!("Download was interrupted at offset {offset}. To resume, rerun the current command.");
        }
        Err(e) => return Err(e).context(format!("Failed to download {output:?}")),
    };

    debug!("Transfer report: {report:#?}");

    if let Some(crc) = report.checksum {
        println!("Downloaded {} with CRC32 {:08X}", BinarySize(report.total),
                 u32::from_be_bytes(crc));
    }
    if !report.warnings.is_empty() {
        eprintln!("Download completed with {} warning(s)", report.warnings.len());
    }

    Ok(())
}

async fn decrypt(builder: &SessionBuilder, opts: DecryptOpts) -> Result<()> {
    let device = &opts.device;
    let mut session = connect(builder).await?;

    let metadata = FirmwareMetadata::fetch(&mut session, &opts.version, &device.model,
                                           &device.region, device.firmware_type.into()).await
        .context("Failed to query firmware information")?;

    debug!("Full firmware info: {metadata:#?}");

    let output = match opts.output {
        Some(p) => p,
        None => {
            let name = opts.input.to_string_lossy();
            match name.strip_suffix(".enc2").or_else(|| name.strip_suffix(".enc4")) {
                Some(n) => PathBuf::from(n),
                None => bail!("Output path is required when the input has no encryption extension"),
            }
        }
    };

    debug!("Decrypting {:?} to {output:?}", opts.input);

    let key = metadata.key;
    let block_size = opts.block_size;
    let input = opts.input.clone();
    let mut reporter = create_reporter();

    let (result, mut reporter) = task::spawn_blocking(move || {
        let result = transfer::decrypt_file(&input, &output, &key, block_size, &mut reporter);
        (result, reporter)
    }).await?;
    reporter.finish()?;

    let crc = result.context(format!("Failed to decrypt {:?}", opts.input))?;
    if crc != metadata.crc {
        eprintln!(
            "Warning: Firmware's checksum ({:08X}) does not match expected checksum ({:08X})",
            u32::from_be_bytes(crc),
            u32::from_be_bytes(metadata.crc),
        );
    }

    Ok(())
}

async fn list(builder: &SessionBuilder, opts: ListOpts) -> Result<()> {
    let device = &opts.device;
    let catalogue = Catalogue::new(builder.http_client()?);

    let history = catalogue.history(&device.model, &device.region).await
        .context("Failed to query firmware catalogue")?;

    debug!("Firmware history: {history:#?}");

    let mut session = connect(builder).await?;

    for (i, v) in history.versions().enumerate() {
        let label = if i == 0 { "latest" } else { "old" };

        let version = match v.parse::<FwVersion>() {
            Ok(v) => v,
            Err(e) => {
                eprintln!("{v} ({label}): {e}");
                continue;
            }
        };

        match FirmwareMetadata::fetch(&mut session, &version, &device.model,
                                      &device.region, device.firmware_type.into()).await {
            Ok(m) => println!("{version} ({label}): {} {}, {}", m.platform.as_deref().unwrap_or(""),
                              m.os_version, BinarySize(m.size)),
            Err(e) => eprintln!("{version} ({label}): {e}"),
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Some(l) = opts.loglevel {
        env::set_var("RUST_LOG", format!("{PKG_NAME}={l},fuslib={l}"));
    }

    env_logger::init();
    let log_keys_var = format!("{}_LOG_KEYS", PKG_NAME.to_uppercase());
    let log_keys = matches!(env::var(log_keys_var), Ok(v) if v == "true");

    if log_keys {
        debug!("Arguments: {opts:#?}");
    } else {
        debug!("Command: {:#?}", opts.command);
    }

    let config = load_config_file(opts.fus.config.as_deref())?;
    if log_keys {
        debug!("Config: {config:#?}");
    }

    let keys = load_keys(&opts.fus, &config)?;
    if log_keys {
        debug!("Keys: {keys:?}");
    }

    let builder = SessionBuilder::new(keys)
        .ignore_tls_validation(opts.fus.ignore_tls_validation)
        .no_proxy(opts.fus.no_proxy);

    match opts.command {
        Command::Download(o) => download(&builder, o).await,
        Command::Decrypt(o) => decrypt(&builder, o).await,
        Command::List(o) => list(&builder, o).await,
    }
}
