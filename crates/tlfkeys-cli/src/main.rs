//! tlfkeys: folder metadata inspection CLI
//!
//! Commands:
//!   init                       - create an initial metadata revision
//!   dump <md> [--wkb --rkb]    - pretty-print a revision (and its bundles)
//!   md-id <md>                 - print a revision's content ID
//!   bundle-id --writer|--reader <file>
//!   verify <md> --writer-key   - structural and signature checks
//!   check-successor <prev> <next> [--rekey-only]
//!   config show                - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::debug;

use tlfkeys_core::config::TlfKeysConfig;
use tlfkeys_core::{Codec, JsonCodec, TlfId, TlfType, UserId};
use tlfkeys_crypto::{StdCrypto, VerifyingKey};
use tlfkeys_md::dump::{dump_extra_metadata, dump_root_metadata};
use tlfkeys_md::{
    make_initial_root_metadata, make_reader_key_bundle_id, make_writer_key_bundle_id,
    ExtraMetadata, MetadataFormat, ReaderKeyBundle, RootMetadata, StaticTeamMembership,
    WriterKeyBundle,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "tlfkeys",
    version,
    about = "Folder key bundle and metadata tool",
    long_about = "tlfkeys: create, inspect and validate encrypted-folder metadata revisions"
)]
struct Cli {
    /// Path to tlfkeys.toml configuration file
    #[arg(long, short = 'c', env = "TLFKEYS_CONFIG", default_value = "tlfkeys.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(long, env = "TLFKEYS_LOG")]
    log: Option<String>,

    /// Log format; overrides the config
    #[arg(long, env = "TLFKEYS_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FolderType {
    Private,
    Public,
    Team,
}

impl From<FolderType> for TlfType {
    fn from(t: FolderType) -> Self {
        match t {
            FolderType::Private => TlfType::Private,
            FolderType::Public => TlfType::Public,
            FolderType::Team => TlfType::Team,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an initial metadata revision and print it as JSON
    Init {
        #[arg(long, value_enum, default_value = "private")]
        tlf_type: FolderType,
        /// Creating user
        #[arg(long)]
        creator: String,
        /// Explicit writers (public folders) or the team (team folders)
        #[arg(long = "writer")]
        writers: Vec<String>,
        /// Metadata version (default: metadata.default_version from config)
        #[arg(long)]
        version: Option<u8>,
        /// Folder ID as base64 (default: random)
        #[arg(long)]
        tlf_id: Option<String>,
    },

    /// Pretty-print a revision, and its bundles when given
    Dump {
        md: PathBuf,
        #[arg(long, requires = "rkb")]
        wkb: Option<PathBuf>,
        #[arg(long, requires = "wkb")]
        rkb: Option<PathBuf>,
    },

    /// Print the content ID of a revision
    #[command(name = "md-id")]
    MdId { md: PathBuf },

    /// Print the ID of an encoded key bundle
    #[command(name = "bundle-id")]
    BundleId {
        #[arg(long, conflicts_with = "reader", required_unless_present = "reader")]
        writer: Option<PathBuf>,
        #[arg(long)]
        reader: Option<PathBuf>,
    },

    /// Check structure, bundle IDs, writer signature and roles
    ///
    /// Team folders are checked against an empty roster and always fail the
    /// role checks.
    Verify {
        md: PathBuf,
        /// Expected writer verifying key, base64
        #[arg(long)]
        writer_key: String,
        #[arg(long, requires = "rkb")]
        wkb: Option<PathBuf>,
        #[arg(long, requires = "wkb")]
        rkb: Option<PathBuf>,
    },

    /// Check that <next> may follow <prev>
    #[command(name = "check-successor")]
    CheckSuccessor {
        prev: PathBuf,
        next: PathBuf,
        /// Also require that only key bundle fields changed
        #[arg(long)]
        rekey_only: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = TlfKeysConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.logging.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);
    debug!(config = %cli.config.display(), "tlfkeys starting");

    let codec = JsonCodec;
    match cli.command {
        Commands::Init {
            tlf_type,
            creator,
            writers,
            version,
            tlf_id,
        } => cmd_init(&codec, &config, tlf_type, creator, writers, version, tlf_id.as_deref()),
        Commands::Dump { md, wkb, rkb } => cmd_dump(&codec, &md, wkb.as_deref().zip(rkb.as_deref())),
        Commands::MdId { md } => {
            let md = read_md(&codec, &md)?;
            println!("{}", md.md_id(&codec)?);
            Ok(())
        }
        Commands::BundleId { writer, reader } => cmd_bundle_id(&codec, writer.as_deref(), reader.as_deref()),
        Commands::Verify {
            md,
            writer_key,
            wkb,
            rkb,
        } => cmd_verify(&codec, &md, &writer_key, wkb.as_deref().zip(rkb.as_deref())),
        Commands::CheckSuccessor {
            prev,
            next,
            rekey_only,
        } => cmd_check_successor(&codec, &prev, &next, rekey_only),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let layer = fmt::layer().with_writer(std::io::stderr);

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
}

// ── Input helpers ─────────────────────────────────────────────────────────────

fn read_md<C: Codec>(codec: &C, path: &Path) -> Result<RootMetadata> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    RootMetadata::decode(codec, &bytes).with_context(|| format!("decoding {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned, C: Codec>(codec: &C, path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    codec
        .decode(&bytes)
        .with_context(|| format!("decoding {}", path.display()))
}

fn read_extra<C: Codec>(codec: &C, paths: Option<(&Path, &Path)>) -> Result<Option<ExtraMetadata>> {
    let Some((wkb, rkb)) = paths else {
        return Ok(None);
    };
    let wkb: WriterKeyBundle = read_json(codec, wkb)?;
    let rkb: ReaderKeyBundle = read_json(codec, rkb)?;
    Ok(Some(ExtraMetadata::new(wkb, rkb, false, false)))
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn cmd_init<C: Codec>(
    codec: &C,
    config: &TlfKeysConfig,
    tlf_type: FolderType,
    creator: String,
    writers: Vec<String>,
    version: Option<u8>,
    tlf_id: Option<&str>,
) -> Result<()> {
    let version = match version {
        Some(v) => v,
        None => config.metadata.default_version()?.get(),
    };
    let tlf_id = match tlf_id {
        Some(s) => TlfId::from_base64(s).map_err(|e| anyhow::anyhow!("--tlf-id: {e}"))?,
        None => TlfId::random(),
    };
    let md = make_initial_root_metadata(
        version,
        tlf_id,
        tlf_type.into(),
        UserId::new(creator),
        writers.into_iter().map(UserId::new).collect(),
    )?;
    let bytes = md.encode(codec)?;
    println!("{}", String::from_utf8_lossy(&bytes));
    Ok(())
}

fn cmd_dump<C: Codec>(codec: &C, path: &Path, bundles: Option<(&Path, &Path)>) -> Result<()> {
    let md = read_md(codec, path)?;
    print!("{}", dump_root_metadata(codec, &md)?);
    if let Some(extra) = read_extra(codec, bundles)? {
        println!();
        print!("{}", dump_extra_metadata(codec, &extra)?);
    }
    Ok(())
}

fn cmd_bundle_id<C: Codec>(codec: &C, writer: Option<&Path>, reader: Option<&Path>) -> Result<()> {
    match (writer, reader) {
        (Some(path), _) => {
            let wkb: WriterKeyBundle = read_json(codec, path)?;
            println!("{}", make_writer_key_bundle_id(codec, &wkb)?);
        }
        (None, Some(path)) => {
            let rkb: ReaderKeyBundle = read_json(codec, path)?;
            println!("{}", make_reader_key_bundle_id(codec, &rkb)?);
        }
        (None, None) => anyhow::bail!("one of --writer or --reader is required"),
    }
    Ok(())
}

fn cmd_verify<C: Codec>(
    codec: &C,
    path: &Path,
    writer_key: &str,
    bundles: Option<(&Path, &Path)>,
) -> Result<()> {
    let md = read_md(codec, path)?;
    let extra = read_extra(codec, bundles)?;
    let writer_key =
        VerifyingKey::from_base64(writer_key).map_err(|e| anyhow::anyhow!("--writer-key: {e}"))?;

    md.is_valid_and_signed(
        codec,
        &StdCrypto,
        &StaticTeamMembership::new(),
        extra.as_ref(),
        &writer_key,
    )
    .with_context(|| format!("{} failed verification", path.display()))?;
    println!(
        "ok: revision {} of {} (version {}, key generation {})",
        md.revision(),
        md.tlf_id(),
        md.version(),
        md.latest_key_generation()
    );
    Ok(())
}

fn cmd_check_successor<C: Codec>(codec: &C, prev: &Path, next: &Path, rekey_only: bool) -> Result<()> {
    let prev_md = read_md(codec, prev)?;
    let next_md = read_md(codec, next)?;
    let prev_id = prev_md.md_id(codec)?;

    if rekey_only {
        prev_md.check_valid_rekey_successor(codec, &prev_id, &next_md)?;
    } else {
        prev_md.check_valid_successor(&prev_id, &next_md)?;
    }
    println!(
        "ok: {} follows {} ({prev_id})",
        next.display(),
        prev.display()
    );
    Ok(())
}

fn cmd_config_show(config: &TlfKeysConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
