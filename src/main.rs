use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use console::{style, Emoji};
use env_logger::Env;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

use winfonts::config::{DEFAULT_CONTAINER_SUFFIX, DEFAULT_EXTENSION};
use winfonts::download::{
    default_product_edition_id, download_file, Architecture, WindowsEdition, WindowsVersion,
};
use winfonts::{
    open_disc, AutoDecoder, DownloadConfig, DownloadRequest, ExtractConfig, ExtractionPipeline,
    Notifier, RunOutcome, WindowsDownloader,
};

static SPARK: Emoji<'_, '_> = Emoji("✨ ", ":-)");
static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Also switches to text-based progress"
    )]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract files from the containers inside a disc image
    Extract {
        #[arg(help = "ISO image, or a directory holding the disc's files")]
        image: PathBuf,

        #[arg(help = "Directory the extracted files are written to")]
        output: PathBuf,

        #[arg(long, default_value = DEFAULT_CONTAINER_SUFFIX, help = "Name suffix of container files on the disc")]
        container_suffix: String,

        #[arg(long = "ext", default_value = DEFAULT_EXTENSION, help = "Extension of the files to extract (repeatable)")]
        extensions: Vec<String>,

        #[arg(long, help = "Print the run summary as JSON")]
        json: bool,
    },
    /// Download Windows installation media from Microsoft
    Download {
        #[command(flatten)]
        media: MediaArgs,

        #[arg(short, long, help = "Output file (default: windows_{version}_{edition}_{arch}.iso)")]
        output: Option<PathBuf>,
    },
    /// Download Windows installation media and extract its fonts
    Fetch {
        #[command(flatten)]
        media: MediaArgs,

        #[arg(short, long, help = "Output directory for extracted files")]
        output: PathBuf,

        #[arg(short, long, help = "Keep the downloaded image in the output directory")]
        keep_iso: bool,

        #[arg(long, help = "Print the run summary as JSON")]
        json: bool,
    },
}

#[derive(Args)]
struct MediaArgs {
    #[arg(short = 'w', long = "version", value_enum, default_value = "windows11", help = "Windows version")]
    version: WindowsVersion,

    #[arg(short, long, value_enum, default_value = "pro", help = "Windows edition")]
    edition: WindowsEdition,

    #[arg(short, long, value_enum, default_value = "x64", help = "Architecture")]
    arch: Architecture,

    #[arg(short, long, default_value = "en-US", help = "Language")]
    language: String,

    #[arg(short, long, help = "Product edition ID (default depends on the version)")]
    product_id: Option<String>,
}

impl MediaArgs {
    fn request(&self) -> DownloadRequest {
        DownloadRequest {
            version: self.version,
            edition: self.edition,
            arch: self.arch,
            language: self.language.clone(),
        }
    }

    fn product_id(&self) -> &str {
        self.product_id
            .as_deref()
            .unwrap_or_else(|| default_product_edition_id(self.version))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let notifier = Notifier::new(cli.verbose);

    env_logger::Builder::from_env(Env::default())
        .filter_level(notifier.verbosity_level().to_log_level())
        .init();

    debug!("Beautiful progress: {}", notifier.use_beautiful_progress());

    match cli.command {
        Command::Extract {
            image,
            output,
            container_suffix,
            extensions,
            json,
        } => {
            let config = ExtractConfig::new(output)
                .with_container_suffix(container_suffix)
                .with_extensions(extensions);
            extract(&image, config, json, &notifier)
        }
        Command::Download { media, output } => {
            let request = media.request();
            let output = output.unwrap_or_else(|| PathBuf::from(request.iso_file_name()));
            download(&media, &output, &notifier)
        }
        Command::Fetch {
            media,
            output,
            keep_iso,
            json,
        } => fetch(&media, &output, keep_iso, json, &notifier),
    }
}

fn extract(image: &Path, config: ExtractConfig, json: bool, notifier: &Notifier) -> Result<()> {
    info!(
        "Extracting {:?} from {} to {}",
        config.extensions,
        image.display(),
        config.destination.display()
    );

    fs::create_dir_all(&config.destination).with_context(|| {
        format!(
            "Failed to create output directory: {}",
            config.destination.display()
        )
    })?;

    let disc = open_disc(image)?;
    let decoder = AutoDecoder::new();
    if !decoder.supports_wim() {
        notifier.warn("wimlib-imagex was not found; WIM containers cannot be read");
    }

    let pipeline = ExtractionPipeline::new(config.clone(), &decoder, notifier);
    let outcome = pipeline.run(disc.as_ref())?;
    notifier.finish();

    report(&outcome, &config, json, notifier)
}

fn report(outcome: &RunOutcome, config: &ExtractConfig, json: bool, notifier: &Notifier) -> Result<()> {
    let summary = outcome.summary();
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    for failure in summary
        .structural_failures
        .iter()
        .chain(summary.file_failures.iter())
    {
        notifier.println_above(format!(
            "{}{} ({}): {}",
            WARN,
            style(&failure.subject).yellow(),
            failure.stage,
            failure.cause
        ));
    }

    let verb = if outcome.is_cancelled() {
        "Cancelled after extracting"
    } else {
        "Extracted"
    };
    notifier.println_above(format!(
        "{}{} {} file(s) ({} bytes) from {} container(s) into {}",
        SPARK,
        style(verb).bold(),
        summary.files_extracted,
        summary.bytes_written,
        summary.containers_found,
        config.destination.display()
    ));
    if summary.files_failed > 0 || summary.containers_failed > 0 {
        notifier.println_above(format!(
            "{}{} file(s) and {} container(s) failed",
            WARN, summary.files_failed, summary.containers_failed
        ));
    }
    Ok(())
}

fn resolve_and_download(media: &MediaArgs, output: &Path, notifier: &Notifier) -> Result<()> {
    let request = media.request();
    info!(
        "Requesting {} {} {} ({})",
        request.version, request.edition, request.arch, request.language
    );

    let downloader = WindowsDownloader::new(request, DownloadConfig::default())?;
    notifier.info("Obtaining download URL from Microsoft...");
    let url = downloader
        .resolve_download_url(media.product_id())
        .context("Failed to get download URL")?;
    debug!("Download URL: {}", url);

    notifier.info(&format!("Downloading to {}", output.display()));
    let bytes = download_file(&url, output, notifier).context("Failed to download ISO")?;
    info!("Downloaded {} bytes to {}", bytes, output.display());
    Ok(())
}

fn download(media: &MediaArgs, output: &Path, notifier: &Notifier) -> Result<()> {
    resolve_and_download(media, output, notifier)?;
    notifier.finish();
    notifier.println_above(format!(
        "{}{} {}",
        SPARK,
        style("Download completed:").bold(),
        output.display()
    ));
    Ok(())
}

fn fetch(media: &MediaArgs, output: &Path, keep_iso: bool, json: bool, notifier: &Notifier) -> Result<()> {
    fs::create_dir_all(output)
        .with_context(|| format!("Failed to create output directory: {}", output.display()))?;

    let file_name = media.request().iso_file_name();
    // Dropping the directory removes the downloaded image with it.
    let temp_dir = if keep_iso {
        None
    } else {
        Some(
            tempfile::Builder::new()
                .prefix("winfonts_")
                .tempdir()
                .context("Failed to create temporary directory")?,
        )
    };
    let iso_path = match &temp_dir {
        Some(dir) => dir.path().join(&file_name),
        None => output.join(&file_name),
    };

    resolve_and_download(media, &iso_path, notifier)?;
    extract(&iso_path, ExtractConfig::new(output), json, notifier)
}
