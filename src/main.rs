use clap::{Args, Parser, Subcommand};
use pixshift::clock::SystemClock;
use pixshift::imaging::{Adjustments, Fit, ResizeSpec, RotateFlip, Rotation, RustCodec, TransformOps};
use pixshift::service::{self, ImageService};
use pixshift::session::SessionStore;
use pixshift::uploads::{ImageBuffer, UploadStaging};
use pixshift::{config, output, server};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pixshift")]
#[command(about = "Image conversion, compression and edit sessions over HTTP")]
#[command(long_about = "\
Image conversion, compression and edit sessions over HTTP

Run 'pixshift serve' for the HTTP API, or use the one-shot commands on local
files:

  pixshift convert photo.png --format webp --quality 80
  pixshift convert *.png --format jpg --out-dir converted/
  pixshift compress photo.jpg --target-kb 200
  pixshift formats

Logging goes to stderr and follows RUST_LOG (default: pixshift=info).

Run 'pixshift gen-config' to generate a documented pixshift.toml.")]
#[command(version)]
struct Cli {
    /// Config file (missing file = stock defaults)
    #[arg(long, default_value = config::DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Convert one or more images to another format
    Convert(ConvertArgs),
    /// Compress an image, optionally to a target size
    Compress(CompressArgs),
    /// List supported output formats
    Formats,
    /// Print a stock pixshift.toml with all options documented
    GenConfig,
}

#[derive(Args)]
struct ServeArgs {
    /// Override server.host
    #[arg(long)]
    host: Option<String>,
    /// Override server.port
    #[arg(long)]
    port: Option<u16>,
}

/// Geometry and tone flags shared by conversions.
#[derive(Args, Clone)]
struct OpsArgs {
    /// Target width in pixels
    #[arg(long)]
    width: Option<u32>,
    /// Target height in pixels
    #[arg(long)]
    height: Option<u32>,
    /// How the image fits the width/height box
    #[arg(long, default_value = "inside")]
    fit: Fit,
    /// Allow output larger than the source
    #[arg(long)]
    enlarge: bool,
    /// Clockwise rotation in degrees (multiple of 90)
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    rotate: i32,
    /// Mirror left to right
    #[arg(long)]
    flip_h: bool,
    /// Mirror top to bottom
    #[arg(long)]
    flip_v: bool,
    /// Convert to grayscale
    #[arg(long)]
    grayscale: bool,
    /// Keep orientation metadata
    #[arg(long)]
    keep_metadata: bool,
}

impl OpsArgs {
    fn to_ops(&self) -> Result<TransformOps, String> {
        let resize = (self.width.is_some() || self.height.is_some()).then_some(ResizeSpec {
            width: self.width,
            height: self.height,
            fit: self.fit,
            allow_enlarge: self.enlarge,
        });
        let rotate_flip = RotateFlip {
            rotate: Rotation::try_from(self.rotate)?,
            flip_horizontal: self.flip_h,
            flip_vertical: self.flip_v,
        };
        let adjust = Adjustments {
            grayscale: self.grayscale,
            ..Adjustments::default()
        };
        Ok(TransformOps {
            resize,
            sharpen: resize.is_some(),
            rotate_flip: (!rotate_flip.is_identity()).then_some(rotate_flip),
            adjust: (!adjust.is_neutral()).then_some(adjust),
            preserve_metadata: self.keep_metadata,
            ..TransformOps::default()
        })
    }
}

#[derive(Args)]
struct ConvertArgs {
    /// Input images
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Output format (jpg, png, webp, avif, gif, tiff, bmp, ico, svg)
    #[arg(short, long, default_value = "png")]
    format: String,
    /// Quality 1-100 (default from config)
    #[arg(short, long)]
    quality: Option<u32>,
    /// Output directory (default: next to each input)
    #[arg(short, long)]
    out_dir: Option<PathBuf>,
    #[command(flatten)]
    ops: OpsArgs,
}

#[derive(Args)]
struct CompressArgs {
    input: PathBuf,
    /// Target size in KiB; searched for best effort
    #[arg(long, conflicts_with = "quality")]
    target_kb: Option<u64>,
    /// Fixed quality 1-100 (default from config)
    #[arg(short, long)]
    quality: Option<u32>,
    /// Output file (default: <stem>-compressed.<ext> next to the input)
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Serve(args) => {
            let mut config = config::load_config(&cli.config)?;
            if let Some(host) = args.host {
                config.server.host = host;
            }
            if let Some(port) = args.port {
                config.server.port = port;
            }
            config.validate()?;
            init_thread_pool(&config.processing);
            server::run(&config).await?;
        }
        Command::Convert(args) => {
            let config = config::load_config(&cli.config)?;
            init_thread_pool(&config.processing);
            let ops = args.ops.to_ops()?;
            let (service, _staging) = local_service(&config)?;

            if let [input] = args.inputs.as_slice() {
                let image = read_input(input)?;
                let source = image.filename.clone();
                let report = service.transform(image, &args.format, args.quality, ops).await?;
                let dir = output_dir(input, args.out_dir.as_deref())?;
                let dest = convert_destination(input, &dir, &report.filename);
                std::fs::write(&dest, &report.output.bytes)?;
                output::print_transform_report(&source, &report, &dest);
            } else {
                if ops != TransformOps::default() {
                    return Err("geometry flags apply to single conversions only".into());
                }
                let images = args
                    .inputs
                    .iter()
                    .map(|p| read_input(p.as_path()))
                    .collect::<Result<Vec<_>, _>>()?;
                let report = service
                    .transform_batch(images, &args.format, args.quality)
                    .await?;
                for entry in &report.entries {
                    if let Ok(item) = &entry.result {
                        let input = &args.inputs[entry.index];
                        let dir = output_dir(input, args.out_dir.as_deref())?;
                        std::fs::write(convert_destination(input, &dir, &item.filename), &item.bytes)?;
                    }
                }
                output::print_batch_report(&report);
            }
        }
        Command::Compress(args) => {
            let config = config::load_config(&cli.config)?;
            let (service, _staging) = local_service(&config)?;
            let image = read_input(&args.input)?;
            let source = image.filename.clone();
            let dir = output_dir(&args.input, None)?;

            match args.target_kb {
                Some(kb) => {
                    let report = service
                        .transform_to_budget(image, kb.saturating_mul(1024))
                        .await?;
                    let dest = args.out.unwrap_or_else(|| dir.join(suffixed_name(&report.filename, "compressed")));
                    std::fs::write(&dest, &report.outcome.bytes)?;
                    output::print_budget_report(&source, &report, &dest);
                }
                None => {
                    let report = service.compress(image, args.quality).await?;
                    let dest = args.out.unwrap_or_else(|| dir.join(suffixed_name(&report.filename, "compressed")));
                    std::fs::write(&dest, &report.output.bytes)?;
                    output::print_transform_report(&source, &report, &dest);
                }
            }
        }
        Command::Formats => {
            output::print_formats(&service::formats());
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "pixshift=debug" } else { "pixshift=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Initialize the rayon thread pool based on processing config.
///
/// Caps at the number of available CPU cores; config can constrain down, not up.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}

/// Service for one-shot commands. Sessions are unused but the service owns
/// a store either way.
fn local_service(
    config: &config::PixshiftConfig,
) -> std::io::Result<(ImageService<RustCodec>, Arc<UploadStaging>)> {
    let staging = Arc::new(UploadStaging::new(config.uploads.staging_dir())?);
    let sessions = Arc::new(SessionStore::new(
        config.service().session_ttl,
        config.sessions.max_sessions,
        Arc::new(SystemClock),
    ));
    let service = ImageService::new(RustCodec::new(), sessions, staging.clone(), config.service());
    Ok((service, staging))
}

fn read_input(path: &Path) -> std::io::Result<ImageBuffer> {
    let bytes = std::fs::read(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(ImageBuffer::new(bytes, filename))
}

fn output_dir(input: &Path, out_dir: Option<&Path>) -> std::io::Result<PathBuf> {
    match out_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Ok(dir.to_path_buf())
        }
        None => Ok(input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))),
    }
}

/// Where a converted file goes. Same format into the same directory would
/// land on the input, so that case gets a `-converted` suffix.
fn convert_destination(input: &Path, dir: &Path, filename: &str) -> PathBuf {
    let dest = dir.join(filename);
    if is_same_file(input, &dest) {
        dir.join(suffixed_name(filename, "converted"))
    } else {
        dest
    }
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// `photo.jpg` + `compressed` → `photo-compressed.jpg`.
fn suffixed_name(filename: &str, suffix: &str) -> String {
    let path = Path::new(filename);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}-{suffix}.{ext}"),
        None => format!("{stem}-{suffix}"),
    }
}
