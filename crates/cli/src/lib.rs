use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use image::{DynamicImage, ImageFormat, RgbaImage};
use leafpress_core::{
    Crop, Document, FileAccess, Metadata, OpenOptions, OutlineItem, PageSize, RenderOptions,
    ViewMode,
};
use leafpress_scheduler::{ConcurrentRender, PoolConfig};
use pdf_engine::Backend;
use serde::Serialize;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "leafpress")]
#[command(about = "Render and inspect PDF documents")]
pub struct Cli {
    /// PDF engine to use (lopdf or pdfium). Defaults to $LEAFPRESS_BACKEND.
    #[arg(long, global = true)]
    backend: Option<Backend>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Args)]
struct InputArgs {
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// How the document file is read: native, buffer or bytes.
    #[arg(long, default_value = "native")]
    file_access: FileAccess,

    /// Password to unlock an encrypted document.
    #[arg(long)]
    password: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render pages to serially numbered image files.
    Render {
        #[command(flatten)]
        input: InputArgs,

        /// Output directory.
        #[arg(short, long)]
        output: PathBuf,

        /// Page numbers and ranges, e.g. "1-3,5" or "4-2". Defaults to all pages.
        #[arg(long)]
        pages: Option<String>,

        /// File name prefix. Defaults to the input file stem followed by "_".
        #[arg(long)]
        prefix: Option<String>,

        /// Image format (png or jpg).
        #[arg(short, long, default_value = "jpg")]
        format: String,

        /// Pixels per PDF point.
        #[arg(long, default_value_t = 1.0)]
        scale: f32,

        /// Clockwise rotation: 0, 90, 180 or 270.
        #[arg(long, default_value_t = 0)]
        rotation: u16,

        /// Points to crop from the left, bottom, right and top edges.
        #[arg(long, num_args = 4, value_names = ["LEFT", "BOTTOM", "RIGHT", "TOP"])]
        crop: Option<Vec<f32>>,

        /// Background RGBA color, four integers from 0 to 255.
        #[arg(long, num_args = 4, value_names = ["R", "G", "B", "A"])]
        fill_color: Option<Vec<u8>>,

        #[arg(long)]
        grayscale: bool,

        #[arg(long)]
        no_annotations: bool,

        #[arg(long)]
        no_forms: bool,

        /// Render RGB-ordered pixels instead of BGR.
        #[arg(long)]
        rev_byteorder: bool,

        /// Use a four-channel layout even without transparency.
        #[arg(long)]
        prefer_bgrx: bool,

        /// Render in this process instead of a worker pool.
        #[arg(long)]
        linear: bool,

        /// Number of worker processes. Defaults to $LEAFPRESS_PROCESSES or the CPU count.
        #[arg(long)]
        processes: Option<usize>,

        /// Per-page deadline in seconds; 0 disables it.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    /// Print the table of contents.
    Toc {
        #[command(flatten)]
        input: InputArgs,

        /// Maximum nesting depth to walk.
        #[arg(long, default_value_t = leafpress_core::DEFAULT_MAX_DEPTH)]
        max_depth: usize,

        /// Digits to round view positions to.
        #[arg(long, default_value_t = 4)]
        n_digits: u32,
    },
    /// Print machine-readable document information.
    Info {
        #[command(flatten)]
        input: InputArgs,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct InfoOutput {
    path: String,
    page_count: u32,
    version: Option<String>,
    first_page_size_pt: Option<PageSizeOutput>,
    metadata: Metadata,
}

#[derive(Debug, Serialize)]
struct PageSizeOutput {
    width: f32,
    height: f32,
}

impl From<PageSize> for PageSizeOutput {
    fn from(size: PageSize) -> Self {
        Self { width: size.width_pt, height: size.height_pt }
    }
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    if let Some(backend) = cli.backend {
        pdf_engine::initialize(backend).context("failed to initialize the PDF engine")?;
    }

    match cli.command {
        Commands::Render {
            input,
            output,
            pages,
            prefix,
            format,
            scale,
            rotation,
            crop,
            fill_color,
            grayscale,
            no_annotations,
            no_forms,
            rev_byteorder,
            prefer_bgrx,
            linear,
            processes,
            timeout,
        } => {
            let mut options = RenderOptions::new()
                .with_scale(scale)
                .with_rotation(rotation)
                .with_grayscale(grayscale)
                .with_annotations(!no_annotations)
                .with_forms(!no_forms)
                .with_rev_byteorder(rev_byteorder)
                .with_prefer_bgrx(prefer_bgrx);
            if let Some([left, bottom, right, top]) = crop.as_deref() {
                options = options.with_crop(Crop::new(*left, *bottom, *right, *top));
            }
            if let Some([r, g, b, a]) = fill_color.as_deref() {
                options = options.with_fill_color([*r, *g, *b, *a]);
            }

            let mut pool = PoolConfig::default()
                .with_task_timeout((timeout > 0).then(|| Duration::from_secs(timeout)));
            if let Some(processes) = processes {
                pool.processes = processes.max(1);
            }

            let job = RenderJob {
                output,
                pages,
                prefix,
                format,
                options,
                pool: (!linear).then_some(pool),
            };
            run_render(&input, &job)
        }
        Commands::Toc { input, max_depth, n_digits } => run_toc(&input, max_depth, n_digits),
        Commands::Info { input } => run_info(&input),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn open(input: &InputArgs) -> Result<Document> {
    let mut options = OpenOptions::new().with_file_access(input.file_access).with_autoclose(true);
    options.password = input.password.clone();

    Document::open_with(input.file.as_path(), &options).map_err(|err| match err {
        leafpress_core::Error::NotFound(_) => anyhow::Error::new(err),
        other => anyhow::Error::new(other).context("failed to open PDF"),
    })
}

struct RenderJob {
    output: PathBuf,
    pages: Option<String>,
    prefix: Option<String>,
    format: String,
    options: RenderOptions,
    /// `None` renders in this process.
    pool: Option<PoolConfig>,
}

fn run_render(input: &InputArgs, job: &RenderJob) -> Result<()> {
    let format = image_format(&job.format)?;
    let doc = open(input)?;
    let page_count = doc.page_count()?;

    let indices = match job.pages.as_deref() {
        Some(text) => parse_pages(text)?,
        None => (0..page_count).collect(),
    };
    if let Some(index) = indices.iter().find(|&&index| index >= page_count) {
        bail!("page {} is out of range for a document with {page_count} pages", index + 1);
    }
    let mut seen = HashSet::new();
    if let Some(index) = indices.iter().find(|&&index| !seen.insert(index)) {
        bail!("page {} is listed more than once", index + 1);
    }
    if indices.is_empty() {
        return Ok(());
    }

    fs::create_dir_all(&job.output)
        .with_context(|| format!("failed to create {}", job.output.display()))?;
    let prefix = match &job.prefix {
        Some(prefix) => prefix.clone(),
        None => {
            let stem = input.file.file_stem().and_then(|stem| stem.to_str()).unwrap_or("page");
            format!("{stem}_")
        }
    };
    let n_digits = indices.iter().max().map_or(1, |max| (max + 1).to_string().len());
    let saver = ImageSaver {
        dir: &job.output,
        prefix: &prefix,
        n_digits,
        extension: &job.format,
        format,
        grayscale: job.options.grayscale,
    };

    match &job.pool {
        None => {
            log::info!("rendering {} pages in-process", indices.len());
            for &index in &indices {
                let image = doc.get_page(index)?.render_image(&job.options)?;
                saver.save(index, image)?;
            }
        }
        Some(pool) => {
            log::info!("rendering {} pages with up to {} processes", indices.len(), pool.processes);
            for rendered in doc.render_to_images(Some(&indices), &job.options, pool)? {
                let (index, image) = rendered?;
                saver.save(index, image)?;
            }
        }
    }

    doc.close()?;
    Ok(())
}

fn image_format(name: &str) -> Result<ImageFormat> {
    match ImageFormat::from_extension(name) {
        Some(format @ (ImageFormat::Png | ImageFormat::Jpeg)) => Ok(format),
        _ => bail!("unsupported image format '{name}' (expected png or jpg)"),
    }
}

struct ImageSaver<'a> {
    dir: &'a Path,
    prefix: &'a str,
    n_digits: usize,
    extension: &'a str,
    format: ImageFormat,
    grayscale: bool,
}

impl ImageSaver<'_> {
    fn path(&self, index: u32) -> PathBuf {
        let name = format!(
            "{}{:0width$}.{}",
            self.prefix,
            index + 1,
            self.extension,
            width = self.n_digits
        );
        self.dir.join(name)
    }

    fn save(&self, index: u32, image: RgbaImage) -> Result<()> {
        let path = self.path(index);
        let image = DynamicImage::ImageRgba8(image);
        let image = match (self.grayscale, self.format) {
            (true, _) => DynamicImage::ImageLuma8(image.to_luma8()),
            (false, ImageFormat::Jpeg) => DynamicImage::ImageRgb8(image.to_rgb8()),
            (false, _) => image,
        };
        image
            .save_with_format(&path, self.format)
            .with_context(|| format!("failed to write image to {}", path.display()))?;
        println!("{}", path.display());
        Ok(())
    }
}

/// Parse 1-based page numbers and ranges (`"1-3,5"`, `"4-2"`) into
/// 0-based indices. Descending ranges are walked backwards.
pub fn parse_pages(text: &str) -> Result<Vec<u32>> {
    let mut indices = Vec::new();
    for part in text.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (page_number(start)?, page_number(end)?);
                if start <= end {
                    indices.extend(start..=end);
                } else {
                    indices.extend((end..=start).rev());
                }
            }
            None => indices.push(page_number(part)?),
        }
    }
    Ok(indices)
}

fn page_number(text: &str) -> Result<u32> {
    let number: u32 =
        text.trim().parse().with_context(|| format!("invalid page number '{}'", text.trim()))?;
    if number == 0 {
        bail!("page numbers start at 1");
    }
    Ok(number - 1)
}

fn run_toc(input: &InputArgs, max_depth: usize, n_digits: u32) -> Result<()> {
    let doc = open(input)?;
    for item in doc.get_toc(max_depth) {
        println!("{}", format_toc_item(&item?, n_digits));
    }
    Ok(())
}

fn format_toc_item(item: &OutlineItem, n_digits: u32) -> String {
    let state = match item.is_closed {
        None => "*".to_owned(),
        Some(true) => format!("-{}", item.n_kids),
        Some(false) => format!("+{}", item.n_kids),
    };
    let mut line = format!("{}[{state}] {} -> ", "    ".repeat(item.level), item.title);

    let has_dest = item.page_index.is_some()
        || item.view_mode != ViewMode::Unknown
        || !item.view_pos.is_empty();
    if !has_dest {
        line.push('_');
        return line;
    }
    let page = item.page_index.map_or_else(|| "?".to_owned(), |index| (index + 1).to_string());
    let factor = 10f32.powi(n_digits as i32);
    let pos: Vec<String> =
        item.view_pos.iter().map(|value| ((value * factor).round() / factor).to_string()).collect();
    line.push_str(&format!("{page}  # {} [{}]", item.view_mode.as_str(), pos.join(", ")));
    line
}

fn run_info(input: &InputArgs) -> Result<()> {
    let doc = open(input)?;
    let page_count = doc.page_count()?;
    let first_page_size_pt: Option<PageSizeOutput> = match page_count {
        0 => None,
        _ => Some(doc.page_size(0)?.into()),
    };

    let payload = InfoOutput {
        path: input.file.display().to_string(),
        page_count,
        version: doc.version()?.map(pdf_engine::format_version),
        first_page_size_pt,
        metadata: doc.metadata()?,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);

    doc.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numbers_and_ranges() {
        assert_eq!(parse_pages("1-3,5").expect("pages"), vec![0, 1, 2, 4]);
        assert_eq!(parse_pages("4-2").expect("pages"), vec![3, 2, 1]);
        assert_eq!(parse_pages(" 2 , 2-2 ").expect("pages"), vec![1, 1]);
        assert_eq!(parse_pages("").expect("pages"), Vec::<u32>::new());
    }

    #[test]
    fn rejects_bad_page_numbers() {
        assert!(parse_pages("0").is_err());
        assert!(parse_pages("1-x").is_err());
        assert!(parse_pages("-3").is_err());
    }

    #[test]
    fn formats_toc_lines() {
        let item = OutlineItem {
            level: 1,
            title: "Methods".to_owned(),
            n_kids: 2,
            is_closed: Some(true),
            page_index: Some(4),
            view_mode: ViewMode::Xyz,
            view_pos: vec![0.0, 841.889_8, 0.0],
        };
        assert_eq!(format_toc_item(&item, 2), "    [-2] Methods -> 5  # XYZ [0, 841.89, 0]");

        let bare = OutlineItem {
            level: 0,
            title: "Notes".to_owned(),
            n_kids: 0,
            is_closed: None,
            page_index: None,
            view_mode: ViewMode::Unknown,
            view_pos: Vec::new(),
        };
        assert_eq!(format_toc_item(&bare, 4), "[*] Notes -> _");
    }

    #[test]
    fn image_names_are_zero_padded() {
        let saver = ImageSaver {
            dir: Path::new("/out"),
            prefix: "report_",
            n_digits: 3,
            extension: "png",
            format: ImageFormat::Png,
            grayscale: false,
        };
        assert_eq!(saver.path(6), PathBuf::from("/out/report_007.png"));
    }
}
