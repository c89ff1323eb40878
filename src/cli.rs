use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::fallback::FallbackPolicy;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scrape a listing or detail URL into a spreadsheet.
    Harvest(HarvestArgs),
    /// Assemble one record from a saved HTML document and print it as JSON.
    Extract(ExtractArgs),
    /// Validate every path and transform in the site configs.
    Check(CheckArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LlmEngine {
    /// Never fill unresolved fields.
    Noop,
    /// OpenAI Responses API (requires `OPENAI_API_KEY`).
    Openai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RendererKind {
    /// Plain HTTP GET.
    Http,
    /// Headless Chromium (`--dump-dom`), falling back to HTTP.
    Browser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Decide from the start page's probe field.
    Auto,
    /// The start URL is a single listing.
    Detail,
    /// The start URL is a results page.
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    /// Excel workbook with `ERROR` cells filled red.
    Xlsx,
    /// Plain CSV, `ERROR` cells written verbatim.
    Csv,
}

#[derive(Debug, Clone, Args)]
pub struct FallbackArgs {
    /// Engine used for fields the rules could not fill.
    #[arg(long, value_enum, default_value_t = LlmEngine::Openai)]
    pub engine: LlmEngine,

    /// When to call the engine: `off`, `any` or `at-least:N` unresolved fields.
    #[arg(long, default_value_t = FallbackPolicy::Any)]
    pub fallback: FallbackPolicy,

    /// Upper bound for one fallback call.
    #[arg(long, default_value_t = 120)]
    pub llm_timeout_secs: u64,

    /// OpenAI API base URL (for `--engine openai`).
    #[arg(long, default_value = crate::openai::DEFAULT_BASE_URL)]
    pub openai_base_url: String,

    /// OpenAI model name (for `--engine openai`).
    #[arg(long, default_value = "gpt-4o-mini")]
    pub openai_model: String,
}

#[derive(Debug, Clone, Args)]
pub struct AssetArgs {
    /// Directory for downloaded listing photos.
    #[arg(long, default_value = "images")]
    pub assets: String,

    /// Remove files left in `--assets` by earlier runs before starting.
    #[arg(long)]
    pub clean_assets: bool,

    /// Maximum concurrent photo downloads per listing.
    #[arg(long, default_value_t = crate::media::DEFAULT_ASSET_CONCURRENCY)]
    pub asset_concurrency: usize,
}

#[derive(Debug, Args)]
pub struct HarvestArgs {
    /// Start URL (must be http/https).
    #[arg(long)]
    pub url: String,

    /// Site config file or directory (JSON/YAML).
    #[arg(long)]
    pub configs: String,

    /// Output path (default: `output_files/<timestamp>_properties.<format>`).
    #[arg(long)]
    pub out: Option<String>,

    #[arg(long, value_enum, default_value_t = ExportFormat::Xlsx)]
    pub format: ExportFormat,

    /// Overwrite `--out` if it exists.
    #[arg(long)]
    pub force: bool,

    #[arg(long, value_enum, default_value_t = Mode::Auto)]
    pub mode: Mode,

    #[arg(long, value_enum, default_value_t = RendererKind::Http)]
    pub renderer: RendererKind,

    /// Chromium executable for `--renderer browser`.
    #[arg(long, default_value = "chromium")]
    pub browser_bin: String,

    /// Upper bound for rendering one page.
    #[arg(long, default_value_t = 60)]
    pub render_timeout_secs: u64,

    /// Maximum listing pages to follow.
    #[arg(long, default_value_t = 50)]
    pub max_pages: usize,

    #[command(flatten)]
    pub assets: AssetArgs,

    #[command(flatten)]
    pub fallback: FallbackArgs,
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// Saved HTML document.
    #[arg(long)]
    pub html: String,

    /// URL the document was fetched from (selects the site config).
    #[arg(long)]
    pub url: String,

    /// Site config file or directory (JSON/YAML).
    #[arg(long)]
    pub configs: String,

    #[command(flatten)]
    pub assets: AssetArgs,

    #[command(flatten)]
    pub fallback: FallbackArgs,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Site config file or directory (JSON/YAML).
    #[arg(long)]
    pub configs: String,
}
