use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "comic-forge",
    version,
    about = "Generate comic panels from markdown scripts and letter them"
)]
struct Cli {
    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings", global = true)]
    read_settings: Option<String>,

    /// Enable verbose logging
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate panel images for a script (or every script with --batch)
    Generate(GenerateArgs),
    /// Add speech bubbles and captions to generated panels
    Overlay(OverlayArgs),
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Script file to generate
    script: Option<String>,

    /// Process every script matching --pattern in --scripts-dir
    #[arg(long = "batch")]
    batch: bool,

    /// Directory holding script files (default: settings [generation].scripts_dir)
    #[arg(long = "scripts-dir")]
    scripts_dir: Option<String>,

    /// File name glob for batch mode (default: settings [generation].pattern)
    #[arg(long = "pattern")]
    pattern: Option<String>,

    /// Output directory for panel images
    #[arg(short = 'o', long = "output")]
    output: Option<String>,

    /// Output image format (png or jpg)
    #[arg(long = "format")]
    format: Option<String>,

    /// Regenerate panels that already exist
    #[arg(long = "regenerate")]
    regenerate: bool,

    /// Image provider (openai or midapi)
    #[arg(short = 'p', long = "provider", default_value = "openai")]
    provider: String,

    /// Model name (e.g. dall-e-3, midjourney-v7)
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// OpenAI image size (e.g. 1024x1024)
    #[arg(long = "size")]
    size: Option<String>,

    /// OpenAI image quality (standard or hd)
    #[arg(long = "quality")]
    quality: Option<String>,

    /// MidAPI generation mode (relaxed, fast, turbo)
    #[arg(long = "mode")]
    mode: Option<String>,

    /// Character reference image URL for MidAPI
    #[arg(long = "ref-url")]
    ref_url: Option<String>,

    /// API key (overrides environment variables)
    #[arg(short = 'k', long = "key")]
    key: Option<String>,
}

#[derive(Args, Debug)]
struct OverlayArgs {
    /// Script file whose panels should be lettered
    script: String,

    /// Output directory for lettered panels
    #[arg(short = 'o', long = "output")]
    output: Option<String>,

    /// Directory holding generated panel images
    #[arg(long = "images-dir")]
    images_dir: Option<String>,

    /// Bubble font size in pixels
    #[arg(long = "font-size")]
    font_size: Option<f32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    comic_forge::logging::init(cli.verbose)?;

    let output = match cli.command {
        Command::Generate(args) => {
            comic_forge::run_generate(comic_forge::GenerateConfig {
                script: args.script,
                batch: args.batch,
                scripts_dir: args.scripts_dir,
                pattern: args.pattern,
                output: args.output,
                format: args.format,
                regenerate: args.regenerate,
                provider: args.provider,
                model: args.model,
                size: args.size,
                quality: args.quality,
                mode: args.mode,
                reference_url: args.ref_url,
                key: args.key,
                settings_path: cli.read_settings,
            })
            .await?
        }
        Command::Overlay(args) => comic_forge::run_overlay(comic_forge::OverlayConfig {
            script: args.script,
            output: args.output,
            images_dir: args.images_dir,
            font_size: args.font_size,
            settings_path: cli.read_settings,
        })?,
    };

    println!("{}", output);
    Ok(())
}
