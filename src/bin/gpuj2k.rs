//! gpuj2k CLI - inspect decode geometry and device command plans.
//!
//! Runs the decode core against the host backend, so no device is needed.

use std::collections::BTreeMap;

use clap::{Args, Parser, Subcommand, ValueEnum};
use gpuj2k_rs::compute::host::Command;
use gpuj2k_rs::{
    DecodeParameters, DecodePipeline, HostBackend, ImageParameters, J2kImage, PipelineOptions,
    WaveletKind,
};

/// JPEG 2000 GPU decode core inspector
#[derive(Parser)]
#[command(name = "gpuj2k")]
#[command(version)]
#[command(about = "Inspect JPEG 2000 decode geometry and device command plans", long_about = None)]
#[command(after_help = "EXAMPLES:
    gpuj2k geometry -w 256 -H 256
    gpuj2k geometry -w 1920 -H 1080 --tile-width 512 --tile-height 512 --tile 3
    gpuj2k plan -w 512 -H 512 -n 3 --mct --wavelet lossy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the tile, resolution, subband and code-block tree
    #[command(visible_alias = "g")]
    Geometry {
        #[command(flatten)]
        image: ImageArgs,

        /// Only print this tile (raster index)
        #[arg(long)]
        tile: Option<usize>,

        /// Also list every code-block
        #[arg(long)]
        codeblocks: bool,
    },

    /// Run the pipeline on the host backend and summarize the device commands
    #[command(visible_alias = "p")]
    Plan {
        #[command(flatten)]
        image: ImageArgs,

        /// Fail device allocations beyond this many bytes
        #[arg(long)]
        memory_limit: Option<usize>,

        /// Skip the colour stage
        #[arg(long)]
        no_color: bool,
    },
}

#[derive(Args)]
struct ImageArgs {
    /// Image width in pixels
    #[arg(short, long)]
    width: u32,

    /// Image height in pixels
    #[arg(short = 'H', long)]
    height: u32,

    /// Number of components
    #[arg(short = 'n', long, default_value = "1")]
    components: u16,

    /// Bits per sample
    #[arg(short, long, default_value = "8")]
    bits: u8,

    /// Samples are signed
    #[arg(long)]
    signed: bool,

    /// Wavelet filter
    #[arg(long, default_value = "lossless", value_enum)]
    wavelet: WaveletArg,

    /// Multiple component transform (needs three components)
    #[arg(long)]
    mct: bool,

    /// Nominal tile width (whole image when omitted)
    #[arg(long, requires = "tile_height")]
    tile_width: Option<u32>,

    /// Nominal tile height
    #[arg(long, requires = "tile_width")]
    tile_height: Option<u32>,

    /// Decomposition levels
    #[arg(short, long, default_value = "4")]
    levels: u8,

    /// Code-block width exponent
    #[arg(long, default_value = "6")]
    cblk_w: u8,

    /// Code-block height exponent
    #[arg(long, default_value = "6")]
    cblk_h: u8,

    /// Byte slot per code-block codestream (default 2 bytes per sample)
    #[arg(long)]
    max_codestream: Option<usize>,
}

#[derive(Clone, ValueEnum)]
enum WaveletArg {
    /// Reversible 5/3
    Lossless,
    /// Irreversible 9/7
    Lossy,
}

impl ImageArgs {
    fn build(&self) -> Result<J2kImage, Box<dyn std::error::Error>> {
        let image = ImageParameters {
            width: self.width,
            height: self.height,
            component_count: self.components,
            range_bits: self.bits,
            signed: self.signed,
            wavelet: match self.wavelet {
                WaveletArg::Lossless => WaveletKind::Reversible53,
                WaveletArg::Lossy => WaveletKind::Irreversible97,
            },
            multi_component_transform: self.mct,
        };
        let params = DecodeParameters {
            tile_size: self.tile_width.zip(self.tile_height),
            decomposition_levels: self.levels,
            codeblock_exp_w: self.cblk_w,
            codeblock_exp_h: self.cblk_h,
            max_codestream_size: self.max_codestream,
        };
        Ok(J2kImage::new(&image, &params)?)
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Geometry {
            image,
            tile,
            codeblocks,
        } => show_geometry(&image, tile, codeblocks),
        Commands::Plan {
            image,
            memory_limit,
            no_color,
        } => show_plan(&image, memory_limit, no_color),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn show_geometry(
    args: &ImageArgs,
    only_tile: Option<usize>,
    list_codeblocks: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let image = args.build()?;
    println!("Image: {}x{}, {} component(s)", image.width, image.height, image.component_count);
    println!(
        "Tiles: {}x{} grid of {}x{}",
        image.tiles_x, image.tiles_y, image.tile_width, image.tile_height
    );
    if let Some(index) = only_tile
        && index >= image.tile_count()
    {
        return Err(format!("tile {} out of range (image has {})", index, image.tile_count()).into());
    }

    for tile in &image.tiles {
        if only_tile.is_some_and(|i| i != tile.index as usize) {
            continue;
        }
        println!();
        println!(
            "Tile {}: [{}, {}) x [{}, {}), {} code-blocks",
            tile.index,
            tile.bounds.x0,
            tile.bounds.x1,
            tile.bounds.y0,
            tile.bounds.y1,
            tile.codeblock_count()
        );
        // Every component shares the same tree.
        let Some(comp) = tile.components.first() else {
            continue;
        };
        for res in &comp.resolutions {
            println!(
                "  Resolution {} (level {}): {}x{}",
                res.level, res.decomposition_level, res.width, res.height
            );
            for sb in &res.subbands {
                println!(
                    "    {:?}: {}x{} at ({}, {}), {}x{} code-blocks, Mb {}",
                    sb.orientation,
                    sb.width,
                    sb.height,
                    sb.bounds.x0,
                    sb.bounds.y0,
                    sb.codeblocks_x,
                    sb.codeblocks_y,
                    sb.magnitude_bits
                );
                if list_codeblocks {
                    for cb in &sb.codeblocks {
                        println!(
                            "      #{} ({}, {}): {}x{} at ({}, {})",
                            cb.index, cb.x, cb.y, cb.width, cb.height, cb.bounds.x0, cb.bounds.y0
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

fn show_plan(
    args: &ImageArgs,
    memory_limit: Option<usize>,
    no_color: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut image = args.build()?;
    let backend = match memory_limit {
        Some(bytes) => HostBackend::new().with_memory_limit(bytes),
        None => HostBackend::new(),
    };
    let options = PipelineOptions {
        color_transform: !no_color,
        ..Default::default()
    };
    let mut pipeline = DecodePipeline::new(backend, options)?;
    let decoded = pipeline.decode(&mut image);

    let backend = pipeline.backend();
    let mut dispatches: BTreeMap<&str, usize> = BTreeMap::new();
    let (mut allocs, mut uploads, mut releases, mut copies) = (0, 0, 0, 0);
    for command in backend.commands() {
        match command {
            Command::Alloc { .. } => allocs += 1,
            Command::Upload { .. } => uploads += 1,
            Command::Release { .. } => releases += 1,
            Command::CopyRect { .. } => copies += 1,
            Command::Dispatch { entry_point, .. } => {
                *dispatches.entry(entry_point.as_str()).or_default() += 1
            }
            _ => {}
        }
    }

    println!("Commands: {}", backend.commands().len());
    println!("  Allocations: {}", allocs);
    println!("  Uploads:     {}", uploads);
    println!("  Rect copies: {}", copies);
    println!("  Releases:    {}", releases);
    println!("Dispatches:");
    for (entry_point, count) in &dispatches {
        println!("  {:<32} {}", entry_point, count);
    }
    println!("Peak device memory: {} bytes", backend.peak_allocated_bytes());
    println!("Live buffers:       {}", backend.live_buffers());

    decoded?;
    Ok(())
}
