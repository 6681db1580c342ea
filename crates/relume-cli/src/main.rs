use {
    anyhow::{Context, Result},
    clap::{Parser, Subcommand},
    relume_core::{
        imageset::{FolderImageSet, FolderOptions},
        integration::{integrate_pyramid, save_ply, IntegrationParams},
        BasisType, BuildSettings, Colorspace, Encoder, ProgressFn,
    },
    std::path::{Path, PathBuf},
    tap::prelude::*,
    tracing::info,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// build configuration file (yaml rendition of the default printed by
    /// print-default-config); command-line flags override individual fields
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// fits a relightable model to a folder of photographs (with their .lp
    /// light file) and encodes it as JPEG coefficient planes + info.json
    Build {
        /// folder holding the aligned images and the .lp file
        input: PathBuf,
        /// output directory (created if missing)
        output: PathBuf,
        #[command(flatten)]
        overrides: BuildOverrides,
    },
    /// integrates a normal map into a height field, exported as a binary PLY
    Normals {
        /// normal map png (xyz in rgb)
        input: PathBuf,
        /// output .ply mesh
        output: PathBuf,
        /// sigmoid sharpness of the bilateral reweighting; 0 for a plain
        /// least-squares solve
        #[arg(long, default_value_t = 2.0)]
        k: f64,
        #[arg(long, default_value_t = 1e-4)]
        tolerance: f64,
        #[arg(long, default_value_t = 1e-5)]
        solver_tolerance: f64,
        #[arg(long, default_value_t = 150)]
        max_iterations: u32,
        #[arg(long, default_value_t = 2000)]
        max_solver_iterations: u32,
        /// stop the coarse-to-fine solve at this pyramid level (0 = full
        /// resolution)
        #[arg(long, default_value_t = 0)]
        scale: u32,
    },
    /// prints the default build configuration; save it and edit to taste
    PrintDefaultConfig,
}

#[derive(clap::Args, Default)]
struct BuildOverrides {
    /// ptm, hsh, sh, h, rbf or bilinear
    #[arg(long, short = 'b')]
    basis: Option<BasisType>,
    /// rgb, lrgb, ycc, mrgb or mycc
    #[arg(long, short = 'C')]
    colorspace: Option<Colorspace>,
    /// plane count for the data-driven bases
    #[arg(long, short = 'p')]
    nplanes: Option<u32>,
    /// per-channel plane counts for mycc
    #[arg(long, num_args = 3, value_names = ["Y", "CB", "CR"])]
    yccplanes: Option<Vec<u32>>,
    /// octahedral grid side for bilinear
    #[arg(long, short = 'r')]
    resolution: Option<u32>,
    /// rbf interpolation radius
    #[arg(long, short = 's')]
    sigma: Option<f32>,
    /// jpeg quality of the coefficient planes
    #[arg(long, short = 'q')]
    quality: Option<u8>,
    /// sampling budget for the fitting pass, in megabytes
    #[arg(long)]
    samplingram: Option<u32>,
    /// 0 = shared dynamic range, 1 = per-plane packing
    #[arg(long)]
    rangecompress: Option<f32>,
    #[arg(long)]
    chroma_subsampling: bool,
    /// fit in sqrt-compressed intensity space
    #[arg(long)]
    gamma_fix: bool,
    /// the acquisition lights are near-field: fit per-region bases
    #[arg(long)]
    light3d: bool,
    #[arg(long)]
    save_normals: bool,
    #[arg(long)]
    save_means: bool,
    #[arg(long)]
    save_medians: bool,
    /// crop rectangle: x y width height
    #[arg(long, num_args = 4, value_names = ["X", "Y", "W", "H"])]
    crop: Option<Vec<u32>>,
    /// image indices to leave out (repeatable)
    #[arg(long)]
    skip: Vec<usize>,
    /// worker threads for the encoding pass; capped to the machine's cores
    #[arg(long, short = 'w')]
    workers: Option<usize>,
}

impl BuildOverrides {
    fn apply(self, settings: &mut BuildSettings) {
        let Self {
            basis,
            colorspace,
            nplanes,
            yccplanes,
            resolution,
            sigma,
            quality,
            samplingram,
            rangecompress,
            chroma_subsampling,
            gamma_fix,
            light3d: _,
            save_normals,
            save_means,
            save_medians,
            crop,
            skip,
            workers,
        } = self;
        macro_rules! overwrite {
            ($($field:ident $(=> |$v:ident| $value:expr)?),+ $(,)?) => {$(
                if let Some(value) = $field {
                    settings.$field = value $(.pipe(|$v| $value))?;
                }
            )*};
        }
        overwrite! {
            basis,
            colorspace,
            nplanes,
            resolution,
            sigma,
            quality,
            samplingram,
            rangecompress,
            workers,
            yccplanes => |value| [value[0], value[1], value[2]],
            crop => |value| Some([value[0], value[1], value[2], value[3]]),
        }
        if chroma_subsampling {
            settings.chroma_subsampling = true;
        }
        if gamma_fix {
            settings.gamma_fix = true;
        }
        if save_normals {
            settings.save_normals = true;
        }
        if save_means {
            settings.save_means = true;
        }
        if save_medians {
            settings.save_medians = true;
        }
        if !skip.is_empty() {
            settings.skip_images = skip;
        }
    }
}

fn load_settings(path: Option<&Path>) -> Result<BuildSettings> {
    match path {
        None => Ok(BuildSettings::default()),
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading config at [{}]", path.display()))
            .and_then(|config| serde_yaml::from_str(&config).context("parsing config file"))
            .with_context(|| format!("loading [{}]", path.display())),
    }
}

fn progress_bar() -> (indicatif::ProgressBar, impl Fn(&str, u32) -> bool) {
    let bar = indicatif::ProgressBar::new(100).tap_mut(|bar| {
        bar.set_style(
            indicatif::ProgressStyle::with_template("{msg:24} {wide_bar} {percent:>3}%")
                .expect("static template"),
        )
    });
    let callback = {
        let bar = bar.clone();
        move |stage: &str, percent: u32| {
            bar.set_message(stage.to_owned());
            bar.set_position(percent as u64);
            true
        }
    };
    (bar, callback)
}

fn build(input: &Path, output: &Path, overrides: BuildOverrides, config: Option<&Path>) -> Result<()> {
    let light3d = overrides.light3d;
    let mut settings = load_settings(config)?;
    overrides.apply(&mut settings);
    settings.workers = settings.workers.min(num_cpus::get().max(1));

    let imageset = FolderImageSet::open(
        input,
        FolderOptions {
            crop: settings.crop,
            skip: settings.skip_images.clone(),
            light3d,
        },
    )
    .with_context(|| format!("opening image set at [{}]", input.display()))?;

    let (bar, callback) = progress_bar();
    let progress: &ProgressFn = &callback;

    let mut encoder = Encoder::new(imageset, settings).context("configuring the build")?;
    encoder.fit(Some(progress)).context("fitting the basis")?;
    let total = encoder
        .save(output, Some(progress))
        .with_context(|| format!("encoding into [{}]", output.display()))?;
    bar.finish_and_clear();

    info!("encoded [{total}] bytes into [{}]", output.display());
    Ok(())
}

fn integrate(input: &Path, output: &Path, params: IntegrationParams) -> Result<()> {
    let map = image::open(input)
        .with_context(|| format!("reading normal map at [{}]", input.display()))?
        .into_rgb8();
    let (width, height) = map.dimensions();

    // rgb bytes → components in [-1, 1], z negated into the solver convention
    let normals: Vec<f32> = map
        .pixels()
        .flat_map(|p| {
            let n = |c: u8| c as f32 / 255.0 * 2.0 - 1.0;
            [n(p[0]), n(p[1]), -n(p[2]).abs()]
        })
        .collect();

    let (bar, callback) = progress_bar();
    let progress: &ProgressFn = &callback;
    let (w, h, heights) =
        integrate_pyramid(width as usize, height as usize, normals, &params, Some(progress))
            .context("integrating normals")?;
    bar.finish_and_clear();

    save_ply(output, w, h, &heights).with_context(|| format!("writing [{}]", output.display()))?;
    info!("integrated [{w}x{h}] heights into [{}]", output.display());
    Ok(())
}

fn setup_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    setup_logging();
    let Cli { config, command } = Cli::parse();

    match command {
        Commands::Build {
            input,
            output,
            overrides,
        } => build(&input, &output, overrides, config.as_deref()),
        Commands::Normals {
            input,
            output,
            k,
            tolerance,
            solver_tolerance,
            max_iterations,
            max_solver_iterations,
            scale,
        } => integrate(
            &input,
            &output,
            IntegrationParams {
                k,
                tolerance,
                solver_tolerance,
                max_iterations,
                max_solver_iterations,
                scale,
            },
        ),
        Commands::PrintDefaultConfig => BuildSettings::default()
            .pipe_ref(serde_yaml::to_string)
            .context("serialization failed")
            .map(|config| println!("{config}")),
    }
    .with_context(|| {
        format!(
            "error occurred, run with --help or file a ticket at {}",
            env!("CARGO_PKG_REPOSITORY")
        )
    })
}
