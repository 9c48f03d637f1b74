use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use image::DynamicImage;
use imreg_cli::imreg_core::{
    init_thread_pool, DetectorKind, GrayImage, SearchConfig, SimilarityMetric, TransformParams,
};
use imreg_cli::features::{compare_detectors, extract, extractor_from_config, match_features, MatchStatistics};
use imreg_cli::geometry::{
    apply_transformation_by_name, blend, fuse_images, similarity, similarity_by_name, transform_error, warp_affine,
    AffineMatrix,
};
use imreg_cli::measurement::{pixel_distance, DEFAULT_UNIT};
use imreg_cli::pipeline::fit_homography;
use imreg_cli::render::{draw_keypoints, draw_matches, registration_panel};
use imreg_cli::{
    add_gaussian_noise, create_synthetic, estimate_uncertainty, exhaustive_search, open_gray, validate_report,
    Calibrator, FeatureRegistration, RegistrationConfig, RegistrationOutcome, SyntheticPattern,
};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "imreg")]
#[command(about = "Feature-based and exhaustive image registration, fusion and measurement")]
#[command(version)]
struct Cli {
    /// Worker threads (defaults to the config value, then the CPU count).
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Registration config file (.toml or .json). Explicit flags override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a synthetic test image.
    Synth(SynthArgs),
    /// Apply a translation, rotation, rigid or affine transform to an image.
    Transform(TransformArgs),
    /// Detect keypoints and describe them.
    Detect(DetectArgs),
    /// Run several detectors on the same image.
    Compare(CompareArgs),
    /// Match descriptors between two images.
    Match(MatchArgs),
    /// Register a moving image onto a fixed one with features and RANSAC.
    Register(RegisterArgs),
    /// Exhaustive translation search driven by a similarity metric.
    Search(SearchArgs),
    /// Similarity between two equally sized images.
    Similarity(SimilarityArgs),
    /// Register every image onto the first and composite them on one canvas.
    Fuse(FuseArgs),
    /// Weighted blend of two images.
    Blend(BlendArgs),
    /// Calibrate with a reference segment and measure a distance.
    Measure(MeasureArgs),
    /// Statistics of repeated measurements.
    Uncertainty {
        /// Measured values.
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        values: Vec<f64>,
    },
    /// Check the HTML report for required sections, images and the pipeline diagram.
    ValidateReport {
        /// Path to the report.
        report: PathBuf,
    },
}

#[derive(Debug, Clone, Args)]
struct DetectorArgs {
    /// Detector: orb, sift or akaze.
    #[arg(long)]
    method: Option<String>,

    /// Maximum number of features per image.
    #[arg(long)]
    max_features: Option<usize>,
}

#[derive(Debug, Clone, Args)]
struct SynthArgs {
    /// patron, cuadros, circulo or texto (English names also accepted).
    #[arg(long, default_value = "patron")]
    pattern: String,

    #[arg(long, default_value_t = 256)]
    size: u32,

    /// Standard deviation of additive Gaussian noise.
    #[arg(long)]
    noise: Option<f64>,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct TransformArgs {
    input: PathBuf,

    /// traslacion, rotacion, rigida or afin.
    #[arg(long)]
    kind: String,

    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    tx: f64,

    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    ty: f64,

    /// Counter-clockwise angle in degrees.
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    angle: f64,

    /// Isotropic scale (affine only).
    #[arg(long, default_value_t = 1.0)]
    scale: f64,

    /// Added to the first row's second coefficient (affine only).
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    shear: f64,

    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct DetectArgs {
    input: PathBuf,

    #[command(flatten)]
    detector: DetectorArgs,

    /// Write the image with keypoints drawn.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Draw keypoint size and orientation.
    #[arg(long)]
    rich: bool,
}

#[derive(Debug, Clone, Args)]
struct CompareArgs {
    input: PathBuf,

    #[arg(long, value_delimiter = ',', default_value = "orb,sift,akaze")]
    methods: Vec<String>,

    #[arg(long)]
    max_features: Option<usize>,
}

#[derive(Debug, Clone, Args)]
struct MatchArgs {
    first: PathBuf,
    second: PathBuf,

    #[command(flatten)]
    detector: DetectorArgs,

    /// Lowe ratio in (0, 1].
    #[arg(long)]
    ratio: Option<f32>,

    /// Filter matches with a RANSAC homography.
    #[arg(long)]
    ransac: bool,

    /// Write the side-by-side match rendering.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct RegisterArgs {
    fixed: PathBuf,
    moving: PathBuf,

    #[command(flatten)]
    detector: DetectorArgs,

    #[arg(long)]
    ratio: Option<f32>,

    /// RANSAC reprojection threshold in pixels.
    #[arg(long)]
    reproj_thresh: Option<f64>,

    /// RANSAC seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Write the registered image.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Write a comparison panel (inputs, overlays, difference).
    #[arg(long)]
    panel: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct SearchArgs {
    fixed: PathBuf,
    moving: PathBuf,

    /// Inclusive x range as `lo,hi`.
    #[arg(long, default_value = "-20,20", value_parser = parse_pair, allow_hyphen_values = true)]
    range_x: (i32, i32),

    /// Inclusive y range as `lo,hi`.
    #[arg(long, default_value = "-20,20", value_parser = parse_pair, allow_hyphen_values = true)]
    range_y: (i32, i32),

    #[arg(long, default_value_t = 1)]
    step: u32,

    /// mse, ncc or mi.
    #[arg(long, default_value = "mse")]
    metric: String,

    /// Known translation `tx,ty` to report the recovery error against.
    #[arg(long, value_parser = parse_pair, allow_hyphen_values = true)]
    truth: Option<(i32, i32)>,

    /// Include every candidate score in the output.
    #[arg(long)]
    history: bool,

    /// Write the moving image shifted by the best translation.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct SimilarityArgs {
    first: PathBuf,
    second: PathBuf,

    /// mse, ncc or mi; all three when omitted.
    #[arg(long)]
    metric: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct FuseArgs {
    /// Reference image first, then the images to composite onto it.
    #[arg(required = true, num_args = 1..)]
    images: Vec<PathBuf>,

    #[command(flatten)]
    detector: DetectorArgs,

    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct BlendArgs {
    first: PathBuf,
    second: PathBuf,

    /// Weight of the first image.
    #[arg(long, default_value_t = 0.5)]
    alpha: f64,

    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct MeasureArgs {
    image: PathBuf,

    /// First reference point `x,y`.
    #[arg(long, value_parser = parse_pair, allow_hyphen_values = true)]
    ref_from: (i32, i32),

    /// Second reference point `x,y`.
    #[arg(long, value_parser = parse_pair, allow_hyphen_values = true)]
    ref_to: (i32, i32),

    /// Real length of the reference segment.
    #[arg(long)]
    ref_distance: f64,

    /// First point to measure `x,y`.
    #[arg(long, value_parser = parse_pair, allow_hyphen_values = true)]
    from: (i32, i32),

    /// Second point to measure `x,y`.
    #[arg(long, value_parser = parse_pair, allow_hyphen_values = true)]
    to: (i32, i32),

    #[arg(long, default_value = DEFAULT_UNIT)]
    unit: String,

    #[arg(long, default_value = "")]
    label: String,

    /// Write the annotated image.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// `a,b` integer pair
fn parse_pair(s: &str) -> Result<(i32, i32), String> {
    let (a, b) = s
        .split_once(',')
        .ok_or_else(|| format!("expected `a,b`, got `{}`", s))?;
    let a = a.trim().parse().map_err(|e| format!("{}: {}", a, e))?;
    let b = b.trim().parse().map_err(|e| format!("{}: {}", b, e))?;
    Ok((a, b))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_gray(path: &Path) -> Result<GrayImage> {
    open_gray(path).with_context(|| format!("failed to open image {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<RegistrationConfig> {
    match path {
        Some(path) => {
            tracing::info!("Loading config: {}", path.display());
            RegistrationConfig::load(path).with_context(|| format!("failed to load config {}", path.display()))
        }
        None => Ok(RegistrationConfig::default()),
    }
}

fn apply_detector_args(mut cfg: RegistrationConfig, args: &DetectorArgs) -> Result<RegistrationConfig> {
    if let Some(method) = &args.method {
        cfg.detection.method = method.parse()?;
    }
    if let Some(n) = args.max_features {
        cfg.detection.max_features = n;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_thread_pool(cli.threads.unwrap_or(config.n_threads)).context("failed to build thread pool")?;

    match cli.command {
        Commands::Synth(args) => run_synth(&args),
        Commands::Transform(args) => run_transform(&args),
        Commands::Detect(args) => run_detect(config, &args),
        Commands::Compare(args) => run_compare(config, &args),
        Commands::Match(args) => run_match(config, &args),
        Commands::Register(args) => run_register(config, &args),
        Commands::Search(args) => run_search(&args),
        Commands::Similarity(args) => run_similarity(&args),
        Commands::Fuse(args) => run_fuse(config, &args),
        Commands::Blend(args) => run_blend(&args),
        Commands::Measure(args) => run_measure(&args),
        Commands::Uncertainty { values } => print_json(&estimate_uncertainty(&values)?),
        Commands::ValidateReport { report } => run_validate_report(&report),
    }
}

// ── synth / transform ─────────────────────────────────────────────────

fn run_synth(args: &SynthArgs) -> Result<()> {
    let pattern: SyntheticPattern = args.pattern.parse()?;
    let mut img = create_synthetic(args.size, pattern)?;
    if let Some(sigma) = args.noise {
        img = add_gaussian_noise(&img, sigma, args.seed)?;
    }
    img.save(&args.out)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    tracing::info!("Synthetic {} image written to {}", pattern, args.out.display());
    print_json(&json!({
        "pattern": pattern.to_string(),
        "size": args.size,
        "noise": args.noise,
        "out": args.out,
    }))
}

fn run_transform(args: &TransformArgs) -> Result<()> {
    let img = load_gray(&args.input)?;
    let params = TransformParams {
        tx: args.tx,
        ty: args.ty,
        angle: args.angle,
        scale: args.scale,
        shear: args.shear,
    };
    let (warped, matrix) = apply_transformation_by_name(&img, &args.kind, &params)?;
    warped
        .save(&args.out)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    print_json(&json!({
        "kind": args.kind,
        "matrix": matrix.0,
        "out": args.out,
    }))
}

// ── detect / compare / match ──────────────────────────────────────────

fn run_detect(config: RegistrationConfig, args: &DetectArgs) -> Result<()> {
    let cfg = apply_detector_args(config, &args.detector)?;
    let img = load_gray(&args.input)?;
    let extractor = extractor_from_config(&cfg.detection);
    let features = extract(extractor.as_ref(), &img)?;
    tracing::info!("Detected {} keypoints with {}", features.len(), cfg.detection.method);

    if let Some(out) = &args.out {
        draw_keypoints(&img, &features.keypoints, args.rich)
            .save(out)
            .with_context(|| format!("failed to write {}", out.display()))?;
    }
    print_json(&json!({
        "method": cfg.detection.method,
        "num_keypoints": features.len(),
        "descriptor_len": features.descriptors.as_ref().map_or(0, |d| d.row_len()),
        "keypoints": features.keypoints,
    }))
}

fn run_compare(config: RegistrationConfig, args: &CompareArgs) -> Result<()> {
    let kinds = args
        .methods
        .iter()
        .map(|m| m.parse::<DetectorKind>())
        .collect::<Result<Vec<_>, _>>()?;
    let img = load_gray(&args.input)?;
    let max_features = args.max_features.unwrap_or(config.detection.max_features);

    let rows: Vec<_> = compare_detectors(&img, &kinds, max_features)
        .into_iter()
        .map(|c| match c.result {
            Ok(summary) => json!({
                "method": c.kind,
                "num_keypoints": summary.num_keypoints,
                "descriptor_len": summary.descriptor_len,
                "mean_response": summary.mean_response,
            }),
            Err(e) => json!({
                "method": c.kind,
                "error": e.to_string(),
            }),
        })
        .collect();
    print_json(&rows)
}

fn run_match(config: RegistrationConfig, args: &MatchArgs) -> Result<()> {
    let mut cfg = apply_detector_args(config, &args.detector)?;
    if let Some(ratio) = args.ratio {
        cfg = cfg.with_ratio_test(ratio);
        cfg.validate()?;
    }
    let a = load_gray(&args.first)?;
    let b = load_gray(&args.second)?;
    let extractor = extractor_from_config(&cfg.detection);
    let fa = extract(extractor.as_ref(), &a)?;
    let fb = extract(extractor.as_ref(), &b)?;

    let matches = match_features(
        fa.descriptors.as_ref(),
        fb.descriptors.as_ref(),
        cfg.detection.method,
        cfg.matching.ratio_test,
    )?;
    tracing::info!("Found {} matches", matches.len());

    let fit = if args.ransac {
        fit_homography(&fa.keypoints, &fb.keypoints, &matches, &cfg.ransac)?
    } else {
        None
    };
    let mask = fit.as_ref().map(|f| f.inlier_mask.as_slice());
    let stats = MatchStatistics::compute(&matches, mask);

    if let Some(out) = &args.out {
        draw_matches(&a, &fa.keypoints, &b, &fb.keypoints, &matches, mask)?
            .save(out)
            .with_context(|| format!("failed to write {}", out.display()))?;
    }
    print_json(&json!({
        "method": cfg.detection.method,
        "keypoints": [fa.len(), fb.len()],
        "num_matches": stats.num_matches,
        "num_inliers": stats.num_inliers,
        "inlier_percentage": stats.inlier_percentage,
        "mean_distance": stats.mean_distance,
        "std_distance": stats.std_distance,
        "homography": fit.as_ref().map(|f| f.transform.rows()),
    }))
}

// ── register / search / similarity ────────────────────────────────────

fn run_register(config: RegistrationConfig, args: &RegisterArgs) -> Result<()> {
    let mut cfg = apply_detector_args(config, &args.detector)?;
    if let Some(ratio) = args.ratio {
        cfg = cfg.with_ratio_test(ratio);
    }
    if let Some(t) = args.reproj_thresh {
        cfg = cfg.with_reproj_thresh(t);
    }
    if let Some(seed) = args.seed {
        cfg = cfg.with_seed(seed);
    }
    tracing::info!("{}", cfg.summary());

    let fixed = load_gray(&args.fixed)?;
    let moving = load_gray(&args.moving)?;
    let registration = FeatureRegistration::new(cfg)?;

    match registration.register(&fixed, &moving)? {
        RegistrationOutcome::Failed(reason) => {
            tracing::warn!("Registration stopped: {}", reason);
            print_json(&json!({ "status": "failed", "reason": reason }))
        }
        RegistrationOutcome::Registered(reg) => {
            if let Some(out) = &args.out {
                reg.registered
                    .save(out)
                    .with_context(|| format!("failed to write {}", out.display()))?;
            }
            if let Some(panel) = &args.panel {
                registration_panel(&fixed, &moving, &reg.registered)?
                    .save(panel)
                    .with_context(|| format!("failed to write {}", panel.display()))?;
            }
            let stats = reg.diagnostics.statistics();
            let before = similarity(&fixed, &moving, SimilarityMetric::Mse).ok();
            let after = similarity(&fixed, &reg.registered, SimilarityMetric::Mse)?;
            print_json(&json!({
                "status": "registered",
                "homography": reg.transform.rows(),
                "keypoints": [reg.diagnostics.fixed_keypoints.len(), reg.diagnostics.moving_keypoints.len()],
                "num_matches": stats.num_matches,
                "num_inliers": stats.num_inliers,
                "inlier_percentage": stats.inlier_percentage,
                "mse_before": before,
                "mse_after": after,
            }))
        }
    }
}

fn run_search(args: &SearchArgs) -> Result<()> {
    let fixed = load_gray(&args.fixed)?;
    let moving = load_gray(&args.moving)?;
    let cfg = SearchConfig {
        range_x: args.range_x,
        range_y: args.range_y,
        step: args.step,
        metric: args.metric.parse()?,
    };
    tracing::info!("Evaluating {} candidate translations", cfg.candidate_count());
    let result = exhaustive_search(&fixed, &moving, &cfg)?;

    if let Some(out) = &args.out {
        warp_affine(&moving, &result.transform)?
            .save(out)
            .with_context(|| format!("failed to write {}", out.display()))?;
    }
    let history = args.history.then_some(&result.history);
    let error = args
        .truth
        .map(|(tx, ty)| transform_error(&AffineMatrix::translation(tx as f64, ty as f64), &result.transform));
    print_json(&json!({
        "tx": result.tx,
        "ty": result.ty,
        "score": result.score,
        "metric": result.metric,
        "candidates": result.history.len(),
        "error": error.map(|e| json!({ "tx_error": e.tx_error, "ty_error": e.ty_error, "rmse": e.rmse })),
        "history": history,
    }))
}

fn run_similarity(args: &SimilarityArgs) -> Result<()> {
    let a = load_gray(&args.first)?;
    let b = load_gray(&args.second)?;
    match &args.metric {
        Some(metric) => {
            let score = similarity_by_name(&a, &b, metric)?;
            print_json(&json!({ metric.as_str(): score }))
        }
        None => {
            let mut scores = serde_json::Map::new();
            for metric in [SimilarityMetric::Mse, SimilarityMetric::Ncc, SimilarityMetric::Mi] {
                scores.insert(metric.to_string(), json!(similarity(&a, &b, metric)?));
            }
            print_json(&scores)
        }
    }
}

// ── fuse / blend ──────────────────────────────────────────────────────

fn run_fuse(config: RegistrationConfig, args: &FuseArgs) -> Result<()> {
    let cfg = apply_detector_args(config, &args.detector)?;
    let images = args
        .images
        .iter()
        .map(|p| load_gray(p))
        .collect::<Result<Vec<_>>>()?;
    let registration = FeatureRegistration::new(cfg)?;

    let mut transforms = Vec::with_capacity(images.len().saturating_sub(1));
    for (path, img) in args.images.iter().zip(&images).skip(1) {
        match registration.register(&images[0], img)? {
            RegistrationOutcome::Registered(reg) => transforms.push(Some(reg.transform)),
            RegistrationOutcome::Failed(reason) => {
                tracing::warn!("Skipping {}: {}", path.display(), reason);
                transforms.push(None);
            }
        }
    }

    let canvas = fuse_images(&images, &transforms)?;
    canvas
        .save(&args.out)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    print_json(&json!({
        "images": images.len(),
        "registered": transforms.iter().filter(|t| t.is_some()).count(),
        "canvas": canvas.dimensions(),
        "out": args.out,
    }))
}

fn run_blend(args: &BlendArgs) -> Result<()> {
    let a = image::open(&args.first).with_context(|| format!("failed to open image {}", args.first.display()))?;
    let b = image::open(&args.second).with_context(|| format!("failed to open image {}", args.second.display()))?;
    let blended = match (&a, &b) {
        (DynamicImage::ImageLuma8(a), DynamicImage::ImageLuma8(b)) => DynamicImage::ImageLuma8(blend(a, b, args.alpha)?),
        _ => DynamicImage::ImageRgb8(blend(&a.to_rgb8(), &b.to_rgb8(), args.alpha)?),
    };
    blended
        .save(&args.out)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    print_json(&json!({ "alpha": args.alpha, "out": args.out }))
}

// ── measure / report ──────────────────────────────────────────────────

fn run_measure(args: &MeasureArgs) -> Result<()> {
    let img = image::open(&args.image).with_context(|| format!("failed to open image {}", args.image.display()))?;
    let mut calibrator = Calibrator::new(img).with_unit(&args.unit);
    let scale = calibrator.calibrate(args.ref_from, args.ref_to, args.ref_distance)?;
    let distance = calibrator.measure(args.from, args.to)?;

    if let Some(out) = &args.out {
        calibrator
            .visualize(args.from, args.to, &args.label)?
            .save(out)
            .with_context(|| format!("failed to write {}", out.display()))?;
    }
    print_json(&json!({
        "scale": scale,
        "unit": calibrator.unit(),
        "pixel_distance": pixel_distance(args.from, args.to),
        "distance": distance,
        "references": calibrator.references(),
    }))
}

fn run_validate_report(path: &Path) -> Result<()> {
    let validation = validate_report(path).with_context(|| format!("failed to read report {}", path.display()))?;
    print_json(&validation)?;
    if !validation.is_ok() {
        for issue in &validation.issues {
            tracing::error!("{}", issue);
        }
        bail!("report {} has {} issue(s)", path.display(), validation.issues.len());
    }
    Ok(())
}
