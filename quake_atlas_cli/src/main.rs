use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use quake_atlas::cluster::EARTH_RADIUS_KM;
use quake_atlas::{
    analyze, inspect_time_column_path, Analysis, AnalysisStatus, Catalog, Clustering,
    ColorMode, DatasetStore, EventRecord, FilterCriteria, NeighborSearch, NormalizeReport, Params,
    ReferenceGeometry, TimeColumnReport, YearlyCounts,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Lower magnitude bound applied when none is given.
const DEFAULT_MAG_MIN: f64 = 6.5;

#[derive(Parser, Debug)]
#[command(author, version, about = "Seismic catalog analysis CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Filter, sample, cluster and aggregate an earthquake catalog
    Analyze(AnalyzeArgs),
    /// Survey the raw timestamp column of a catalog
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// Earthquake catalog CSV
    #[arg(long, value_hint = ValueHint::FilePath)]
    catalog: PathBuf,

    /// Tectonic plate boundary GeoJSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    boundaries: Option<PathBuf>,

    /// First day of the window (YYYY-MM-DD, defaults to the earliest event)
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last day of the window, inclusive (defaults to the latest event)
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Minimum magnitude, inclusive
    #[arg(long)]
    mag_min: Option<f64>,

    /// Maximum magnitude, inclusive (defaults to the catalog maximum)
    #[arg(long)]
    mag_max: Option<f64>,

    /// Maximum number of events in the display set
    #[arg(long)]
    display_cap: Option<usize>,

    /// Clustering radius in radians on the unit sphere
    #[arg(long)]
    eps: Option<f64>,

    /// Clustering radius in kilometres (overrides --eps)
    #[arg(long, conflicts_with = "eps")]
    eps_km: Option<f64>,

    /// Minimum neighborhood size for a core event
    #[arg(long)]
    min_samples: Option<usize>,

    /// Seed for the display sampler
    #[arg(long)]
    seed: Option<u64>,

    /// Point coloring of the display set
    #[arg(long, value_enum, default_value_t = ColorOpt::Magnitude)]
    color_by: ColorOpt,

    /// Neighbor search strategy
    #[arg(long, value_enum)]
    search: Option<SearchOpt>,

    /// JSON parameter file; flags take precedence
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Directory receiving the output tables
    #[arg(long, default_value = "quake_atlas_out", value_hint = ValueHint::DirPath)]
    out_dir: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Earthquake catalog CSV
    #[arg(long, value_hint = ValueHint::FilePath)]
    catalog: PathBuf,

    /// Report path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorOpt {
    Magnitude,
    Cluster,
}

impl From<ColorOpt> for ColorMode {
    fn from(value: ColorOpt) -> Self {
        match value {
            ColorOpt::Magnitude => ColorMode::ByMagnitude,
            ColorOpt::Cluster => ColorMode::ByCluster,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SearchOpt {
    Auto,
    Serial,
    Parallel,
}

impl From<SearchOpt> for NeighborSearch {
    fn from(value: SearchOpt) -> Self {
        match value {
            SearchOpt::Auto => NeighborSearch::Auto,
            SearchOpt::Serial => NeighborSearch::Serial,
            SearchOpt::Parallel => NeighborSearch::Parallel,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Analyze(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Analyze(args) => handle_analyze(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn handle_analyze(args: AnalyzeArgs) -> Result<()> {
    let timed = args.profile || args.verbose;
    let mut params = match args.config.as_ref() {
        Some(path) => load_params(path)?,
        None => Params::default(),
    };
    if let Some(cap) = args.display_cap {
        params.display_cap = cap;
    }
    if args.seed.is_some() {
        params.sample_seed = args.seed;
    }
    if let Some(eps) = args.eps {
        params.cluster.eps_rad = eps;
    }
    if let Some(km) = args.eps_km {
        params.cluster.eps_rad = km / EARTH_RADIUS_KM;
    }
    if let Some(min_samples) = args.min_samples {
        params.cluster.min_samples = min_samples;
    }
    if let Some(search) = args.search {
        params.cluster.search = search.into();
    }
    let color: ColorMode = args.color_by.into();

    let store = DatasetStore::global();
    let t_load = Instant::now();
    let catalog = store
        .catalog(&args.catalog)
        .with_context(|| format!("failed to load catalog {}", args.catalog.display()))?;
    if timed {
        info!(
            "Load stage: {:.1} ms ({} events)",
            t_load.elapsed().as_secs_f64() * 1000.0,
            catalog.len()
        );
    }

    let boundaries = args
        .boundaries
        .as_ref()
        .and_then(|path| match store.geometry(path) {
            Ok(geometry) => Some(geometry),
            Err(err) => {
                warn!("Continuing without plate boundaries: {}", err);
                None
            }
        });

    let criteria = default_criteria(&catalog, &args)?;
    info!(
        "Window {} .. {} (exclusive), magnitude {:.1} .. {:.1}",
        criteria.time_start.to_rfc3339_opts(SecondsFormat::Secs, true),
        criteria.time_end_exclusive.to_rfc3339_opts(SecondsFormat::Secs, true),
        criteria.mag_min,
        criteria.mag_max
    );

    let t_analyze = Instant::now();
    let analysis = analyze(&catalog, &criteria, &params)?;
    if timed {
        info!(
            "Analyze stage: {:.1} ms ({} matched, {} displayed)",
            t_analyze.elapsed().as_secs_f64() * 1000.0,
            analysis.filtered.len(),
            analysis.display.len()
        );
    }
    if analysis.status == AnalysisStatus::NoMatches {
        warn!("No events match the current filters; writing empty tables");
    }

    let clustering = if color == ColorMode::ByCluster {
        let t_cluster = Instant::now();
        let clustering = analysis.cluster_display(&params.cluster)?;
        if timed {
            info!(
                "Cluster stage: {:.1} ms ({} points)",
                t_cluster.elapsed().as_secs_f64() * 1000.0,
                clustering.labels.len()
            );
        }
        Some(clustering)
    } else {
        None
    };

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;
    let t_write = Instant::now();
    let out = |name: &str| args.out_dir.join(name);

    write_events_csv(&out("filtered.csv"), &analysis.filtered, catalog.extra_columns())?;
    write_display_csv(&out("display.csv"), &analysis.display, clustering.as_ref())?;
    write_yearly_csv(&out("yearly_counts.csv"), &analysis.yearly)?;
    write_energy_csv(&out("cumulative_energy.csv"), &analysis)?;

    let summary = Summary {
        catalog: catalog.report(),
        criteria: &criteria,
        params: &params,
        color_by: color.to_string(),
        status: analysis.status,
        filtered_count: analysis.filtered.len(),
        display_count: analysis.display.len(),
        downsampled: analysis.is_downsampled(),
        yearly: &analysis.yearly,
        total_energy: analysis.energy.total(),
        clustering: clustering.as_ref().map(ClusterSummary::from),
        boundaries: boundaries.as_deref().map(BoundarySummary::from),
    };
    let summary_path = out("summary.json");
    let file = File::create(&summary_path)
        .with_context(|| format!("failed to create {}", summary_path.display()))?;
    serde_json::to_writer_pretty(file, &summary)
        .with_context(|| format!("failed to write {}", summary_path.display()))?;

    if timed {
        info!(
            "Write stage: {:.1} ms",
            t_write.elapsed().as_secs_f64() * 1000.0
        );
    }
    info!("Wrote outputs to {}", args.out_dir.display());
    Ok(())
}

/// Flags win; otherwise the full catalog span and `[6.5, max magnitude]`.
fn default_criteria(catalog: &Catalog, args: &AnalyzeArgs) -> Result<FilterCriteria> {
    let (first, last) = catalog
        .time_span()
        .ok_or_else(|| anyhow!("catalog {} has no events", args.catalog.display()))?;
    let (_, max_mag) = catalog
        .magnitude_span()
        .ok_or_else(|| anyhow!("catalog {} has no events", args.catalog.display()))?;
    let start = args.start.unwrap_or_else(|| first.date_naive());
    let end = args.end.unwrap_or_else(|| last.date_naive());
    if end < start {
        return Err(anyhow!("--end {} is before --start {}", end, start));
    }
    let mag_min = args.mag_min.unwrap_or(DEFAULT_MAG_MIN);
    let mag_max = args.mag_max.unwrap_or(max_mag);
    if mag_min > mag_max {
        warn!(
            "Magnitude range {:.1} .. {:.1} is empty",
            mag_min, mag_max
        );
    }
    Ok(FilterCriteria::from_dates(start, end, mag_min, mag_max))
}

fn load_params(path: &Path) -> Result<Params> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let params: Params = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid parameter file", path.display()))?;
    info!("Loaded parameters from {}", path.display());
    Ok(params)
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    info!("Reading time column of {} ...", args.catalog.display());
    let report = inspect_time_column_path(&args.catalog)
        .with_context(|| format!("failed to inspect {}", args.catalog.display()))?;
    let text = render_inspection(&report);

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle.write_all(text.as_bytes())?;
    } else {
        fs::write(&args.output, text)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Inspection report written: {}", args.output.display());
    }
    Ok(())
}

fn render_inspection(report: &TimeColumnReport) -> String {
    let survey = &report.survey;
    let mut out = String::new();
    out.push_str(&format!("FILE: {}\n", report.source));
    out.push_str(&format!("  rows: {}\n", report.rows));
    out.push_str("  first timestamps (raw):\n");
    for value in &report.head {
        out.push_str(&format!("    - {}\n", value));
    }
    out.push_str("  last timestamps (raw):\n");
    for value in &report.tail {
        out.push_str(&format!("    - {}\n", value));
    }
    out.push_str("  encodings:\n");
    for (encoding, count) in &survey.by_encoding {
        out.push_str(&format!("    - {}: {}\n", encoding.label(), count));
    }
    out.push_str(&format!("  parsed: {}\n", survey.parsed));
    out.push_str(&format!("  unparseable: {}\n", survey.unparseable));
    if let (Some(first), Some(last)) = (survey.earliest, survey.latest) {
        out.push_str(&format!("  range: {} .. {}\n", format_time(first), format_time(last)));
    }
    if survey.unparseable > 0 {
        out.push_str(&format!(
            "  result: {} rows would be dropped for unreadable times\n",
            survey.unparseable
        ));
    } else {
        out.push_str("  result: every timestamp parsed\n");
    }
    out
}

#[derive(Serialize)]
struct Summary<'a> {
    catalog: &'a NormalizeReport,
    criteria: &'a FilterCriteria,
    params: &'a Params,
    color_by: String,
    status: AnalysisStatus,
    filtered_count: usize,
    display_count: usize,
    downsampled: bool,
    yearly: &'a YearlyCounts,
    total_energy: f64,
    clustering: Option<ClusterSummary>,
    boundaries: Option<BoundarySummary>,
}

#[derive(Serialize)]
struct ClusterSummary {
    cluster_count: usize,
    noise_count: usize,
    eps_rad: f64,
    eps_km: f64,
    min_samples: usize,
    fingerprint: String,
}

impl From<&Clustering> for ClusterSummary {
    fn from(value: &Clustering) -> Self {
        Self {
            cluster_count: value.cluster_count,
            noise_count: value.noise_count,
            eps_rad: value.eps_rad,
            eps_km: value.eps_rad * EARTH_RADIUS_KM,
            min_samples: value.min_samples,
            fingerprint: value.fingerprint.clone(),
        }
    }
}

#[derive(Serialize)]
struct BoundarySummary {
    polylines: usize,
    vertices: usize,
    skipped_features: usize,
}

impl From<&ReferenceGeometry> for BoundarySummary {
    fn from(value: &ReferenceGeometry) -> Self {
        Self {
            polylines: value.len(),
            vertices: value.vertex_count(),
            skipped_features: value.skipped_features(),
        }
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn create_csv(path: &Path) -> Result<csv::Writer<File>> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    Ok(csv::Writer::from_writer(file))
}

fn event_fields(record: &EventRecord) -> Vec<String> {
    vec![
        format_time(record.time),
        record.latitude.to_string(),
        record.longitude.to_string(),
        record.depth.to_string(),
        record.magnitude.to_string(),
        record.place.clone().unwrap_or_default(),
    ]
}

const EVENT_HEADER: [&str; 6] = ["time", "latitude", "longitude", "depth", "mag", "place"];

fn write_events_csv(path: &Path, events: &[&EventRecord], extra_columns: &[String]) -> Result<()> {
    let mut writer = create_csv(path)?;
    let mut header: Vec<&str> = EVENT_HEADER.to_vec();
    header.extend(extra_columns.iter().map(String::as_str));
    writer.write_record(&header)?;
    for record in events {
        let mut fields = event_fields(record);
        fields.extend(record.extras.iter().cloned());
        writer.write_record(&fields)?;
    }
    writer.flush()?;
    info!("Wrote {} filtered events: {}", events.len(), path.display());
    Ok(())
}

fn write_display_csv(
    path: &Path,
    events: &[&EventRecord],
    clustering: Option<&Clustering>,
) -> Result<()> {
    let mut writer = create_csv(path)?;
    let mut header: Vec<&str> = EVENT_HEADER.to_vec();
    if clustering.is_some() {
        header.push("cluster");
    }
    writer.write_record(&header)?;
    for (idx, record) in events.iter().enumerate() {
        let mut fields = event_fields(record);
        if let Some(clustering) = clustering {
            let label = clustering
                .labels
                .get(idx)
                .ok_or_else(|| anyhow!("cluster labels do not cover display row {}", idx))?;
            fields.push(label.to_string());
        }
        writer.write_record(&fields)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_yearly_csv(path: &Path, yearly: &YearlyCounts) -> Result<()> {
    let mut writer = create_csv(path)?;
    writer.write_record(["year", "count"])?;
    for (year, count) in yearly {
        writer.write_record([year.to_string(), count.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_energy_csv(path: &Path, analysis: &Analysis<'_>) -> Result<()> {
    let mut writer = create_csv(path)?;
    writer.write_record(["time", "mag", "energy", "cumulative_energy"])?;
    for point in &analysis.energy.points {
        writer.write_record([
            format_time(point.time),
            point.magnitude.to_string(),
            format!("{:e}", point.energy),
            format!("{:e}", point.cumulative),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
