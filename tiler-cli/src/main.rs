use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use point_data::attributes::PointAttribute;
use point_tiler::progress::CounterValue;
use point_tiler::{
    ConverterConfig, Converter, OutputFormat, SamplingStrategy, SpacingSpec, StoreOption,
};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn print_usage(program: &str) {
    eprintln!("Usage:");
    eprintln!("  {} <input files or directories...> -o <output_dir> [options]", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -o, --output DIR           output directory (required)");
    eprintln!("  --spacing F                minimum point separation at the root");
    eprintln!("  --diagonal-fraction N      spacing as bounds diagonal / N (default 200)");
    eprintln!("  --max-depth N              octree depth limit (default 12)");
    eprintln!("  --output-format FMT        BIN, LAS or LAZ (default BIN)");
    eprintln!("  --attributes LIST          comma list: RGB, RGB_FROM_INTENSITY, INTENSITY,");
    eprintln!("                             CLASSIFICATION, NORMAL");
    eprintln!("  --projection STR           source coordinate system description");
    eprintln!("  --overwrite                replace an existing output directory");
    eprintln!("  --incremental              append to an existing output directory");
    eprintln!("  --sampling MODE            grid or random (default grid)");
    eprintln!("  --grid-size N              grid sampling resolution (default 128)");
    eprintln!("  --random-cap N             random sampling per-node cap (default 20000)");
    eprintln!("  --concurrency N            worker threads (default: hardware)");
    eprintln!("  --max-memory MIB           in-flight point budget (default 2048)");
    eprintln!("  --node-capacity N          split threshold per node (default 20000)");
    eprintln!("  --process-threshold N      points queued per processing round (default 1000000)");
    eprintln!("  --color-range MIN,MAX      raw colour input range (default 0,255)");
    eprintln!("  --intensity-range MIN,MAX  raw intensity input range (default 0,65535)");
}

fn parse_range(text: &str) -> Option<(f64, f64)> {
    let mut parts = text.split(',');
    let min = parts.next()?.trim().parse().ok()?;
    let max = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((min, max))
}

/// Parses the command line into a config. Returns `Err` with a message on
/// any usage problem.
fn parse_args(args: &[String]) -> Result<ConverterConfig, String> {
    let mut inputs = Vec::new();
    let mut output: Option<PathBuf> = None;
    let mut spacing: Option<SpacingSpec> = None;
    let mut max_depth: Option<u32> = None;
    let mut output_format: Option<OutputFormat> = None;
    let mut attributes = Vec::new();
    let mut projection: Option<String> = None;
    let mut store_option = StoreOption::AbortIfExists;
    let mut sampling_mode: Option<String> = None;
    let mut grid_size: Option<u32> = None;
    let mut random_cap: Option<usize> = None;
    let mut concurrency: Option<usize> = None;
    let mut max_memory: Option<usize> = None;
    let mut node_capacity: Option<usize> = None;
    let mut process_threshold: Option<usize> = None;
    let mut color_range: Option<(f64, f64)> = None;
    let mut intensity_range: Option<(f64, f64)> = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{} expects a value", name))
        };
        match arg.as_str() {
            "-o" | "--output" => output = Some(PathBuf::from(value(arg)?)),
            "--spacing" => {
                let v: f64 = value(arg)?
                    .parse()
                    .map_err(|_| "--spacing expects a number".to_string())?;
                spacing = Some(SpacingSpec::Absolute(v));
            }
            "--diagonal-fraction" => {
                let v: u32 = value(arg)?
                    .parse()
                    .map_err(|_| "--diagonal-fraction expects an integer".to_string())?;
                spacing = Some(SpacingSpec::DiagonalFraction(v));
            }
            "--max-depth" => {
                max_depth = Some(
                    value(arg)?
                        .parse()
                        .map_err(|_| "--max-depth expects an integer".to_string())?,
                );
            }
            "--output-format" => {
                output_format = Some(match value(arg)?.to_ascii_uppercase().as_str() {
                    "BIN" => OutputFormat::Bin,
                    "LAS" => OutputFormat::Las,
                    "LAZ" => OutputFormat::Laz,
                    other => return Err(format!("unknown output format \"{}\"", other)),
                });
            }
            "--attributes" => {
                for name in value(arg)?.split(',') {
                    let name = name.trim();
                    if name.is_empty() {
                        continue;
                    }
                    match PointAttribute::from_name(name) {
                        Some(attribute) => attributes.push(attribute),
                        None => return Err(format!("unknown attribute \"{}\"", name)),
                    }
                }
            }
            "--projection" => projection = Some(value(arg)?),
            "--overwrite" => store_option = StoreOption::Overwrite,
            "--incremental" => store_option = StoreOption::Incremental,
            "--sampling" => sampling_mode = Some(value(arg)?.to_ascii_lowercase()),
            "--grid-size" => {
                grid_size = Some(
                    value(arg)?
                        .parse()
                        .map_err(|_| "--grid-size expects an integer".to_string())?,
                );
            }
            "--random-cap" => {
                random_cap = Some(
                    value(arg)?
                        .parse()
                        .map_err(|_| "--random-cap expects an integer".to_string())?,
                );
            }
            "--concurrency" => {
                concurrency = Some(
                    value(arg)?
                        .parse()
                        .map_err(|_| "--concurrency expects an integer".to_string())?,
                );
            }
            "--max-memory" => {
                max_memory = Some(
                    value(arg)?
                        .parse()
                        .map_err(|_| "--max-memory expects an integer".to_string())?,
                );
            }
            "--node-capacity" => {
                node_capacity = Some(
                    value(arg)?
                        .parse()
                        .map_err(|_| "--node-capacity expects an integer".to_string())?,
                );
            }
            "--process-threshold" => {
                process_threshold = Some(
                    value(arg)?
                        .parse()
                        .map_err(|_| "--process-threshold expects an integer".to_string())?,
                );
            }
            "--color-range" => {
                color_range = Some(
                    parse_range(&value(arg)?)
                        .ok_or_else(|| "--color-range expects MIN,MAX".to_string())?,
                );
            }
            "--intensity-range" => {
                intensity_range = Some(
                    parse_range(&value(arg)?)
                        .ok_or_else(|| "--intensity-range expects MIN,MAX".to_string())?,
                );
            }
            other if other.starts_with('-') => {
                return Err(format!("unknown option \"{}\"", other));
            }
            input => inputs.push(PathBuf::from(input)),
        }
    }

    let output = output.ok_or_else(|| "no output directory given".to_string())?;
    if inputs.is_empty() {
        return Err("no input files given".to_string());
    }

    let mut config = ConverterConfig::new(output, inputs);
    if let Some(spacing) = spacing {
        config.spacing = spacing;
    }
    if let Some(depth) = max_depth {
        config.max_depth = depth;
    }
    if let Some(format) = output_format {
        config.output_format = format;
    }
    config.point_attributes = attributes;
    config.source_projection = projection;
    config.store_option = store_option;
    config.sampling = match sampling_mode.as_deref() {
        None | Some("grid") => SamplingStrategy::Grid {
            grid_size: grid_size.unwrap_or(128),
        },
        Some("random") => SamplingStrategy::Random {
            max_points: random_cap.unwrap_or(20_000),
        },
        Some(other) => return Err(format!("unknown sampling mode \"{}\"", other)),
    };
    if let Some(concurrency) = concurrency {
        config.concurrency = concurrency;
    }
    if let Some(mib) = max_memory {
        config.max_memory_usage_mib = mib;
    }
    if let Some(capacity) = node_capacity {
        config.internal_node_capacity = capacity;
    }
    if let Some(threshold) = process_threshold {
        config.process_threshold = threshold;
    }
    if let Some(range) = color_range {
        config.color_range = range;
    }
    if let Some(range) = intensity_range {
        config.intensity_range = range;
    }
    Ok(config)
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:>12} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)")
        .unwrap()
        .progress_chars("█▉▊▋▌▍▎▏ ")
}

/// Renders the converter's polled progress counters until the worker
/// thread finishes.
fn render_progress(
    converter: Converter,
) -> Result<point_tiler::ConversionSummary, point_tiler::TilerError> {
    let progress = converter.progress();
    let worker = std::thread::spawn(move || converter.run());

    let multi = MultiProgress::new();
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();
    loop {
        for (name, value) in progress.snapshot() {
            match value {
                CounterValue::Integer { current, max } => {
                    let bar = bars.entry(name.clone()).or_insert_with(|| {
                        let bar = multi.add(ProgressBar::new(max.max(1)));
                        bar.set_style(bar_style());
                        bar.set_prefix(name.clone());
                        bar
                    });
                    bar.set_length(max.max(1));
                    bar.set_position(current);
                }
                CounterValue::Float { current, .. } => {
                    let bar = bars.entry(name.clone()).or_insert_with(|| {
                        let bar = multi.add(ProgressBar::new_spinner());
                        bar.set_prefix(name.clone());
                        bar
                    });
                    bar.set_message(format!("{} {:.0}", name, current));
                }
            }
        }
        if worker.is_finished() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    for bar in bars.values() {
        bar.finish();
    }

    worker
        .join()
        .unwrap_or_else(|_| Err(point_tiler::TilerError::Cancelled))
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args
        .first()
        .map(String::as_str)
        .unwrap_or("point-tiler")
        .to_string();

    let config = match parse_args(&args[1..]) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("Error: {}", message);
            eprintln!();
            print_usage(&program);
            std::process::exit(1);
        }
    };

    let converter = Converter::new(config);
    match render_progress(converter) {
        Ok(_) => {}
        Err(error) => {
            eprintln!("{}", error);
            std::process::exit(error.exit_code());
        }
    }
}
