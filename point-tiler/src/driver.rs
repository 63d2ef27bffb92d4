//! Conversion orchestration.
//!
//! Two passes over the inputs, like every converter in this lineage:
//! pass 1 establishes bounds and point totals, pass 2 streams batches
//! into the tiler. The manifest is written last, so its existence always
//! means a fully populated output.

use crate::config::{ConverterConfig, SpacingSpec, StoreOption};
use crate::error::{Result, TilerError};
use crate::execution::ExecutionGraph;
use crate::manifest::{
    RunStatistics, SourceEntry, SourcesManifest, TilesetManifest, MANIFEST_VERSION,
};
use crate::persistence::NodeStorage;
use crate::progress::{
    ProgressReporter, COUNTER_THROUGHPUT, PHASE_FINISHING, PHASE_INDEXING,
};
use crate::sources::{is_recognized, SourceReader};
use crate::tiler::{CancellationToken, Tiler, TilerOptions, TilingAlgorithm};
use crate::transform::{transform_for_projection, Transform};
use point_data::aabb::Aabb;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// One input file after the bounds pass.
struct PreparedSource {
    path: PathBuf,
    bounds: Aabb,
    point_count: u64,
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct ConversionSummary {
    pub bounds: Aabb,
    pub spacing: f64,
    pub sources: Vec<SourceEntry>,
    pub statistics: RunStatistics,
}

/// Drives a whole conversion: source discovery, bounds, tiling, manifest.
pub struct Converter {
    config: ConverterConfig,
    progress: ProgressReporter,
    cancel: CancellationToken,
}

impl Converter {
    pub fn new(config: ConverterConfig) -> Self {
        Self {
            config,
            progress: ProgressReporter::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn progress(&self) -> ProgressReporter {
        self.progress.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run(&self) -> Result<ConversionSummary> {
        let start = Instant::now();
        self.config.validate()?;

        let existing_manifest = self.prepare_output_dir()?;

        let mut failed_sources = 0u64;
        let source_files = self.expand_sources(&mut failed_sources)?;

        let schema = self.config.schema();
        println!("Writing the following point attributes: {}", schema);

        // Pass 1: bounds and totals.
        let mut prepared = Vec::new();
        let mut union_bounds = Aabb::empty();
        for path in source_files {
            if self.cancel.is_cancelled() {
                return Err(TilerError::Cancelled);
            }
            match self.prepare_source(&path) {
                Ok(source) => {
                    union_bounds.extend(&source.bounds);
                    prepared.push(source);
                }
                Err(error) => {
                    eprintln!("{}", error);
                    failed_sources += 1;
                }
            }
        }

        let (root_bounds, spacing) = self.root_bounds_and_spacing(&union_bounds)?;
        println!("AABB: {:?}", union_bounds);
        println!("cubic AABB: {:?}", root_bounds);

        if let Some(manifest) = &existing_manifest {
            if (manifest.spacing - spacing).abs() > f64::EPSILON * spacing.abs() {
                return Err(TilerError::invalid_config(format!(
                    "existing output uses spacing {}, this run would use {}",
                    manifest.spacing, spacing
                )));
            }
        }

        let (transform, transform_warning) =
            transform_for_projection(self.config.source_projection.as_deref());
        if let Some(warning) = transform_warning {
            eprintln!("{}", warning);
        }

        let storage = Arc::new(NodeStorage::new(
            &self.config.output_dir,
            self.config.output_format,
            transform,
            schema.clone(),
        )?);
        let graph = ExecutionGraph::new(self.config.concurrency)?;
        let options = TilerOptions {
            root_bounds,
            spacing,
            max_depth: self.config.max_depth,
            internal_node_capacity: self.config.internal_node_capacity,
            process_threshold: self.config.process_threshold,
            max_memory_bytes: self.config.max_memory_bytes(),
            sampling: self.config.sampling,
            algorithm: TilingAlgorithm::for_concurrency(self.config.concurrency),
        };
        let mut tiler = Tiler::new(
            options,
            schema.clone(),
            Arc::clone(&storage),
            graph,
            &self.progress,
            self.cancel.clone(),
        );

        // Pass 2: stream every source through the tiler.
        let total_points: u64 = prepared.iter().map(|s| s.point_count).sum();
        let indexing = self.progress.register_integer(PHASE_INDEXING, total_points);
        let throughput = self.progress.register_float(COUNTER_THROUGHPUT, 0.0);

        let mut entries = Vec::new();
        let mut points_processed = 0u64;
        for source in &prepared {
            match self.ingest_source(source, &schema, &mut tiler, |count| {
                points_processed += count;
                indexing.set_current(points_processed);
                let elapsed = start.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    throughput.set_current_float(points_processed as f64 / elapsed);
                }
            }) {
                Ok(points) => entries.push(SourceEntry {
                    name: source
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| source.path.display().to_string()),
                    points,
                    bounds: manifest_bounds(&source.bounds, &transform),
                }),
                Err(TilerError::Decode { path, message }) => {
                    eprintln!(
                        "decode error in \"{}\": {}; aborting this source",
                        path, message
                    );
                    failed_sources += 1;
                }
                Err(error) => return Err(error),
            }
        }

        let finishing = self.progress.register_integer(PHASE_FINISHING, 1);
        tiler.flush()?;
        finishing.inc(1);

        let tiler_stats = tiler.stats();
        let statistics = RunStatistics {
            points_processed,
            points_stored: tiler_stats.points_stored,
            discarded_by_depth: tiler_stats.discarded_by_depth,
            sources_failed: failed_sources,
        };

        let projection = self.config.source_projection.clone().unwrap_or_default();
        SourcesManifest {
            bounds: manifest_bounds(&union_bounds, &transform),
            projection: projection.clone(),
            sources: entries.clone(),
        }
        .write(&self.config.output_dir)?;

        let manifest = TilesetManifest {
            version: MANIFEST_VERSION,
            bounds: manifest_bounds(&root_bounds, &transform),
            projection,
            schema: schema.names(),
            spacing,
            max_depth: self.config.max_depth,
            sources: entries.clone(),
            statistics: statistics.clone(),
        };
        manifest.write(&self.config.output_dir)?;

        let seconds = start.elapsed().as_secs_f64();
        let percent = if points_processed > 0 {
            100.0 * statistics.points_stored as f64 / points_processed as f64
        } else {
            0.0
        };
        println!(
            "Conversion finished! {} points processed, {} points ({:.2} %) written to output. Took {:.1}s.",
            points_processed, statistics.points_stored, percent, seconds
        );

        Ok(ConversionSummary {
            bounds: root_bounds,
            spacing,
            sources: entries,
            statistics,
        })
    }

    /// Applies the store option. Returns the previous manifest for
    /// INCREMENTAL runs so spacing can be reconciled once it is known.
    fn prepare_output_dir(&self) -> Result<Option<TilesetManifest>> {
        let output_dir = &self.config.output_dir;
        let manifest_path = TilesetManifest::path_in(output_dir);
        let mut existing = None;

        if manifest_path.exists() {
            match self.config.store_option {
                StoreOption::AbortIfExists => {
                    return Err(TilerError::OutputExists {
                        path: output_dir.display().to_string(),
                    });
                }
                StoreOption::Overwrite => {
                    println!("Output directory not empty, removing existing files...");
                    let entries = fs::read_dir(output_dir).map_err(|e| {
                        TilerError::io(format!("listing {}", output_dir.display()), e)
                    })?;
                    for entry in entries {
                        let entry = entry.map_err(|e| {
                            TilerError::io(format!("listing {}", output_dir.display()), e)
                        })?;
                        let path = entry.path();
                        let removed = if path.is_dir() {
                            fs::remove_dir_all(&path)
                        } else {
                            fs::remove_file(&path)
                        };
                        removed.map_err(|e| {
                            TilerError::io(format!("removing {}", path.display()), e)
                        })?;
                    }
                }
                StoreOption::Incremental => {
                    println!("Appending to existing output directory...");
                    let manifest = TilesetManifest::read(output_dir)?;
                    if manifest.version != MANIFEST_VERSION {
                        return Err(TilerError::invalid_config(format!(
                            "existing output has format version {}, expected {}",
                            manifest.version, MANIFEST_VERSION
                        )));
                    }
                    if manifest.schema != self.config.schema().names() {
                        return Err(TilerError::invalid_config(
                            "existing output was written with a different attribute schema",
                        ));
                    }
                    existing = Some(manifest);
                }
            }
        }

        fs::create_dir_all(output_dir)
            .map_err(|e| TilerError::io(format!("creating {}", output_dir.display()), e))?;
        Ok(existing)
    }

    /// Expands configured sources: directories become their recognized
    /// files, missing entries are warned about and skipped.
    fn expand_sources(&self, failed: &mut u64) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for source in &self.config.sources {
            if source.is_dir() {
                let entries = fs::read_dir(source)
                    .map_err(|e| TilerError::io(format!("listing {}", source.display()), e))?;
                let mut found: Vec<PathBuf> = entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.path())
                    .filter(|path| path.is_file() && is_recognized(path))
                    .collect();
                found.sort();
                files.extend(found);
            } else if source.is_file() {
                files.push(source.clone());
            } else {
                eprintln!(
                    "{}",
                    TilerError::InputNotFound {
                        path: source.display().to_string(),
                    }
                );
                *failed += 1;
            }
        }
        if files.is_empty() {
            return Err(TilerError::invalid_config(
                "no readable input files remain",
            ));
        }
        Ok(files)
    }

    /// Bounds pass over one source: header bounds when the format has
    /// them, a full scan otherwise.
    fn prepare_source(&self, path: &Path) -> Result<PreparedSource> {
        let schema = self.config.schema();
        let mut reader = SourceReader::open(
            path,
            &schema,
            self.config.color_range,
            self.config.intensity_range,
        )?;
        let info = reader.info();
        if let (Some(bounds), Some(count)) = (info.natural_bounds, info.point_count) {
            return Ok(PreparedSource {
                path: path.to_path_buf(),
                bounds,
                point_count: count,
            });
        }

        let mut bounds = Aabb::empty();
        let mut count = 0u64;
        while let Some(batch) = reader.read_batch(self.config.batch_size)? {
            for &p in batch.positions() {
                bounds.update(p);
            }
            count += batch.len() as u64;
        }
        Ok(PreparedSource {
            path: path.to_path_buf(),
            bounds,
            point_count: count,
        })
    }

    fn root_bounds_and_spacing(&self, union_bounds: &Aabb) -> Result<(Aabb, f64)> {
        // Degenerate inputs (no points at all) still get a valid root so
        // the empty manifest can be written.
        let cubic = if union_bounds.is_empty() {
            Aabb::new([0.0; 3], [1.0; 3])
        } else {
            union_bounds.make_cubic()
        };
        let spacing = match self.config.spacing {
            SpacingSpec::Absolute(spacing) => spacing,
            SpacingSpec::DiagonalFraction(fraction) => {
                let diagonal = cubic.diagonal();
                let spacing = if diagonal > 0.0 {
                    diagonal / f64::from(fraction)
                } else {
                    1.0
                };
                println!("spacing calculated from diagonal: {}", spacing);
                spacing
            }
        };
        if !(spacing > 0.0) {
            return Err(TilerError::invalid_config("spacing must be positive"));
        }
        Ok((cubic, spacing))
    }

    /// Streams one source into the tiler; returns the number of points it
    /// contributed.
    fn ingest_source(
        &self,
        source: &PreparedSource,
        schema: &point_data::AttributeSchema,
        tiler: &mut Tiler,
        mut on_batch: impl FnMut(u64),
    ) -> Result<u64> {
        let mut reader = SourceReader::open(
            &source.path,
            schema,
            self.config.color_range,
            self.config.intensity_range,
        )?;

        let missing = reader.missing_attributes();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|a| a.name()).collect();
            eprintln!(
                "\"{}\" does not provide {}; the missing values are zero-filled",
                source.path.display(),
                names.join(", ")
            );
        }

        let mut points = 0u64;
        while let Some(batch) = reader.read_batch(self.config.batch_size)? {
            if self.cancel.is_cancelled() {
                return Err(TilerError::Cancelled);
            }
            let count = batch.len() as u64;
            tiler.add(batch)?;
            points += count;
            on_batch(count);
        }
        Ok(points)
    }
}

/// Bounds as they appear in JSON: transformed into output coordinates,
/// with empty boxes collapsed to zeros so the JSON stays finite.
fn manifest_bounds(bounds: &Aabb, transform: &Transform) -> Aabb {
    if bounds.is_empty() {
        return Aabb::new([0.0; 3], [0.0; 3]);
    }
    transform.apply_to_bounds(bounds)
}
