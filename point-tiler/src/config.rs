use crate::error::{Result, TilerError};
use point_data::attributes::{AttributeSchema, PointAttribute};
use point_data::morton::MORTON_LEVELS;
use std::path::PathBuf;

/// What to do when the output directory already holds a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOption {
    AbortIfExists,
    Overwrite,
    Incremental,
}

/// On-disk encoding of node payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Bin,
    Las,
    Laz,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Bin => "bin",
            OutputFormat::Las => "las",
            OutputFormat::Laz => "laz",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OutputFormat::Bin => "BIN",
            OutputFormat::Las => "LAS",
            OutputFormat::Laz => "LAZ",
        }
    }
}

/// Density-reduction strategy and its parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    /// `S×S×S` occupancy grid per node; the parameter is the default grid
    /// size `S`, shrunk per depth so cells never undercut the spacing.
    Grid { grid_size: u32 },
    /// Seeded uniform subset with a per-node point cap.
    Random { max_points: usize },
}

impl Default for SamplingStrategy {
    fn default() -> Self {
        SamplingStrategy::Grid { grid_size: 128 }
    }
}

/// Minimum point separation at the root, absolute or as a fraction of the
/// bounds diagonal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpacingSpec {
    Absolute(f64),
    DiagonalFraction(u32),
}

/// Full run configuration, enumerated in spec order.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    pub output_dir: PathBuf,
    pub sources: Vec<PathBuf>,
    pub spacing: SpacingSpec,
    pub max_depth: u32,
    pub output_format: OutputFormat,
    pub point_attributes: Vec<PointAttribute>,
    pub source_projection: Option<String>,
    pub store_option: StoreOption,
    pub sampling: SamplingStrategy,
    pub concurrency: usize,
    pub max_memory_usage_mib: usize,
    pub internal_node_capacity: usize,
    pub process_threshold: usize,
    pub color_range: (f64, f64),
    pub intensity_range: (f64, f64),
    pub batch_size: usize,
}

impl ConverterConfig {
    pub fn new(output_dir: impl Into<PathBuf>, sources: Vec<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            sources,
            spacing: SpacingSpec::DiagonalFraction(200),
            max_depth: 12,
            output_format: OutputFormat::Bin,
            point_attributes: Vec::new(),
            source_projection: None,
            store_option: StoreOption::AbortIfExists,
            sampling: SamplingStrategy::default(),
            concurrency: std::thread::available_parallelism().map_or(1, |n| n.get()),
            max_memory_usage_mib: 2048,
            internal_node_capacity: 20_000,
            process_threshold: 1_000_000,
            color_range: (0.0, 255.0),
            intensity_range: (0.0, 65535.0),
            batch_size: 65_536,
        }
    }

    pub fn schema(&self) -> AttributeSchema {
        AttributeSchema::new(&self.point_attributes)
    }

    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_usage_mib.saturating_mul(1024 * 1024)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(TilerError::invalid_config("no input files given"));
        }
        if let SpacingSpec::Absolute(spacing) = self.spacing {
            if !(spacing > 0.0) {
                return Err(TilerError::invalid_config("spacing must be positive"));
            }
        }
        if let SpacingSpec::DiagonalFraction(fraction) = self.spacing {
            if fraction == 0 {
                return Err(TilerError::invalid_config(
                    "diagonal fraction must be positive",
                ));
            }
        }
        if self.max_depth > MORTON_LEVELS {
            return Err(TilerError::invalid_config(format!(
                "max depth {} exceeds the supported maximum of {}",
                self.max_depth, MORTON_LEVELS
            )));
        }
        if self.internal_node_capacity == 0 {
            return Err(TilerError::invalid_config(
                "internal node capacity must be positive",
            ));
        }
        if self.process_threshold == 0 {
            return Err(TilerError::invalid_config(
                "process threshold must be positive",
            ));
        }
        if self.concurrency == 0 {
            return Err(TilerError::invalid_config("concurrency must be positive"));
        }
        match self.sampling {
            SamplingStrategy::Grid { grid_size } if grid_size == 0 => {
                Err(TilerError::invalid_config("grid size must be positive"))
            }
            SamplingStrategy::Random { max_points } if max_points == 0 => {
                Err(TilerError::invalid_config("random cap must be positive"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ConverterConfig::new("/tmp/out", vec![PathBuf::from("a.las")]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_spacing_rejected() {
        let mut config = ConverterConfig::new("/tmp/out", vec![PathBuf::from("a.las")]);
        config.spacing = SpacingSpec::Absolute(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn excessive_depth_rejected() {
        let mut config = ConverterConfig::new("/tmp/out", vec![PathBuf::from("a.las")]);
        config.max_depth = MORTON_LEVELS + 1;
        assert!(config.validate().is_err());
    }
}
