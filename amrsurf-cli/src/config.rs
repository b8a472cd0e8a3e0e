//! Run settings
//!
//! Values come from the command line first, then from the `--ifile` TOML
//! file, then from built-in defaults. Boolean switches are on when either
//! source turns them on.

use crate::args::Cli;
use amrsurf_algorithms::{GradientComponent, PhysicalBox};
use amrsurf_core::Isovalue;
use amrsurf_io::OutputFormat;
use amrsurf_reconstruction::{CollectiveConfig, ExtractionConfig, GhostConfig, ReadPolicy};
use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_FORMAT: &str = "ply";
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Contents of an `--ifile` input file. Keys match the long option names
/// with `_` in place of `-`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub datapath: Option<PathBuf>,
    pub pname: Option<Vec<String>>,
    pub nskip: Option<usize>,
    pub field: Option<String>,
    pub sample_field: Option<String>,
    pub value: Option<f64>,
    pub vfunction: Option<Vec<f64>>,
    pub gradient: Option<GradientComponent>,
    pub smooth: Option<f64>,
    pub iso_edge: Option<Vec<f64>>,
    pub do_ghost: Option<bool>,
    pub ghost_width: Option<usize>,
    pub single_level: Option<bool>,
    #[serde(alias = "yt")]
    pub uniform: Option<bool>,
    pub uniform_level: Option<usize>,
    pub outpath: Option<PathBuf>,
    pub format: Option<String>,
    pub nprocs: Option<usize>,
    pub nthreads: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub verbose: Option<bool>,
}

impl FileConfig {
    /// Read and parse a TOML input file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read input file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse input file {}", path.display()))
    }
}

/// Everything a run needs, after merging and validation
#[derive(Debug, Clone)]
pub struct Settings {
    pub datapath: PathBuf,
    pub patterns: Option<Vec<String>>,
    pub nskip: usize,
    pub outpath: PathBuf,
    pub format: OutputFormat,
    /// Format name as given, kept to report aliases
    pub format_name: String,
    pub extraction: ExtractionConfig,
    /// Use the uniform covering-grid path
    pub uniform: bool,
    /// Covering-grid level, `None` for each snapshot's finest level
    pub uniform_level: Option<usize>,
    pub workers: usize,
    pub threads: Option<usize>,
    pub collective: CollectiveConfig,
    pub verbose: bool,
}

impl Settings {
    /// Settings from parsed arguments and the input file they name, if any
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let file = match &cli.ifile {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    /// Merge command-line values over file values over defaults
    pub fn merge(cli: &Cli, file: FileConfig) -> Result<Self> {
        // The format is checked before anything else is looked at
        let format_name = cli
            .format
            .clone()
            .or(file.format.clone())
            .unwrap_or_else(|| DEFAULT_FORMAT.to_string());
        let format: OutputFormat = format_name.parse()?;

        let uniform = cli.uniform || file.uniform.unwrap_or(false);
        ensure!(
            !uniform || format == OutputFormat::Xdmf,
            "--yt stores one sample per triangle and needs --format xdmf or hdf5, got {}",
            format_name
        );

        let datapath = cli
            .datapath
            .clone()
            .or(file.datapath.clone())
            .context("--datapath is required")?;
        let field = cli
            .field
            .clone()
            .or(file.field.clone())
            .context("--field is required")?;
        let isovalue = resolve_isovalue(cli, &file)?;

        let mut extraction = ExtractionConfig::new(field, isovalue);
        if let Some(sample) = cli.sample_field.clone().or(file.sample_field.clone()) {
            extraction = extraction.with_sample_field(sample);
        }
        if let Some(component) = cli.gradient.or(file.gradient) {
            extraction = extraction.with_gradient(component);
        }
        if let Some(sigma) = cli.smooth.or(file.smooth) {
            ensure!(
                sigma.is_finite() && sigma >= 0.0,
                "--smooth must be a non-negative number of cells, got {}",
                sigma
            );
            extraction = extraction.with_smoothing(sigma);
        }
        if let Some(edges) = cli.iso_edge.as_ref().or(file.iso_edge.as_ref()) {
            extraction = extraction.with_region(PhysicalBox::from_values(edges)?);
        }
        if cli.do_ghost || file.do_ghost.unwrap_or(false) {
            let single_level = cli.single_level || file.single_level.unwrap_or(false);
            let policy = if single_level {
                ReadPolicy::SingleLevel
            } else {
                ReadPolicy::FinestLevel
            };
            let width = cli.ghost_width.or(file.ghost_width).unwrap_or(1);
            extraction = extraction.with_ghost(GhostConfig::default().with_width(width).with_policy(policy));
        }

        let workers = cli.nprocs.or(file.nprocs).unwrap_or(1);
        ensure!(workers >= 1, "--nprocs must be at least 1");
        let threads = cli.nthreads.or(file.nthreads);
        ensure!(threads != Some(0), "--nthreads must be at least 1");
        let timeout = cli
            .timeout_secs
            .or(file.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        ensure!(timeout > 0, "--timeout-secs must be positive");

        let outpath = cli
            .outpath
            .clone()
            .or(file.outpath)
            .unwrap_or_else(|| default_outpath(&datapath));

        Ok(Self {
            patterns: cli.pname.clone().or(file.pname),
            nskip: cli.nskip.or(file.nskip).unwrap_or(0),
            outpath,
            format,
            format_name,
            extraction,
            uniform,
            uniform_level: cli.uniform_level.or(file.uniform_level),
            workers,
            threads,
            collective: CollectiveConfig::default().with_timeout(Duration::from_secs(timeout)),
            verbose: cli.verbose || file.verbose.unwrap_or(false),
            datapath,
        })
    }
}

/// `<datapath>/../outdata/isosurfaces`
pub fn default_outpath(datapath: &Path) -> PathBuf {
    datapath.join("..").join("outdata").join("isosurfaces")
}

/// A command-line isovalue replaces the file's, whichever kind either is
fn resolve_isovalue(cli: &Cli, file: &FileConfig) -> Result<Isovalue> {
    let (value, vfunction) = if cli.value.is_some() || cli.vfunction.is_some() {
        (cli.value, cli.vfunction.as_deref())
    } else {
        (file.value, file.vfunction.as_deref())
    };
    match (value, vfunction) {
        (Some(value), None) => {
            ensure!(value.is_finite(), "--value must be finite, got {}", value);
            Ok(Isovalue::Fixed(value))
        }
        (None, Some(breakpoints)) => Ok(Isovalue::from_breakpoints(breakpoints)?),
        (Some(_), Some(_)) => bail!("--value and --vfunction are mutually exclusive"),
        (None, None) => bail!("One of --value or --vfunction is required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amrsurf_reconstruction::ExtractionPath;
    use approx::assert_relative_eq;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("amrsurf").chain(args.iter().copied())).unwrap()
    }

    fn file(text: &str) -> FileConfig {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::merge(
            &cli(&["--datapath", "/runs/a/plt", "--field", "temp", "--value", "1500"]),
            FileConfig::default(),
        )
        .unwrap();

        assert_eq!(settings.format, OutputFormat::Ply);
        assert_eq!(settings.outpath, PathBuf::from("/runs/a/plt/../outdata/isosurfaces"));
        assert_eq!(settings.workers, 1);
        assert_eq!(settings.nskip, 0);
        assert_eq!(settings.collective.timeout, Duration::from_secs(600));
        assert_eq!(settings.extraction.isovalue, Isovalue::Fixed(1500.0));
        assert!(settings.extraction.ghost.is_none());
        assert_eq!(settings.extraction.path, ExtractionPath::Patchwise);
        assert!(!settings.uniform && !settings.verbose);
    }

    #[test]
    fn test_command_line_beats_file_beats_default() {
        let toml = r#"
            datapath = "/from/file"
            field = "rho"
            vfunction = [0.0, 1.0, 2.0, 3.0]
            format = "obj"
            nprocs = 3
            nskip = 2
            do_ghost = true
            ghost_width = 2
            timeout_secs = 30
        "#;
        let settings = Settings::merge(
            &cli(&["--field", "temp", "--value", "7", "--nprocs", "5"]),
            file(toml),
        )
        .unwrap();

        assert_eq!(settings.datapath, PathBuf::from("/from/file"));
        assert_eq!(settings.extraction.field, "temp");
        assert_eq!(settings.extraction.isovalue, Isovalue::Fixed(7.0));
        assert_eq!(settings.format, OutputFormat::Obj);
        assert_eq!(settings.workers, 5);
        assert_eq!(settings.nskip, 2);
        assert_eq!(settings.collective.timeout, Duration::from_secs(30));
        let ghost = settings.extraction.ghost.unwrap();
        assert_eq!(ghost.width, 2);
        assert_eq!(ghost.policy, ReadPolicy::FinestLevel);
    }

    #[test]
    fn test_file_isovalue_ramp() {
        let settings = Settings::merge(
            &cli(&["--single-level", "--do-ghost"]),
            file("datapath = \"d\"\nfield = \"temp\"\nvfunction = [0.0, 10.0, 2.0, 20.0]\n"),
        )
        .unwrap();
        assert_relative_eq!(settings.extraction.isovalue.value_at(1.0), 15.0);
        assert_eq!(settings.extraction.ghost.unwrap().policy, ReadPolicy::SingleLevel);
    }

    #[test]
    fn test_unknown_format_reported_first() {
        // Missing datapath and field would also fail; the format wins
        let err = Settings::merge(&cli(&["--format", "vtk"]), FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("Format vtk not in [ply, obj, hdf5, xdmf]"));
    }

    #[test]
    fn test_configuration_errors() {
        let base = ["--datapath", "d", "--field", "temp"];
        let merge = |extra: &[&str]| {
            let args: Vec<&str> = base.iter().chain(extra).copied().collect();
            Settings::merge(&cli(&args), FileConfig::default())
        };

        assert!(merge(&[]).is_err());
        assert!(merge(&["--vfunction", "0", "1", "2"]).is_err());
        assert!(merge(&["--vfunction", "2", "1", "0", "3"]).is_err());
        assert!(merge(&["--value", "1", "--iso-edge", "0", "0", "0", "1", "1"]).is_err());
        assert!(merge(&["--value", "1", "--yt"]).is_err());
        assert!(merge(&["--value", "1", "--nprocs", "0"]).is_err());
        assert!(merge(&["--value", "1", "--smooth", "-1"]).is_err());
        let settings = merge(&["--value", "1", "--yt", "--format", "hdf5"]).unwrap();
        assert_eq!(settings.format, OutputFormat::Xdmf);
        assert_eq!(settings.format_name, "hdf5");

        let missing = Settings::merge(&cli(&["--value", "1"]), FileConfig::default()).unwrap_err();
        assert!(missing.to_string().contains("--datapath"));
    }

    #[test]
    fn test_region_and_gradient() {
        let settings = Settings::merge(
            &cli(&[
                "--datapath", "d", "--field", "temp", "--value", "0.5", "--iso-edge", "-1", "-1",
                "-1", "1", "1", "1", "--gradient", "z", "--smooth", "1.5",
            ]),
            FileConfig::default(),
        )
        .unwrap();
        let region = settings.extraction.region.unwrap();
        assert_eq!(region.lo, [-1.0; 3]);
        assert_eq!(region.hi, [1.0; 3]);
        assert_eq!(settings.extraction.gradient, Some(GradientComponent::Z));
        assert_eq!(settings.extraction.smooth_sigma, Some(1.5));
    }

    #[test]
    fn test_file_rejects_unknown_keys() {
        assert!(toml::from_str::<FileConfig>("isovalue = 3.0").is_err());
        let parsed = file("yt = true\ngradient = \"magnitude\"");
        assert_eq!(parsed.uniform, Some(true));
        assert_eq!(parsed.gradient, Some(GradientComponent::Magnitude));
    }

    #[test]
    fn test_load_reports_path() {
        let err = FileConfig::load(Path::new("/no/such/amrsurf.toml")).unwrap_err();
        assert!(format!("{:#}", err).contains("/no/such/amrsurf.toml"));
    }
}
