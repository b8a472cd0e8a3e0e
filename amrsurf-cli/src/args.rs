//! Command-line arguments

use amrsurf_algorithms::GradientComponent;
use clap::Parser;
use std::path::PathBuf;

/// Every option is optional here so that `--ifile` can supply it; required
/// values are checked once the file has been merged in.
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "amrsurf",
    version,
    about = "Extract isosurfaces from a series of AMReX plotfiles"
)]
pub struct Cli {
    /// Directory holding the `plt*` snapshot directories
    #[arg(long, value_name = "DIR", help_heading = "Input")]
    pub datapath: Option<PathBuf>,

    /// Snapshot name patterns (`*` and `?` wildcards), each thinned separately
    #[arg(long, num_args = 1.., value_name = "PATTERN", help_heading = "Input")]
    pub pname: Option<Vec<String>>,

    /// Keep every (nskip + 1)-th snapshot
    #[arg(long, value_name = "N", help_heading = "Input")]
    pub nskip: Option<usize>,

    /// TOML file providing values for options not given on the command line
    #[arg(long, value_name = "TOML", help_heading = "Input")]
    pub ifile: Option<PathBuf>,

    /// Field the surface is a level set of
    #[arg(long, help_heading = "Surface")]
    pub field: Option<String>,

    /// Field sampled onto the surface [default: --field]
    #[arg(long, help_heading = "Surface")]
    pub sample_field: Option<String>,

    /// Fixed isovalue
    #[arg(
        long,
        allow_negative_numbers = true,
        conflicts_with = "vfunction",
        help_heading = "Surface"
    )]
    pub value: Option<f64>,

    /// Isovalue ramp: start time, start value, end time, end value
    #[arg(
        long,
        num_args = 1..,
        allow_negative_numbers = true,
        value_name = "T0 V0 T1 V1",
        help_heading = "Surface"
    )]
    pub vfunction: Option<Vec<f64>>,

    /// Extract a gradient component of the field instead of the field
    #[arg(long, value_name = "x|y|z|magnitude", help_heading = "Surface")]
    pub gradient: Option<GradientComponent>,

    /// Gaussian smoothing width in cells
    #[arg(
        long,
        allow_negative_numbers = true,
        value_name = "SIGMA",
        help_heading = "Surface"
    )]
    pub smooth: Option<f64>,

    /// Only extract in the box x_lo y_lo z_lo x_hi y_hi z_hi
    #[arg(
        long,
        num_args = 1..,
        allow_negative_numbers = true,
        value_name = "COORD",
        help_heading = "Surface"
    )]
    pub iso_edge: Option<Vec<f64>>,

    /// Pad patches with ghost cells before triangulating
    #[arg(long, help_heading = "Extraction")]
    pub do_ghost: bool,

    /// Ghost cells per side when --do-ghost is set [default: 1]
    #[arg(long, value_name = "CELLS", help_heading = "Extraction")]
    pub ghost_width: Option<usize>,

    /// Fill ghost cells from the patch's own level and coarser levels only
    #[arg(long, help_heading = "Extraction")]
    pub single_level: bool,

    /// Triangulate one covering grid of the domain instead of patch by patch
    #[arg(long = "yt", visible_alias = "uniform", help_heading = "Extraction")]
    pub uniform: bool,

    /// Level of the covering grid for --yt [default: finest]
    #[arg(long, value_name = "LEVEL", help_heading = "Extraction")]
    pub uniform_level: Option<usize>,

    /// Output directory [default: <datapath>/../outdata/isosurfaces]
    #[arg(long, value_name = "DIR", help_heading = "Output")]
    pub outpath: Option<PathBuf>,

    /// Output format: ply, obj, hdf5 or xdmf [default: ply]
    #[arg(long, help_heading = "Output")]
    pub format: Option<String>,

    /// Worker ranks per snapshot [default: 1]
    #[arg(long, value_name = "N", help_heading = "Execution")]
    pub nprocs: Option<usize>,

    /// Threads in the shared pool [default: one per core]
    #[arg(long, value_name = "N", help_heading = "Execution")]
    pub nthreads: Option<usize>,

    /// Upper bound on any wait between ranks [default: 600]
    #[arg(long, value_name = "SECS", help_heading = "Execution")]
    pub timeout_secs: Option<u64>,

    /// Log at debug level
    #[arg(short, long, help_heading = "Execution")]
    pub verbose: bool,
}
