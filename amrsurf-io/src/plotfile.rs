//! AMReX plotfile reading
//!
//! A plotfile is a directory holding a text `Header`, and per level a
//! `Level_<l>/Cell_H` box-array header plus binary `Cell_D_*` files of FABs.
//! [`PlotfileHierarchy`] parses the headers once and seeks each FAB only when
//! its patch is asked for; only the requested component is decoded.
//! [`write_plotfile`] produces the same layout from any hierarchy.

use crate::IoError;
use amrsurf_core::{
    DomainBounds, Error, GridHierarchy, GridPatch, HierarchyBuilder, InMemoryHierarchy, IndexBox,
    LevelInfo, PatchData, Result,
};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use ndarray::{s, Array3, ShapeBuilder};
use regex::Regex;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

const BOX_PATTERN: &str =
    r"\(\s*\((-?\d+),(-?\d+),(-?\d+)\)\s*\((-?\d+),(-?\d+),(-?\d+)\)\s*\((\d+),(\d+),(\d+)\)\s*\)";

const FAB_HEADER_PATTERN: &str =
    r"^FAB\s*\(\(\d+,\s*\([^)]*\)\),\(\d+,\s*\(([^)]*)\)\)\)(.*)\s(\d+)\s*$";

static BOX_REGEX: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
static FAB_HEADER_REGEX: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();

/// One level's block of the plotfile `Header`
#[derive(Debug, Clone, PartialEq)]
pub struct LevelHeader {
    pub level: usize,
    pub time: f64,
    pub step: u64,
    /// Physical `(lo, hi)` of every grid
    pub grid_bounds: Vec<([f64; 3], [f64; 3])>,
    /// Path prefix of the level's FabArray, e.g. `Level_0/Cell`
    pub prefix: String,
}

/// Parsed plotfile `Header`
#[derive(Debug, Clone, PartialEq)]
pub struct PlotfileHeader {
    pub version: String,
    pub variables: Vec<String>,
    pub time: f64,
    pub finest_level: usize,
    pub prob_lo: [f64; 3],
    pub prob_hi: [f64; 3],
    /// Ratio between level `l` and `l + 1`
    pub ref_ratios: Vec<usize>,
    pub domain_boxes: Vec<IndexBox>,
    pub level_steps: Vec<u64>,
    pub cell_sizes: Vec<[f64; 3]>,
    pub coord_sys: i32,
    pub levels: Vec<LevelHeader>,
}

/// Location of one FAB inside a `Cell_D` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabOnDisk {
    pub file: String,
    pub offset: u64,
}

/// Parsed `Cell_H` FabArray header
#[derive(Debug, Clone, PartialEq)]
pub struct FabArrayHeader {
    pub ncomp: usize,
    pub nghost: usize,
    pub boxes: Vec<IndexBox>,
    pub fabs: Vec<FabOnDisk>,
}

/// Line cursor with file context in its errors
struct Lines<'a> {
    label: &'a str,
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
    current: usize,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str, label: &'a str) -> Self {
        Self {
            label,
            lines: text.lines().enumerate(),
            current: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        IoError::parse(format!("{}:{}", self.label, self.current), message).into()
    }

    fn next(&mut self, what: &str) -> Result<&'a str> {
        match self.lines.next() {
            Some((n, line)) => {
                self.current = n + 1;
                Ok(line.trim())
            }
            None => Err(self.error(format!("unexpected end of file, expected {}", what))),
        }
    }

    fn parse<T: std::str::FromStr>(&mut self, what: &str) -> Result<T> {
        let line = self.next(what)?;
        line.parse()
            .map_err(|_| self.error(format!("invalid {}: '{}'", what, line)))
    }

    fn values<T: std::str::FromStr>(&mut self, what: &str) -> Result<Vec<T>> {
        let line = self.next(what)?;
        line.split_whitespace()
            .map(|t| t.parse())
            .collect::<std::result::Result<Vec<T>, _>>()
            .map_err(|_| self.error(format!("invalid {}: '{}'", what, line)))
    }

    fn triple(&mut self, what: &str) -> Result<[f64; 3]> {
        let values: Vec<f64> = self.values(what)?;
        values
            .try_into()
            .map_err(|v: Vec<f64>| self.error(format!("{} needs 3 values, got {}", what, v.len())))
    }
}

fn compiled(
    cell: &'static OnceLock<std::result::Result<Regex, regex::Error>>,
    pattern: &str,
) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| Error::Algorithm(e.to_string()))
}

fn box_regex() -> Result<&'static Regex> {
    compiled(&BOX_REGEX, BOX_PATTERN)
}

fn fab_header_regex() -> Result<&'static Regex> {
    compiled(&FAB_HEADER_REGEX, FAB_HEADER_PATTERN)
}

fn parse_boxes(re: &Regex, text: &str) -> Vec<IndexBox> {
    re.captures_iter(text)
        .filter_map(|caps| {
            let v: Vec<i64> = (1..=6).filter_map(|i| caps[i].parse().ok()).collect();
            (v.len() == 6).then(|| IndexBox::new([v[0], v[1], v[2]], [v[3], v[4], v[5]]))
        })
        .collect()
}

fn format_box(b: &IndexBox) -> String {
    format!(
        "(({},{},{}) ({},{},{}) (0,0,0))",
        b.lo[0], b.lo[1], b.lo[2], b.hi[0], b.hi[1], b.hi[2]
    )
}

impl PlotfileHeader {
    /// Parse the text of a plotfile `Header`
    pub fn parse(text: &str, label: &str) -> Result<Self> {
        let boxes = box_regex()?;
        let mut lines = Lines::new(text, label);

        let version = lines.next("version")?.to_string();
        if !version.starts_with("HyperCLaw") {
            return Err(lines.error(format!("unknown plotfile version '{}'", version)));
        }
        let nvars: usize = lines.parse("variable count")?;
        let variables = (0..nvars)
            .map(|_| lines.next("variable name").map(str::to_string))
            .collect::<Result<Vec<_>>>()?;

        let dim: usize = lines.parse("dimensionality")?;
        if dim != 3 {
            return Err(Error::Unsupported(format!(
                "{}: only 3D plotfiles are supported, got {}D",
                label, dim
            )));
        }
        let time: f64 = lines.parse("time")?;
        let finest_level: usize = lines.parse("finest level")?;
        let prob_lo = lines.triple("prob_lo")?;
        let prob_hi = lines.triple("prob_hi")?;

        let ref_ratios: Vec<usize> = lines.values("refinement ratios")?;
        if ref_ratios.len() < finest_level {
            return Err(lines.error(format!(
                "{} refinement ratios for {} levels",
                ref_ratios.len(),
                finest_level + 1
            )));
        }

        let domain_line = lines.next("domain boxes")?;
        let domain_boxes = parse_boxes(boxes, domain_line);
        if domain_boxes.len() != finest_level + 1 {
            return Err(lines.error(format!(
                "{} domain boxes for {} levels",
                domain_boxes.len(),
                finest_level + 1
            )));
        }

        let level_steps: Vec<u64> = lines.values("level steps")?;
        let cell_sizes = (0..=finest_level)
            .map(|_| lines.triple("cell size"))
            .collect::<Result<Vec<_>>>()?;
        let coord_sys: i32 = lines.parse("coordinate system")?;
        let _boundary_width: i64 = lines.parse("boundary width")?;

        let mut levels = Vec::with_capacity(finest_level + 1);
        for expected in 0..=finest_level {
            let info: Vec<f64> = lines.values("level line")?;
            let [level, ngrids, level_time] = info[..] else {
                return Err(lines.error("level line needs 'level ngrids time'"));
            };
            if level as usize != expected {
                return Err(lines.error(format!("expected level {}, found {}", expected, level)));
            }
            let step: u64 = lines.parse("level step")?;
            let mut grid_bounds = Vec::with_capacity(ngrids as usize);
            for _ in 0..ngrids as usize {
                let mut lo = [0.0; 3];
                let mut hi = [0.0; 3];
                for axis in 0..3 {
                    let pair: Vec<f64> = lines.values("grid bounds")?;
                    let [a, b] = pair[..] else {
                        return Err(lines.error("grid bounds need 'lo hi'"));
                    };
                    lo[axis] = a;
                    hi[axis] = b;
                }
                grid_bounds.push((lo, hi));
            }
            let prefix = lines.next("level prefix")?.to_string();
            levels.push(LevelHeader {
                level: expected,
                time: level_time,
                step,
                grid_bounds,
                prefix,
            });
        }

        Ok(Self {
            version,
            variables,
            time,
            finest_level,
            prob_lo,
            prob_hi,
            ref_ratios,
            domain_boxes,
            level_steps,
            cell_sizes,
            coord_sys,
            levels,
        })
    }

    /// Component index of `field`
    pub fn component(&self, field: &str) -> Result<usize> {
        self.variables
            .iter()
            .position(|v| v == field)
            .ok_or_else(|| {
                IoError::UnknownField {
                    field: field.to_string(),
                    available: self.variables.clone(),
                }
                .into()
            })
    }
}

impl FabArrayHeader {
    /// Parse the text of a `Cell_H` file
    pub fn parse(text: &str, label: &str) -> Result<Self> {
        let boxes = box_regex()?;
        let mut lines = Lines::new(text, label);
        let _version: i64 = lines.parse("FabArray version")?;
        let _how: i64 = lines.parse("FabArray layout")?;
        let ncomp: usize = lines.parse("component count")?;
        let nghost: usize = lines.parse("ghost width")?;

        let array_start = lines.next("box array")?;
        let count: usize = array_start
            .trim_start_matches('(')
            .split_whitespace()
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| lines.error(format!("invalid box array start '{}'", array_start)))?;

        let mut box_list = Vec::with_capacity(count);
        while box_list.len() < count {
            let line = lines.next("box")?;
            box_list.extend(parse_boxes(boxes, line));
        }
        let _close = lines.next("box array end")?;
        let nfabs: usize = lines.parse("FAB count")?;
        if nfabs != count {
            return Err(lines.error(format!("{} FABs for {} boxes", nfabs, count)));
        }

        let mut fabs = Vec::with_capacity(nfabs);
        for _ in 0..nfabs {
            let line = lines.next("FabOnDisk")?;
            let mut tokens = line.split_whitespace();
            match (tokens.next(), tokens.next(), tokens.next()) {
                (Some("FabOnDisk:"), Some(file), Some(offset)) => fabs.push(FabOnDisk {
                    file: file.to_string(),
                    offset: offset
                        .parse()
                        .map_err(|_| lines.error(format!("invalid FAB offset '{}'", offset)))?,
                }),
                _ => return Err(lines.error(format!("invalid FabOnDisk line '{}'", line))),
            }
        }

        Ok(Self {
            ncomp,
            nghost,
            boxes: box_list,
            fabs,
        })
    }
}

/// Read and parse `<plotfile>/Header`
pub fn read_header<P: AsRef<Path>>(plotfile: P) -> Result<PlotfileHeader> {
    let path = plotfile.as_ref().join("Header");
    let text = fs::read_to_string(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::from(IoError::FileNotFound {
            path: path.display().to_string(),
        }),
        _ => Error::Io(e),
    })?;
    PlotfileHeader::parse(&text, &path.display().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

/// Element size and byte order from a FAB's real descriptor
fn real_layout(order: &str, label: &str) -> Result<(usize, Endian)> {
    let order: Vec<usize> = order
        .split_whitespace()
        .map(|t| t.parse())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| IoError::parse(label, format!("invalid byte order '{}'", order)))?;
    let size = order.len();
    if size != 4 && size != 8 {
        return Err(Error::Unsupported(format!(
            "{}: {}-byte reals are not supported",
            label, size
        )));
    }
    if order.iter().copied().eq((1..=size).rev()) {
        Ok((size, Endian::Little))
    } else if order.iter().copied().eq(1..=size) {
        Ok((size, Endian::Big))
    } else {
        Err(Error::Unsupported(format!(
            "{}: byte order {:?} is not supported",
            label, order
        )))
    }
}

fn decode(bytes: &[u8], size: usize, endian: Endian) -> Vec<f64> {
    let n = bytes.len() / size;
    match (size, endian) {
        (8, Endian::Little) => {
            let mut out = vec![0.0; n];
            LittleEndian::read_f64_into(bytes, &mut out);
            out
        }
        (8, Endian::Big) => {
            let mut out = vec![0.0; n];
            BigEndian::read_f64_into(bytes, &mut out);
            out
        }
        (_, endian) => {
            let mut out = vec![0.0f32; n];
            match endian {
                Endian::Little => LittleEndian::read_f32_into(bytes, &mut out),
                Endian::Big => BigEndian::read_f32_into(bytes, &mut out),
            }
            out.into_iter().map(f64::from).collect()
        }
    }
}

/// Read one component of the FAB at `fab`, cropped to `valid`
pub fn read_fab_component(
    level_dir: &Path,
    fab: &FabOnDisk,
    component: usize,
    valid: &IndexBox,
) -> Result<Array3<f64>> {
    let path = level_dir.join(&fab.file);
    let label = format!("{}@{}", path.display(), fab.offset);
    let mut reader = BufReader::new(File::open(&path)?);
    reader.seek(SeekFrom::Start(fab.offset))?;

    let mut header = Vec::new();
    reader.read_until(b'\n', &mut header)?;
    let header = String::from_utf8_lossy(&header);
    let caps = fab_header_regex()?
        .captures(header.trim_end())
        .ok_or_else(|| IoError::parse(&label, format!("invalid FAB header '{}'", header.trim_end())))?;

    let (size, endian) = real_layout(&caps[1], &label)?;
    let fab_box = parse_boxes(box_regex()?, &caps[2])
        .into_iter()
        .next()
        .ok_or_else(|| IoError::parse(&label, "FAB header has no box"))?;
    let ncomp: usize = caps[3]
        .parse()
        .map_err(|_| IoError::parse(&label, "invalid FAB component count"))?;
    if component >= ncomp {
        return Err(IoError::parse(&label, format!("component {} of {}", component, ncomp)).into());
    }
    if !fab_box.contains_box(valid) {
        return Err(IoError::parse(
            &label,
            format!("FAB box {:?} does not contain grid {:?}", fab_box, valid),
        )
        .into());
    }

    let cells = fab_box.num_cells();
    reader.seek_relative((component * cells * size) as i64)?;
    let mut bytes = vec![0u8; cells * size];
    reader.read_exact(&mut bytes)?;
    let values = decode(&bytes, size, endian);

    let [nx, ny, nz] = fab_box.dims();
    let data = Array3::from_shape_vec((nx, ny, nz).f(), values)
        .map_err(|e| IoError::parse(&label, e.to_string()))?;

    if fab_box == *valid {
        return Ok(data);
    }
    let o = [
        (valid.lo[0] - fab_box.lo[0]) as usize,
        (valid.lo[1] - fab_box.lo[1]) as usize,
        (valid.lo[2] - fab_box.lo[2]) as usize,
    ];
    let [vx, vy, vz] = valid.dims();
    Ok(data
        .slice(s![o[0]..o[0] + vx, o[1]..o[1] + vy, o[2]..o[2] + vz])
        .to_owned())
}

/// FAB location of one patch
#[derive(Debug, Clone)]
struct PatchFab {
    level_dir: PathBuf,
    fab: FabOnDisk,
    valid: IndexBox,
}

/// A plotfile opened for on-demand reads.
///
/// Only the headers are parsed up front. Every [`GridHierarchy::patch_data`]
/// call seeks and decodes one FAB component and hands the buffer to the
/// caller, so memory follows the patches in use rather than the snapshot.
#[derive(Debug)]
pub struct PlotfileHierarchy {
    root: PathBuf,
    header: PlotfileHeader,
    /// Levels and patches with their validity masks, no field data
    layout: InMemoryHierarchy,
    fabs: Vec<PatchFab>,
    fetches: AtomicUsize,
}

impl PlotfileHierarchy {
    /// Parse the `Header` and every level's `Cell_H`
    pub fn open<P: AsRef<Path>>(plotfile: P) -> Result<Self> {
        let root = plotfile.as_ref().to_path_buf();
        let header = read_header(&root)?;

        let base = header.domain_boxes[0];
        if base.lo != [0, 0, 0] {
            return Err(Error::Unsupported(format!(
                "Level 0 domain must start at the origin, got {:?}",
                base.lo
            )));
        }
        let domain = DomainBounds::new(header.prob_lo, header.prob_hi)?;

        let mut builder = HierarchyBuilder::new(domain, base.dims()).time(header.time);
        let mut fabs = Vec::new();
        for level in &header.levels {
            let cell_h = root.join(format!("{}_H", level.prefix));
            let text = fs::read_to_string(&cell_h)?;
            let fab_array = FabArrayHeader::parse(&text, &cell_h.display().to_string())?;
            let level_dir = cell_h.parent().unwrap_or(root.as_path()).to_path_buf();

            fabs.extend(
                fab_array
                    .boxes
                    .iter()
                    .zip(&fab_array.fabs)
                    .map(|(valid, fab)| PatchFab {
                        level_dir: level_dir.clone(),
                        fab: fab.clone(),
                        valid: *valid,
                    }),
            );
            builder = if level.level == 0 {
                builder.base_boxes(fab_array.boxes)
            } else {
                builder.add_level(header.ref_ratios[level.level - 1], fab_array.boxes)
            };
        }

        let layout = builder.build()?;
        for (level, dx) in layout.levels().iter().zip(&header.cell_sizes) {
            let mismatch = (0..3).any(|a| (level.spacing[a] - dx[a]).abs() > 1e-10 * dx[a].abs());
            if mismatch {
                log::warn!(
                    "Level {} cell size {:?} differs from header {:?}",
                    level.level,
                    level.spacing,
                    dx
                );
            }
        }

        log::info!(
            "Opened {}: {} levels, {} patches, {} fields, t = {}",
            root.display(),
            layout.levels().len(),
            layout.patches().len(),
            header.variables.len(),
            header.time
        );
        Ok(Self {
            root,
            header,
            layout,
            fabs,
            fetches: AtomicUsize::new(0),
        })
    }

    /// Parsed plotfile `Header`
    pub fn header(&self) -> &PlotfileHeader {
        &self.header
    }

    /// Plotfile directory
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Fail unless every name in `fields` is a plotfile variable
    pub fn require_fields(&self, fields: &[&str]) -> Result<()> {
        for field in fields {
            self.header.component(field)?;
        }
        Ok(())
    }

    /// Number of FAB reads served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Read `fields` of every patch into memory. Repeated names are loaded once.
    pub fn load(&self, fields: &[&str]) -> Result<InMemoryHierarchy> {
        let mut hierarchy = self.layout.clone();
        for (n, field) in fields.iter().enumerate() {
            if fields[..n].contains(field) {
                continue;
            }
            let arrays = (0..self.fabs.len())
                .map(|id| self.patch_data(id, field).map(|data| data.into_owned()))
                .collect::<Result<Vec<_>>>()?;
            hierarchy.insert_field(field, arrays)?;
        }
        Ok(hierarchy)
    }
}

impl GridHierarchy for PlotfileHierarchy {
    fn domain(&self) -> &DomainBounds {
        self.layout.domain()
    }

    fn time(&self) -> f64 {
        self.header.time
    }

    fn levels(&self) -> &[LevelInfo] {
        self.layout.levels()
    }

    fn patches(&self) -> &[GridPatch] {
        self.layout.patches()
    }

    fn field_names(&self) -> Vec<String> {
        self.header.variables.clone()
    }

    fn patch_data(&self, patch_id: usize, field: &str) -> Result<PatchData<'_>> {
        let component = self.header.component(field)?;
        let entry = self
            .fabs
            .get(patch_id)
            .ok_or_else(|| Error::InvalidData(format!("Patch {} does not exist", patch_id)))?;
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let data = read_fab_component(&entry.level_dir, &entry.fab, component, &entry.valid)?;
        Ok(PatchData::from(data))
    }
}

/// Open a plotfile for on-demand patch reads
pub fn open_plotfile<P: AsRef<Path>>(plotfile: P) -> Result<PlotfileHierarchy> {
    PlotfileHierarchy::open(plotfile)
}

/// Load one field of a plotfile as an in-memory hierarchy
pub fn read_plotfile<P: AsRef<Path>>(plotfile: P, field: &str) -> Result<InMemoryHierarchy> {
    read_plotfile_fields(plotfile, &[field])
}

/// Load several fields of a plotfile into one in-memory hierarchy.
///
/// Repeated names are loaded once.
pub fn read_plotfile_fields<P: AsRef<Path>>(
    plotfile: P,
    fields: &[&str],
) -> Result<InMemoryHierarchy> {
    let plotfile = PlotfileHierarchy::open(plotfile)?;
    plotfile.require_fields(fields)?;
    plotfile.load(fields)
}

/// Write `fields` of `hierarchy` as a plotfile with little-endian doubles
pub fn write_plotfile<H: GridHierarchy + ?Sized, P: AsRef<Path>>(
    plotfile: P,
    hierarchy: &H,
    fields: &[&str],
    step: u64,
) -> Result<()> {
    let root = plotfile.as_ref();
    fs::create_dir_all(root)?;
    let domain = hierarchy.domain();
    let levels = hierarchy.levels();

    let mut header = BufWriter::new(File::create(root.join("Header"))?);
    writeln!(header, "HyperCLaw-V1.1")?;
    writeln!(header, "{}", fields.len())?;
    for field in fields {
        writeln!(header, "{}", field)?;
    }
    writeln!(header, "3")?;
    writeln!(header, "{:?}", hierarchy.time())?;
    writeln!(header, "{}", hierarchy.max_level())?;
    let [lx, ly, lz] = domain.left_edge;
    let [rx, ry, rz] = domain.right_edge;
    writeln!(header, "{:?} {:?} {:?}", lx, ly, lz)?;
    writeln!(header, "{:?} {:?} {:?}", rx, ry, rz)?;
    let ratios: Vec<String> = levels[1..].iter().map(|l| l.ref_ratio.to_string()).collect();
    writeln!(header, "{}", ratios.join(" "))?;
    let domain_boxes: Vec<String> = levels.iter().map(|l| format_box(&l.domain_box)).collect();
    writeln!(header, "{}", domain_boxes.join(" "))?;
    let steps: Vec<String> = levels.iter().map(|_| step.to_string()).collect();
    writeln!(header, "{}", steps.join(" "))?;
    for level in levels {
        let [dx, dy, dz] = level.spacing;
        writeln!(header, "{:?} {:?} {:?}", dx, dy, dz)?;
    }
    writeln!(header, "0")?;
    writeln!(header, "0")?;

    for level in levels {
        let patches: Vec<_> = hierarchy
            .patches()
            .iter()
            .filter(|p| p.level == level.level)
            .collect();
        writeln!(
            header,
            "{} {} {:?}",
            level.level,
            patches.len(),
            hierarchy.time()
        )?;
        writeln!(header, "{}", step)?;
        for patch in &patches {
            let lo = patch.left_edge(domain);
            let hi = patch.right_edge(domain);
            for axis in 0..3 {
                writeln!(header, "{:?} {:?}", lo[axis], hi[axis])?;
            }
        }
        writeln!(header, "Level_{}/Cell", level.level)?;

        let level_dir = root.join(format!("Level_{}", level.level));
        fs::create_dir_all(&level_dir)?;
        let data_name = "Cell_D_00000";
        let mut data = BufWriter::new(File::create(level_dir.join(data_name))?);
        let mut offsets = Vec::with_capacity(patches.len());
        let mut offset = 0u64;
        for patch in &patches {
            offsets.push(offset);
            let fab_header = format!(
                "FAB ((8, (64 11 52 0 1 12 0 1023)),(8, (8 7 6 5 4 3 2 1))){} {}\n",
                format_box(&patch.index_box()),
                fields.len()
            );
            data.write_all(fab_header.as_bytes())?;
            offset += fab_header.len() as u64;
            for field in fields {
                let values = hierarchy.patch_data(patch.id, field)?;
                // Fortran order: x varies fastest
                for v in values.t().iter() {
                    data.write_f64::<LittleEndian>(*v)?;
                }
                offset += 8 * values.len() as u64;
            }
        }
        data.flush()?;

        let mut cell_h = BufWriter::new(File::create(level_dir.join("Cell_H"))?);
        writeln!(cell_h, "1")?;
        writeln!(cell_h, "0")?;
        writeln!(cell_h, "{}", fields.len())?;
        writeln!(cell_h, "0")?;
        writeln!(cell_h, "({} 0", patches.len())?;
        for patch in &patches {
            writeln!(cell_h, "{}", format_box(&patch.index_box()))?;
        }
        writeln!(cell_h, ")")?;
        writeln!(cell_h, "{}", patches.len())?;
        for offset in offsets {
            writeln!(cell_h, "FabOnDisk: {} {}", data_name, offset)?;
        }
        cell_h.flush()?;
    }
    header.flush()?;

    log::debug!("Wrote plotfile {}", root.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use amrsurf_core::{HierarchyBuilder, Point3d};
    use approx::assert_relative_eq;

    fn two_level() -> InMemoryHierarchy {
        let domain = DomainBounds::new([-1.0, 0.0, 0.0], [1.0, 1.0, 1.0]).unwrap();
        let mut h = HierarchyBuilder::new(domain, [8, 4, 4])
            .time(0.75)
            .base_boxes(vec![
                IndexBox::new([0, 0, 0], [3, 3, 3]),
                IndexBox::new([4, 0, 0], [7, 3, 3]),
            ])
            .add_level(2, vec![IndexBox::new([4, 2, 2], [9, 5, 5])])
            .build()
            .unwrap();
        h.fill_field("temp", |p: &Point3d| 300.0 + p.x + 10.0 * p.y + 100.0 * p.z);
        h.fill_field("rho", |p: &Point3d| p.x * p.y);
        h
    }

    #[test]
    fn test_round_trip_selected_field() {
        let dir = tempfile::tempdir().unwrap();
        let plt = dir.path().join("plt00010");
        let written = two_level();
        write_plotfile(&plt, &written, &["rho", "temp"], 10).unwrap();

        let header = read_header(&plt).unwrap();
        assert_eq!(header.variables, vec!["rho", "temp"]);
        assert_eq!(header.finest_level, 1);
        assert_eq!(header.ref_ratios, vec![2]);
        assert_eq!(header.levels[1].grid_bounds.len(), 1);
        assert_relative_eq!(header.time, 0.75);

        let loaded = read_plotfile(&plt, "temp").unwrap();
        assert_eq!(loaded.field_names(), vec!["temp"]);
        assert_eq!(loaded.patches().len(), 3);
        assert_relative_eq!(loaded.time(), 0.75);
        for patch in loaded.patches() {
            assert_eq!(patch.mask, written.patches()[patch.id].mask);
            let a = loaded.patch_data(patch.id, "temp").unwrap();
            let b = written.patch_data(patch.id, "temp").unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_several_fields_share_one_hierarchy() {
        let dir = tempfile::tempdir().unwrap();
        let plt = dir.path().join("plt00020");
        let written = two_level();
        write_plotfile(&plt, &written, &["rho", "temp"], 20).unwrap();

        let loaded = read_plotfile_fields(&plt, &["temp", "rho", "temp"]).unwrap();
        assert_eq!(loaded.field_names(), vec!["rho", "temp"]);
        for patch in loaded.patches() {
            assert_eq!(
                loaded.patch_data(patch.id, "rho").unwrap(),
                written.patch_data(patch.id, "rho").unwrap()
            );
        }
    }

    #[test]
    fn test_open_reads_patches_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let plt = dir.path().join("plt00030");
        let written = two_level();
        write_plotfile(&plt, &written, &["rho", "temp"], 30).unwrap();

        let lazy = open_plotfile(&plt).unwrap();
        assert_eq!(lazy.fetch_count(), 0);
        assert_eq!(lazy.patches().len(), 3);
        assert_eq!(lazy.field_names(), vec!["rho", "temp"]);
        assert_relative_eq!(lazy.time(), 0.75);
        assert_eq!(lazy.patches()[0].mask, written.patches()[0].mask);

        let fine = lazy.patch_data(2, "temp").unwrap();
        assert_eq!(fine, written.patch_data(2, "temp").unwrap());
        assert_eq!(lazy.fetch_count(), 1);
        drop(fine);
        // Nothing is cached: a second read goes back to disk
        lazy.patch_data(2, "temp").unwrap();
        assert_eq!(lazy.fetch_count(), 2);

        assert!(lazy.require_fields(&["temp", "pressure"]).is_err());
        assert!(lazy.patch_data(3, "temp").is_err());

        let loaded = lazy.load(&["rho", "rho"]).unwrap();
        assert_eq!(loaded.field_names(), vec!["rho"]);
        assert_eq!(lazy.fetch_count(), 5);
    }

    #[test]
    fn test_patterns_compile_once() {
        let first = fab_header_regex().unwrap();
        assert!(std::ptr::eq(first, fab_header_regex().unwrap()));
        assert!(std::ptr::eq(box_regex().unwrap(), box_regex().unwrap()));
        assert!(first.is_match("FAB ((8, (64 11 52 0 1 12 0 1023)),(8, (8 7 6 5 4 3 2 1)))((0,0,0) (3,3,3) (0,0,0)) 1"));
    }

    #[test]
    fn test_unknown_field_lists_available() {
        let dir = tempfile::tempdir().unwrap();
        let plt = dir.path().join("plt00000");
        write_plotfile(&plt, &two_level(), &["rho", "temp"], 0).unwrap();

        let err = read_plotfile(&plt, "pressure").unwrap_err().to_string();
        assert!(err.contains("pressure"));
        assert!(err.contains("temp"));
    }

    #[test]
    fn test_big_endian_single_precision_with_ghosts() {
        let dir = tempfile::tempdir().unwrap();
        let level_dir = dir.path();
        // One ghost cell around a 2x1x1 grid, two components
        let fab_box = IndexBox::new([-1, -1, -1], [2, 1, 1]);
        let mut bytes = b"FAB ((4, (32 8 23 0 1 9 0 127)),(4, (1 2 3 4)))((-1,-1,-1) (2,1,1) (0,0,0)) 2\n".to_vec();
        let cells = fab_box.num_cells();
        for comp in 0..2 {
            for n in 0..cells {
                bytes.write_f32::<BigEndian>((comp * 1000 + n) as f32).unwrap();
            }
        }
        fs::write(level_dir.join("Cell_D_00003"), &bytes).unwrap();

        let fab = FabOnDisk {
            file: "Cell_D_00003".to_string(),
            offset: 0,
        };
        let valid = IndexBox::new([0, 0, 0], [1, 0, 0]);
        let data = read_fab_component(level_dir, &fab, 1, &valid).unwrap();
        assert_eq!(data.shape(), &[2, 1, 1]);
        // Interior cell (0,0,0) sits at (1,1,1) of the 4x3x3 FAB
        assert_eq!(data[[0, 0, 0]], (1000 + 1 + 4 + 12) as f64);
        assert_eq!(data[[1, 0, 0]], (1000 + 2 + 4 + 12) as f64);
    }

    #[test]
    fn test_header_rejects_2d() {
        let text = "HyperCLaw-V1.1\n1\ndensity\n2\n0.0\n0\n0 0\n1 1\n\n((0,0) (7,7) (0,0))\n";
        let result = PlotfileHeader::parse(text, "Header");
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_cell_h_parse() {
        let text = "1\n0\n3\n1\n(2 0\n((0,0,0) (7,7,7) (0,0,0))\n((8,0,0) (15,7,7) (0,0,0))\n)\n2\nFabOnDisk: Cell_D_00000 0\nFabOnDisk: Cell_D_00001 4242\n";
        let header = FabArrayHeader::parse(text, "Cell_H").unwrap();
        assert_eq!(header.ncomp, 3);
        assert_eq!(header.nghost, 1);
        assert_eq!(header.boxes[1], IndexBox::new([8, 0, 0], [15, 7, 7]));
        assert_eq!(header.fabs[1].offset, 4242);
    }
}
