use fnv::FnvHashSet as HashSet;
use log::warn;
use regex::Regex;
use std::sync::LazyLock;

/// Bookkeeping columns: image/file/object identifiers, URLs,
/// anything tagged `Metadata`, parent/child links and table ids
const METADATA_PATTERNS: [&str; 9] = [
    "^Image_",
    "FileName",
    "Object.?Number",
    "Image.?Number",
    "^URL",
    "Metadata",
    "Parent_(Cells|Nuclei)",
    "Children",
    "TableNumber",
];

/// Measurements that are not rotation invariant or not continuous
const DISCARD_PATTERNS: [&str; 11] = [
    "Phase",
    "NumberOfNeighbors",
    "Orientation",
    "Extent",
    "BoundingBox",
    "SpatialMoment",
    "CentralMoment",
    "NormalizedMoment",
    "InertiaMoment",
    "Location",
    "[XYZ]$",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
}

static METADATA_RULES: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&METADATA_PATTERNS));
static DISCARD_RULES: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&DISCARD_PATTERNS));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnClass {
    Metadata,
    Discarded,
    Measurement,
}

pub fn is_metadata(column: &str) -> bool {
    METADATA_RULES.iter().any(|re| re.is_match(column))
}

pub fn is_discarded(column: &str) -> bool {
    DISCARD_RULES.iter().any(|re| re.is_match(column))
}

/// Classify one column by name alone. Metadata rules are checked
/// first, so the three classes never overlap.
pub fn classify_one(column: &str) -> ColumnClass {
    if is_metadata(column) {
        ColumnClass::Metadata
    } else if is_discarded(column) {
        ColumnClass::Discarded
    } else {
        ColumnClass::Measurement
    }
}

/// Disjoint partition of column names, each class in input order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnClasses {
    pub metadata: Vec<Box<str>>,
    pub discarded: Vec<Box<str>>,
    pub measurement: Vec<Box<str>>,
}

/// Partition column names into metadata, discarded and measurement
/// columns. Duplicated names are kept once.
pub fn classify<S: AsRef<str>>(columns: &[S]) -> ColumnClasses {
    classify_with(columns, None)
}

/// Like [`classify`], but `meta_cols`, if given, names the metadata
/// columns explicitly instead of the built-in rules
///
/// * `columns` - column names
/// * `meta_cols` - explicit metadata columns
pub fn classify_with<S: AsRef<str>>(columns: &[S], meta_cols: Option<&[Box<str>]>) -> ColumnClasses {
    let explicit: Option<HashSet<&str>> = meta_cols.map(|m| m.iter().map(|x| x.as_ref()).collect());

    if let Some(meta) = meta_cols {
        let present: HashSet<&str> = columns.iter().map(|x| x.as_ref()).collect();
        let absent: Vec<&str> = meta
            .iter()
            .map(|x| x.as_ref())
            .filter(|x| !present.contains(x))
            .collect();
        if !absent.is_empty() {
            warn!("metadata columns not found: {}", absent.join(", "));
        }
    }

    let mut seen: HashSet<&str> = HashSet::default();
    let mut ret = ColumnClasses::default();

    for col in columns.iter().map(|x| x.as_ref()) {
        if !seen.insert(col) {
            continue;
        }
        let class = match &explicit {
            Some(meta) if meta.contains(col) => ColumnClass::Metadata,
            Some(_) if is_discarded(col) => ColumnClass::Discarded,
            Some(_) => ColumnClass::Measurement,
            None => classify_one(col),
        };
        let name = Box::from(col);
        match class {
            ColumnClass::Metadata => ret.metadata.push(name),
            ColumnClass::Discarded => ret.discarded.push(name),
            ColumnClass::Measurement => ret.measurement.push(name),
        }
    }
    ret
}

/// Warn about every discarded feature so feature loss can be audited
pub fn report_discarded(classes: &ColumnClasses) {
    if !classes.discarded.is_empty() {
        warn!(
            "Non-continuous and rotation-variant features are not supported and will be discarded ({}):\n{}",
            classes.discarded.len(),
            classes.discarded.join("\n")
        );
    }
}

/// Column classes resolved against a header: positions of the
/// metadata and measurement fields in each record
#[derive(Debug, Clone)]
pub struct ColumnPlan {
    pub header: Vec<Box<str>>,
    pub classes: ColumnClasses,
    pub metadata: Vec<usize>,
    pub measurement: Vec<usize>,
}

impl ColumnPlan {
    /// Classify a header once; the first position of each name wins
    pub fn new(header: Vec<Box<str>>, meta_cols: Option<&[Box<str>]>) -> Self {
        let classes = classify_with(&header, meta_cols);
        let first_position = |name: &Box<str>| header.iter().position(|h| h == name);
        let metadata = classes.metadata.iter().filter_map(first_position).collect();
        let measurement = classes.measurement.iter().filter_map(first_position).collect();

        let ndup = header.len() - classes.metadata.len() - classes.discarded.len() - classes.measurement.len();
        if ndup > 0 {
            warn!("{} duplicated column names; only the first is read", ndup);
        }

        Self {
            header,
            classes,
            metadata,
            measurement,
        }
    }

    pub fn metadata_names(&self) -> &[Box<str>] {
        &self.classes.metadata
    }

    pub fn measurement_names(&self) -> &[Box<str>] {
        &self.classes.measurement
    }

    pub fn ncols(&self) -> usize {
        self.header.len()
    }
}
