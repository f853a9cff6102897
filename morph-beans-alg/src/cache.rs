use crate::grouped_op::{grouped_op, Reducer};

use morph_beans::annotated::AnnotatedMatrix;
use morph_beans::annotations::{GroupedOpKey, GroupedResult};

use log::debug;

/// Result of [`get_grouped_op`]: the group-indexed table, or the same
/// values as a new annotated matrix with one observation per group
#[derive(Debug)]
pub enum GroupedOutput {
    Table(GroupedResult),
    Matrix(AnnotatedMatrix),
}

impl GroupedOutput {
    pub fn into_table(self) -> anyhow::Result<GroupedResult> {
        match self {
            GroupedOutput::Table(t) => Ok(t),
            GroupedOutput::Matrix(m) => {
                let keys: Vec<Box<str>> = m.obs().column_names().to_vec();
                GroupedResult::from_annotated(&m, &keys)
            }
        }
    }

    pub fn into_matrix(self) -> anyhow::Result<AnnotatedMatrix> {
        match self {
            GroupedOutput::Table(t) => t.to_annotated(),
            GroupedOutput::Matrix(m) => Ok(m),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GroupedOpArgs<'a> {
    /// convert the table into an annotated matrix
    pub as_matrix: bool,
    /// alternate view to summarize instead of `X`
    pub layer: Option<&'a str>,
    /// read from and write to the matrix's cache
    pub store: bool,
    pub progress: bool,
}

impl Default for GroupedOpArgs<'_> {
    fn default() -> Self {
        Self {
            as_matrix: false,
            layer: None,
            store: true,
            progress: false,
        }
    }
}

/// Lookups served from the cache versus computed by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub computed: usize,
}

/// Grouped summary of `matrix`, memoized in its annotations under
/// `(group_keys, reducer name, layer)`.
///
/// With `store` set, a cached table is returned without running the
/// engine, and a fresh one is cached before returning. Without it,
/// the cache is neither read nor written.
pub fn get_grouped_op<R, S>(
    matrix: &mut AnnotatedMatrix,
    group_keys: &[S],
    reducer: &R,
    args: &GroupedOpArgs,
) -> anyhow::Result<GroupedOutput>
where
    R: Reducer + ?Sized,
    S: AsRef<str>,
{
    let mut stats = CacheStats::default();
    get_grouped_op_counted(matrix, group_keys, reducer, args, &mut stats)
}

/// [`get_grouped_op`] that also counts hits and computations
pub fn get_grouped_op_counted<R, S>(
    matrix: &mut AnnotatedMatrix,
    group_keys: &[S],
    reducer: &R,
    args: &GroupedOpArgs,
    stats: &mut CacheStats,
) -> anyhow::Result<GroupedOutput>
where
    R: Reducer + ?Sized,
    S: AsRef<str>,
{
    let key = GroupedOpKey::new(group_keys, reducer.name(), args.layer);

    let cached = if args.store {
        matrix.uns().cached(&key).cloned()
    } else {
        None
    };

    let table = match cached {
        Some(t) => {
            debug!("grouped `{}` over {:?} from cache", reducer.name(), key.keys);
            stats.hits += 1;
            t
        }
        None => {
            let t = grouped_op(matrix, group_keys, reducer, args.layer, args.progress)?;
            stats.computed += 1;
            if args.store {
                matrix.uns_mut().store_cached(key, t.clone());
            }
            t
        }
    };

    if args.as_matrix {
        Ok(GroupedOutput::Matrix(table.to_annotated()?))
    } else {
        Ok(GroupedOutput::Table(table))
    }
}
