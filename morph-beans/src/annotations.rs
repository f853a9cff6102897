use log::warn;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Per-group reductions: one row per distinct key tuple, one column
/// per feature
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedResult {
    /// metadata columns that defined the groups
    pub group_keys: Vec<Box<str>>,
    /// key tuple of each row, aligned with `group_keys`
    pub groups: Vec<Vec<Box<str>>>,
    pub features: Vec<Box<str>>,
    /// `groups x features`
    pub values: Array2<f64>,
}

impl GroupedResult {
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Row of a key tuple
    pub fn position<S: AsRef<str>>(&self, group: &[S]) -> Option<usize> {
        self.groups.iter().position(|g| {
            g.len() == group.len() && g.iter().zip(group).all(|(a, b)| a.as_ref() == b.as_ref())
        })
    }
}

/// Cache key of a grouped operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupedOpKey {
    pub keys: Vec<Box<str>>,
    pub statistic: Box<str>,
    pub layer: Option<Box<str>>,
}

impl GroupedOpKey {
    pub fn new<S: AsRef<str>>(keys: &[S], statistic: &str, layer: Option<&str>) -> Self {
        Self {
            keys: keys.iter().map(|x| Box::from(x.as_ref())).collect(),
            statistic: statistic.into(),
            layer: layer.map(Box::from),
        }
    }
}

/// Principal components stored next to the `X_pca` layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PcaResult {
    pub variance: Array1<f64>,
    pub variance_ratio: Array1<f64>,
    /// `components x features`
    pub components: Array2<f64>,
}

/// Output of a trajectory runtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrajectoryFit {
    /// observation metadata column with cluster labels
    pub cluster_key: Box<str>,
    /// `points x dims` curve coordinates, one block per lineage
    pub curves: Array2<f64>,
    /// `observations x lineages`
    pub pseudotime: Array2<f64>,
    /// `observations x lineages` soft assignments
    pub weights: Array2<f64>,
}

/// Derived artifacts attached to one matrix
#[derive(Debug, Clone, Default)]
pub struct Annotations {
    pub pca: Option<PcaResult>,
    pub trajectory: Option<TrajectoryFit>,
    /// anything else, e.g. test results
    pub extra: BTreeMap<Box<str>, serde_json::Value>,
    grouped_ops: HashMap<GroupedOpKey, GroupedResult>,
}

impl Annotations {
    pub fn cached(&self, key: &GroupedOpKey) -> Option<&GroupedResult> {
        self.grouped_ops.get(key)
    }

    pub fn store_cached(&mut self, key: GroupedOpKey, result: GroupedResult) {
        self.grouped_ops.insert(key, result);
    }

    pub fn num_cached(&self) -> usize {
        self.grouped_ops.len()
    }

    pub fn clear_cache(&mut self) {
        self.grouped_ops.clear();
    }

    /// The persistent part as one json document (the grouped
    /// operation cache is process-local and not included)
    pub fn to_json(&self) -> anyhow::Result<serde_json::Value> {
        let mut ret = serde_json::Map::new();
        if let Some(pca) = &self.pca {
            ret.insert("pca".into(), serde_json::to_value(pca)?);
        }
        if let Some(traj) = &self.trajectory {
            ret.insert("trajectory".into(), serde_json::to_value(traj)?);
        }
        for (k, v) in self.extra.iter() {
            ret.insert(k.to_string(), v.clone());
        }
        Ok(serde_json::Value::Object(ret))
    }

    pub fn from_json(value: serde_json::Value) -> anyhow::Result<Self> {
        let mut ret = Self::default();
        if let serde_json::Value::Object(map) = value {
            for (k, v) in map {
                match k.as_str() {
                    "pca" => match serde_json::from_value(v) {
                        Ok(pca) => ret.pca = Some(pca),
                        Err(e) => warn!("ignoring stored pca: {}", e),
                    },
                    "trajectory" => match serde_json::from_value(v) {
                        Ok(traj) => ret.trajectory = Some(traj),
                        Err(e) => warn!("ignoring stored trajectory: {}", e),
                    },
                    _ => {
                        ret.extra.insert(k.into_boxed_str(), v);
                    }
                }
            }
        }
        Ok(ret)
    }
}
