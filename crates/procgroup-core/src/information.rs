//! Mergeable information snapshots.
//!
//! An [`Information`] object captures some process-local state from a
//! target object. Kinds that are not root only are captured on every
//! process, shipped to root and merged there, so `merge` must be
//! commutative and associative for the gathered answer to be well defined.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProcessError, Result};
use crate::interpreter::ServerObject;
use crate::objects::PointCloud;

/// A snapshot of process-local state that can be merged across processes.
pub trait Information: Send + Sync + fmt::Debug {
    /// Registry name of this kind.
    fn kind(&self) -> &'static str;

    /// Root-only kinds are computed once, on root, from root's own state.
    fn root_only(&self) -> bool {
        false
    }

    fn capture_from(&mut self, object: &dyn ServerObject) -> Result<()>;

    fn encode(&self) -> Result<Vec<u8>>;

    fn decode(&mut self, data: &[u8]) -> Result<()>;

    /// Fold `other` (a snapshot of the same kind) into `self`.
    fn merge(&mut self, other: &dyn Information) -> Result<()>;

    fn to_json(&self) -> Result<serde_json::Value>;

    fn as_any(&self) -> &dyn Any;
}

/// Constructor for an information kind.
pub type InformationFactory = fn() -> Box<dyn Information>;

/// Maps kind names to constructors.
#[derive(Clone)]
pub struct InformationRegistry {
    factories: BTreeMap<String, InformationFactory>,
}

impl fmt::Debug for InformationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl Default for InformationRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(DataInformation::KIND, DataInformation::create);
        registry.register(ClassNameInformation::KIND, ClassNameInformation::create);
        registry
    }
}

impl InformationRegistry {
    /// A registry with no kinds at all.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, kind: &str, factory: InformationFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn create(&self, kind: &str) -> Option<Box<dyn Information>> {
        self.factories.get(kind).map(|factory| factory())
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

fn downcast<'a, T: 'static>(expected: &'static str, other: &'a dyn Information) -> Result<&'a T> {
    other
        .as_any()
        .downcast_ref::<T>()
        .ok_or(ProcessError::InformationMismatch {
            expected,
            actual: other.kind(),
        })
}

fn decode_json<T: for<'de> Deserialize<'de>>(kind: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| ProcessError::Decode {
        message: format!("invalid {} payload: {}", kind, e),
    })
}

/// Axis aligned bounds `[xmin, xmax, ymin, ymax, zmin, zmax]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds(pub [f64; 6]);

impl Bounds {
    pub fn from_point(p: [f64; 3]) -> Self {
        Bounds([p[0], p[0], p[1], p[1], p[2], p[2]])
    }

    pub fn include_point(&mut self, p: [f64; 3]) {
        self.union(&Bounds::from_point(p));
    }

    pub fn union(&mut self, other: &Bounds) {
        for axis in 0..3 {
            self.0[2 * axis] = self.0[2 * axis].min(other.0[2 * axis]);
            self.0[2 * axis + 1] = self.0[2 * axis + 1].max(other.0[2 * axis + 1]);
        }
    }
}

/// Sizes and extent of a piece of data, summed over the group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataInformation {
    pub number_of_points: u64,
    pub number_of_cells: u64,
    /// `None` while no contributing piece had any point.
    pub bounds: Option<Bounds>,
    /// How many partitions contributed to this snapshot.
    pub number_of_partitions: u32,
}

impl DataInformation {
    pub const KIND: &'static str = "DataInformation";

    pub fn create() -> Box<dyn Information> {
        Box::new(Self::default())
    }

    /// Merge another snapshot of the same kind.
    pub fn add(&mut self, other: &DataInformation) {
        self.number_of_points += other.number_of_points;
        self.number_of_cells += other.number_of_cells;
        self.number_of_partitions += other.number_of_partitions;
        self.bounds = match (self.bounds, other.bounds) {
            (Some(mut a), Some(b)) => {
                a.union(&b);
                Some(a)
            }
            (a, b) => a.or(b),
        };
    }
}

impl Information for DataInformation {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn capture_from(&mut self, object: &dyn ServerObject) -> Result<()> {
        let cloud = object
            .as_any()
            .downcast_ref::<PointCloud>()
            .ok_or_else(|| ProcessError::InvalidParams {
                message: format!(
                    "{} cannot be captured from a {}",
                    Self::KIND,
                    object.class_name()
                ),
            })?;

        let mut bounds: Option<Bounds> = None;
        for point in cloud.points() {
            match bounds.as_mut() {
                Some(b) => b.include_point(*point),
                None => bounds = Some(Bounds::from_point(*point)),
            }
        }

        *self = DataInformation {
            number_of_points: cloud.points().len() as u64,
            number_of_cells: cloud.number_of_cells(),
            bounds,
            number_of_partitions: 1,
        };
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(&mut self, data: &[u8]) -> Result<()> {
        *self = decode_json(Self::KIND, data)?;
        Ok(())
    }

    fn merge(&mut self, other: &dyn Information) -> Result<()> {
        let other = downcast::<DataInformation>(Self::KIND, other)?;
        self.add(other);
        Ok(())
    }

    fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Class name of the target object, computed on root only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassNameInformation {
    pub class_name: Option<String>,
}

impl ClassNameInformation {
    pub const KIND: &'static str = "ClassNameInformation";

    pub fn create() -> Box<dyn Information> {
        Box::new(Self::default())
    }
}

impl Information for ClassNameInformation {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn root_only(&self) -> bool {
        true
    }

    fn capture_from(&mut self, object: &dyn ServerObject) -> Result<()> {
        self.class_name = Some(object.class_name().to_string());
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(&mut self, data: &[u8]) -> Result<()> {
        *self = decode_json(Self::KIND, data)?;
        Ok(())
    }

    // Keeps the receiver's name; the first captured class wins.
    fn merge(&mut self, other: &dyn Information) -> Result<()> {
        let other = downcast::<ClassNameInformation>(Self::KIND, other)?;
        if self.class_name.is_none() {
            self.class_name = other.class_name.clone();
        }
        Ok(())
    }

    fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
