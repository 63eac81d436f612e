//! Built-in server object classes.

use std::any::Any;

use crate::error::{ProcessError, Result};
use crate::interpreter::ServerObject;
use crate::stream::Value;

/// A partition-local piece of point data.
///
/// Every process holds its own piece; gathering `DataInformation` on a
/// point cloud combines the pieces of the whole group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    points: Vec<[f64; 3]>,
    cells: u64,
    name: Option<String>,
}

impl PointCloud {
    pub const CLASS_NAME: &'static str = "PointCloud";

    pub fn create() -> Box<dyn ServerObject> {
        Box::new(Self::default())
    }

    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    pub fn number_of_cells(&self) -> u64 {
        self.cells
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn add_point(&mut self, point: [f64; 3]) {
        self.points.push(point);
    }

    pub fn set_number_of_cells(&mut self, cells: u64) {
        self.cells = cells;
    }

    fn float_arg(method: &str, args: &[Value], index: usize) -> Result<f64> {
        args.get(index)
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                ProcessError::interpreter(format!(
                    "{}: argument {} must be a number",
                    method, index
                ))
            })
    }

    fn expect_args(method: &str, args: &[Value], count: usize) -> Result<()> {
        if args.len() != count {
            return Err(ProcessError::interpreter(format!(
                "{} expects {} arguments, got {}",
                method,
                count,
                args.len()
            )));
        }
        Ok(())
    }
}

impl ServerObject for PointCloud {
    fn class_name(&self) -> &'static str {
        Self::CLASS_NAME
    }

    fn invoke(&mut self, method: &str, args: &[Value]) -> Result<()> {
        match method {
            "AddPoint" => {
                Self::expect_args(method, args, 3)?;
                let point = [
                    Self::float_arg(method, args, 0)?,
                    Self::float_arg(method, args, 1)?,
                    Self::float_arg(method, args, 2)?,
                ];
                self.add_point(point);
            }
            "SetNumberOfCells" => {
                Self::expect_args(method, args, 1)?;
                let cells = args[0]
                    .as_i64()
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| {
                        ProcessError::interpreter("SetNumberOfCells expects a non-negative integer")
                    })?;
                self.cells = cells as u64;
            }
            "SetName" => {
                Self::expect_args(method, args, 1)?;
                let name = args[0]
                    .as_str()
                    .ok_or_else(|| ProcessError::interpreter("SetName expects a string"))?;
                self.name = Some(name.to_string());
            }
            "Clear" => {
                self.points.clear();
                self.cells = 0;
            }
            other => {
                return Err(ProcessError::interpreter(format!(
                    "{} has no method {}",
                    Self::CLASS_NAME,
                    other
                )))
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
