//! Command stream codec.
//!
//! A [`CommandStream`] is an ordered list of invocation records together with
//! the flat byte buffer that carries them between processes. Every record
//! is appended to the buffer as soon as it is pushed, so the buffer is a
//! valid encoding of the records at every point.
//!
//! ```text
//! [u32 BE: len][JSON Command][u32 BE: len][JSON Command]...
//! ```

use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::{ProcessError, Result};

/// Identifier of an object living in every process's interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Argument of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Id(ObjectId),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// One invocation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// Instantiate `class` under `id`.
    New { class: String, id: ObjectId },
    /// Call `method` on the object `id`.
    Invoke {
        id: ObjectId,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Drop the object `id`.
    Delete { id: ObjectId },
}

impl Command {
    fn validate(&self) -> Result<()> {
        if let Command::Invoke { method, args, .. } = self {
            if let Some(bad) = args
                .iter()
                .find(|a| matches!(a, Value::Float(v) if !v.is_finite()))
            {
                return Err(ProcessError::InvalidParams {
                    message: format!("non-finite argument {:?} passed to {}", bad, method),
                });
            }
        }
        Ok(())
    }
}

/// An appendable command stream and its wire buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandStream {
    commands: Vec<Command>,
    buffer: Vec<u8>,
}

impl CommandStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, encoding it into the buffer.
    pub fn push(&mut self, command: Command) -> Result<()> {
        command.validate()?;
        let encoded = serde_json::to_vec(&command)?;
        let len = u32::try_from(encoded.len()).map_err(|_| ProcessError::FrameTooLarge {
            size: encoded.len(),
            max: u32::MAX as usize,
        })?;

        self.buffer.reserve(4 + encoded.len());
        self.buffer.put_u32(len);
        self.buffer.put_slice(&encoded);
        self.commands.push(command);
        Ok(())
    }

    pub fn new_object(&mut self, class: impl Into<String>, id: ObjectId) -> Result<()> {
        self.push(Command::New {
            class: class.into(),
            id,
        })
    }

    pub fn invoke(
        &mut self,
        id: ObjectId,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<()> {
        self.push(Command::Invoke {
            id,
            method: method.into(),
            args,
        })
    }

    pub fn delete(&mut self, id: ObjectId) -> Result<()> {
        self.push(Command::Delete { id })
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Raw buffer to hand to a transport.
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Clear records and buffer together.
    pub fn reset(&mut self) {
        self.commands.clear();
        self.buffer.clear();
    }

    /// Rebuild a stream from a received buffer.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let commands = Self::decode(data)?;
        Ok(Self {
            commands,
            buffer: data.to_vec(),
        })
    }

    /// Decode the records held in `data`.
    pub fn decode(mut data: &[u8]) -> Result<Vec<Command>> {
        let mut commands = Vec::new();

        while data.has_remaining() {
            if data.remaining() < 4 {
                return Err(ProcessError::Decode {
                    message: format!("truncated record header ({} bytes)", data.remaining()),
                });
            }
            let len = data.get_u32() as usize;
            if data.remaining() < len {
                return Err(ProcessError::Decode {
                    message: format!(
                        "record claims {} bytes but only {} remain",
                        len,
                        data.remaining()
                    ),
                });
            }

            let command: Command =
                serde_json::from_slice(&data[..len]).map_err(|e| ProcessError::Decode {
                    message: format!("invalid command record: {}", e),
                })?;
            commands.push(command);
            data.advance(len);
        }

        Ok(commands)
    }
}

impl Extend<Command> for CommandStream {
    /// Records that fail validation are skipped with a warning.
    fn extend<T: IntoIterator<Item = Command>>(&mut self, iter: T) {
        for command in iter {
            if let Err(e) = self.push(command) {
                tracing::warn!("Dropping command record: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stream() -> CommandStream {
        let mut stream = CommandStream::new();
        stream.new_object("PointCloud", ObjectId(1)).unwrap();
        stream
            .invoke(
                ObjectId(1),
                "AddPoint",
                vec![Value::Float(1.0), Value::Float(2.0), Value::Int(3)],
            )
            .unwrap();
        stream.delete(ObjectId(1)).unwrap();
        stream
    }

    #[test]
    fn test_buffer_tracks_records() {
        let stream = sample_stream();
        assert_eq!(stream.len(), 3);

        let decoded = CommandStream::decode(stream.data()).unwrap();
        assert_eq!(decoded, stream.commands());
    }

    #[test]
    fn test_from_bytes_preserves_buffer() {
        let stream = sample_stream();
        let copy = CommandStream::from_bytes(stream.data()).unwrap();
        assert_eq!(copy, stream);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut stream = sample_stream();
        stream.reset();
        assert!(stream.is_empty());
        assert!(stream.data().is_empty());

        // Reset on an empty stream is a no-op
        stream.reset();
        assert_eq!(stream, CommandStream::new());
    }

    #[test]
    fn test_empty_buffer_decodes_to_nothing() {
        assert!(CommandStream::decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_buffer_is_rejected() {
        let stream = sample_stream();
        let data = stream.data();

        let result = CommandStream::decode(&data[..data.len() - 1]);
        assert!(matches!(result, Err(ProcessError::Decode { .. })));

        let result = CommandStream::decode(&data[..2]);
        assert!(matches!(result, Err(ProcessError::Decode { .. })));
    }

    #[test]
    fn test_non_finite_argument_is_rejected() {
        let mut stream = CommandStream::new();
        let result = stream.invoke(ObjectId(1), "AddPoint", vec![Value::Float(f64::NAN)]);
        assert!(result.is_err());
        assert!(stream.is_empty());
        assert!(stream.data().is_empty());
    }

    #[test]
    fn test_command_json_shape() {
        let json = serde_json::to_value(Command::Invoke {
            id: ObjectId(4),
            method: "SetName".into(),
            args: vec![Value::Str("mesh".into())],
        })
        .unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "op": "invoke",
                "id": 4,
                "method": "SetName",
                "args": [{"type": "str", "value": "mesh"}]
            })
        );
    }
}
