//! Decoding of saved input slots: the `[tag, payload]` arrays of a workspace tree.

use thiserror::Error;

use crate::value::Value;

/// Decode failure for one saved input. Parsing keeps it inside the slot;
/// it surfaces when the owning node first reads the input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("block <{node_id}> input <{key}>: unknown input tag {tag}")]
    UnknownTag { node_id: String, key: String, tag: i64 },
    #[error("block <{node_id}> input <{key}>: unknown primitive kind {kind}")]
    UnknownPrimitive { node_id: String, key: String, kind: i64 },
    #[error("block <{node_id}> input <{key}>: {reason}")]
    Malformed { node_id: String, key: String, reason: String },
}

/// Primitive kinds the editor can save inside an input slot. The indices are
/// part of the save format; anything outside them is a decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Undefined = 0,
    SameBlockShadow = 1,
    BlockNoShadow = 2,
    DiffBlockShadow = 3,
    MathNumber = 4,
    PositiveNumber = 5,
    WholeNumber = 6,
    IntegerNumber = 7,
    Checkbox = 8,
    Color = 9,
    Text = 10,
    Broadcast = 11,
    Variable = 12,
    List = 13,
    Icon = 14,
}

impl PrimitiveKind {
    pub fn from_index(index: i64) -> Option<PrimitiveKind> {
        Some(match index {
            0 => PrimitiveKind::Undefined,
            1 => PrimitiveKind::SameBlockShadow,
            2 => PrimitiveKind::BlockNoShadow,
            3 => PrimitiveKind::DiffBlockShadow,
            4 => PrimitiveKind::MathNumber,
            5 => PrimitiveKind::PositiveNumber,
            6 => PrimitiveKind::WholeNumber,
            7 => PrimitiveKind::IntegerNumber,
            8 => PrimitiveKind::Checkbox,
            9 => PrimitiveKind::Color,
            10 => PrimitiveKind::Text,
            11 => PrimitiveKind::Broadcast,
            12 => PrimitiveKind::Variable,
            13 => PrimitiveKind::List,
            14 => PrimitiveKind::Icon,
            _ => return None,
        })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            PrimitiveKind::MathNumber
                | PrimitiveKind::PositiveNumber
                | PrimitiveKind::WholeNumber
                | PrimitiveKind::IntegerNumber
        )
    }
}

/// One decoded input slot.
#[derive(Debug, Clone, PartialEq)]
pub enum InputSlot {
    /// Saved with no content.
    Empty,
    /// A literal resolved once at parse time.
    Literal(Value),
    /// Reference to another block, evaluated on demand.
    BlockRef(String),
    /// Broadcast wiring: display name plus the id signals are keyed by.
    Broadcast { name: String, id: String },
    /// A variable read through the store at access time.
    VariableRef(String),
    /// A list read through the store at access time.
    ListRef(String),
    /// Could not be decoded; reading it reports the carried error.
    Invalid(DecodeError),
}

impl InputSlot {
    /// False only for slots saved without content.
    pub fn is_present(&self) -> bool {
        !matches!(self, InputSlot::Empty)
    }
}

/// Decode one entry of a node's saved `inputs` map.
pub fn decode_input(node_id: &str, key: &str, raw: &serde_json::Value) -> Result<InputSlot, DecodeError> {
    let parts = raw
        .as_array()
        .ok_or_else(|| malformed(node_id, key, "input is not an array"))?;
    let tag = parts
        .first()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| malformed(node_id, key, "input has no integer tag"))?;
    let payload = parts.get(1);

    match tag {
        // Direct literal, stored as text and coerced by the reader.
        5 => match payload {
            Some(serde_json::Value::String(text)) => Ok(InputSlot::Literal(Value::Text(text.clone()))),
            _ => Err(malformed(node_id, key, "tag 5 payload is not a string")),
        },
        // Bare reference to another block.
        2 => match payload {
            Some(serde_json::Value::String(id)) => Ok(InputSlot::BlockRef(id.clone())),
            _ => Err(malformed(node_id, key, "tag 2 payload is not a block id")),
        },
        // Obscured shadow: either a named primitive or a block reference.
        3 => match payload {
            Some(serde_json::Value::Array(primitive)) => decode_primitive(node_id, key, primitive),
            Some(serde_json::Value::String(id)) => Ok(InputSlot::BlockRef(id.clone())),
            _ => Err(malformed(node_id, key, "tag 3 payload is neither primitive nor block id")),
        },
        // Plain shadow: primitive, a shadow block id (menus), or nothing.
        1 => match payload {
            Some(serde_json::Value::Array(primitive)) => decode_primitive(node_id, key, primitive),
            Some(serde_json::Value::String(id)) => Ok(InputSlot::BlockRef(id.clone())),
            None | Some(serde_json::Value::Null) => Ok(InputSlot::Empty),
            _ => Err(malformed(node_id, key, "tag 1 payload is not usable")),
        },
        other => Err(DecodeError::UnknownTag {
            node_id: node_id.to_string(),
            key: key.to_string(),
            tag: other,
        }),
    }
}

fn decode_primitive(node_id: &str, key: &str, parts: &[serde_json::Value]) -> Result<InputSlot, DecodeError> {
    let index = parts
        .first()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| malformed(node_id, key, "primitive has no kind index"))?;
    let kind = PrimitiveKind::from_index(index).ok_or(DecodeError::UnknownPrimitive {
        node_id: node_id.to_string(),
        key: key.to_string(),
        kind: index,
    })?;

    match kind {
        PrimitiveKind::Checkbox => {
            let checked = parts
                .get(1)
                .map(|v| Value::from(v.clone()))
                .and_then(|v| v.as_bool())
                .ok_or_else(|| malformed(node_id, key, "checkbox payload is not a boolean"))?;
            Ok(InputSlot::Literal(Value::Bool(checked)))
        }
        PrimitiveKind::Broadcast => {
            let name = string_at(parts, 1)
                .ok_or_else(|| malformed(node_id, key, "broadcast has no name"))?;
            let id = string_at(parts, 2)
                .ok_or_else(|| malformed(node_id, key, "broadcast has no id"))?;
            Ok(InputSlot::Broadcast { name, id })
        }
        PrimitiveKind::Variable => {
            let id = string_at(parts, 2)
                .or_else(|| string_at(parts, 1))
                .ok_or_else(|| malformed(node_id, key, "variable has no id"))?;
            Ok(InputSlot::VariableRef(id))
        }
        PrimitiveKind::List => {
            let id = string_at(parts, 2)
                .or_else(|| string_at(parts, 1))
                .ok_or_else(|| malformed(node_id, key, "list has no id"))?;
            Ok(InputSlot::ListRef(id))
        }
        _ => {
            let raw = parts
                .get(1)
                .ok_or_else(|| malformed(node_id, key, "primitive has no payload"))?;
            Ok(InputSlot::Literal(scalar_literal(kind, raw)))
        }
    }
}

/// Scalar payloads keep their saved shape; the numeric kinds parse saved
/// text into numbers and fall back to the text when they cannot.
fn scalar_literal(kind: PrimitiveKind, raw: &serde_json::Value) -> Value {
    match raw {
        serde_json::Value::String(text) if kind.is_numeric() => text
            .trim()
            .parse::<f64>()
            .map(Value::Number)
            .unwrap_or_else(|_| Value::Text(text.clone())),
        other => Value::from(other.clone()),
    }
}

fn string_at(parts: &[serde_json::Value], index: usize) -> Option<String> {
    parts.get(index).and_then(|v| v.as_str()).map(str::to_owned)
}

fn malformed(node_id: &str, key: &str, reason: &str) -> DecodeError {
    DecodeError::Malformed {
        node_id: node_id.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
