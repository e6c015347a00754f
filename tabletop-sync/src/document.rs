//! Board files: the plain nested JSON used to save and load a whole board.
//!
//! Unlike the flat wire format, a board file keeps `pieces` as a sequence
//! and its fields as typed JSON:
//!
//! ```json
//! { "_new": 1, "pieces": [ { "faces": ["a.png"], "x": 10, "y": 20, "lock": 0 } ] }
//! ```
//!
//! Reading is lenient. Numbers may be strings and missing fields take
//! defaults, because boards written by older clients are not consistent.

use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::codec::sequence_items;
use crate::error::SyncError;
use crate::piece::{flag_value, normalize_orientation, number_value, parse_flag, parse_number};

const INVALID_DATA: &str = "The provided data does not contain valid board game data.";
const NO_PIECES: &str = "Sorry, but the board data did not contain any pieces";

/// A saved board.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorldDocument {
    #[serde(rename = "_new", skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pieces: Option<Vec<DocumentPiece>>,
}

/// One piece of a saved board.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DocumentPiece {
    pub faces: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_width: Option<f64>,
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    #[serde(serialize_with = "serialize_flag")]
    pub lock: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shield: Option<f64>,
    pub orientation: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_showing: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub css_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_callback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_html: Option<String>,
}

fn serialize_flag<S: serde::Serializer>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*flag))
}

impl DocumentPiece {
    /// Decode a piece; anything that is not an object is skipped by callers.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let number = |name: &str| map.get(name).and_then(parse_number);
        let text = |name: &str| {
            map.get(name).and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
        };

        Some(Self {
            faces: map
                .get("faces")
                .map(|faces| {
                    sequence_items(faces)
                        .into_iter()
                        .filter_map(|f| f.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            face_width: number("face_width"),
            x: number("x").unwrap_or_default(),
            y: number("y").unwrap_or_default(),
            z: number("z"),
            lock: map.get("lock").and_then(parse_flag).unwrap_or(false),
            shield: number("shield"),
            orientation: normalize_orientation(number("orientation").unwrap_or_default()),
            face_showing: number("face_showing")
                .filter(|v| *v >= 0.0)
                .map(|v| v as u64),
            css_class: text("css_class"),
            event_callback: text("event_callback"),
            custom_html: text("custom_html"),
        })
    }

    /// Nested value written to the world when this piece is imported.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("faces".into(), Value::from(self.faces.clone()));
        if let Some(width) = self.face_width {
            map.insert("face_width".into(), number_value(width));
        }
        map.insert("x".into(), number_value(self.x));
        map.insert("y".into(), number_value(self.y));
        if let Some(z) = self.z {
            map.insert("z".into(), number_value(z));
        }
        map.insert("lock".into(), flag_value(self.lock));
        if let Some(shield) = self.shield {
            map.insert("shield".into(), number_value(shield));
        }
        map.insert("orientation".into(), number_value(self.orientation));
        if let Some(face) = self.face_showing {
            map.insert("face_showing".into(), Value::from(face));
        }
        for (name, field) in [
            ("css_class", &self.css_class),
            ("event_callback", &self.event_callback),
            ("custom_html", &self.custom_html),
        ] {
            if let Some(text) = field {
                map.insert(name.into(), Value::String(text.clone()));
            }
        }
        Value::Object(map)
    }
}

impl WorldDocument {
    /// Document for a list of pieces, stamped as a fresh world.
    pub fn new(pieces: Vec<DocumentPiece>) -> Self {
        Self {
            generation: Some(1),
            pieces: Some(pieces),
        }
    }

    /// Decode a parsed board. Returns `None` for non-object roots.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        Some(Self {
            generation: map
                .get("_new")
                .and_then(parse_number)
                .filter(|g| *g >= 0.0)
                .map(|g| g as u64),
            pieces: map.get("pieces").map(|pieces| {
                sequence_items(pieces)
                    .into_iter()
                    .filter_map(DocumentPiece::from_value)
                    .collect()
            }),
        })
    }

    /// Parse a board file's text. Fails when the text is not a board or
    /// carries no `pieces`.
    pub fn from_json_str(text: &str) -> Result<Self, SyncError> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            log::debug!("Board parse failed: {e}");
            SyncError::SnapshotParse(INVALID_DATA.into())
        })?;
        let document =
            Self::from_value(&value).ok_or_else(|| SyncError::SnapshotParse(INVALID_DATA.into()))?;
        document.require_pieces()?;
        Ok(document)
    }

    /// Read and parse a board file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            log::warn!("Failed to read board file {}: {e}", path.display());
            SyncError::SnapshotParse("Sorry, we were unable to read the file.".into())
        })?;
        Self::from_json_str(&text)
    }

    /// The pieces, or the user-facing error for a board without any.
    pub fn require_pieces(&self) -> Result<&[DocumentPiece], SyncError> {
        self.pieces
            .as_deref()
            .ok_or_else(|| SyncError::SnapshotParse(NO_PIECES.into()))
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(generation) = self.generation {
            map.insert("_new".into(), Value::from(generation));
        }
        if let Some(pieces) = &self.pieces {
            map.insert(
                "pieces".into(),
                Value::Array(pieces.iter().map(DocumentPiece::to_value).collect()),
            );
        }
        Value::Object(map)
    }

    pub fn to_json_string(&self) -> Result<String, SyncError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::SnapshotParse(format!("Unable to save the board: {e}")))
    }
}
