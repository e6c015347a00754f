//! Board pieces and their decoding from wire values.
//!
//! Everything that comes back from the store is a string (see
//! [`crate::codec`]), so the decoders here accept both typed JSON and the
//! stringly-typed form: `10`, `"10"` and `"10.0"` are all the same
//! coordinate, and `1`, `"1"` and `"true"` all mean locked.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::codec::sequence_items;

/// Index of a piece in the world's `pieces` map.
pub type PieceIndex = u64;

/// Index named by a `pieces` map key.
///
/// Only canonical decimal keys name a piece: `"3"` does, `"03"` and `"+3"`
/// do not, so no two wire keys map to the same index.
pub fn parse_index(key: &str) -> Option<PieceIndex> {
    let canonical = !key.is_empty()
        && key.bytes().all(|b| b.is_ascii_digit())
        && (key == "0" || !key.starts_with('0'));
    if canonical {
        key.parse().ok()
    } else {
        None
    }
}

/// Full state of a piece.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Piece {
    pub faces: Vec<String>,
    pub x: f64,
    pub y: f64,
    /// Degrees in `[0, 360)`.
    pub orientation: f64,
    pub lock: bool,
    /// Client that issued the last move, if any.
    pub client: Option<String>,
}

impl Piece {
    pub fn new(faces: Vec<String>, x: f64, y: f64) -> Self {
        Self {
            faces,
            x,
            y,
            ..Self::default()
        }
    }

    /// Nested value written to the world for this piece.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("faces".into(), json!(self.faces));
        map.insert("x".into(), number_value(self.x));
        map.insert("y".into(), number_value(self.y));
        map.insert("orientation".into(), number_value(self.orientation));
        map.insert("lock".into(), flag_value(self.lock));
        if let Some(client) = &self.client {
            map.insert("client".into(), Value::String(client.clone()));
        }
        Value::Object(map)
    }

    /// Decode a piece from a nested value. Missing fields take defaults;
    /// anything that is not an object is not a piece.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let mut piece = Piece::default();
        piece.apply(&PieceDelta::from_value(value));
        Some(piece)
    }

    /// Apply every field present in `delta`.
    pub fn apply(&mut self, delta: &PieceDelta) {
        if let Some(faces) = &delta.faces {
            self.faces = faces.clone();
        }
        if let Some(x) = delta.x {
            self.x = x;
        }
        if let Some(y) = delta.y {
            self.y = y;
        }
        if let Some(orientation) = delta.orientation {
            self.orientation = normalize_orientation(orientation);
        }
        if let Some(lock) = delta.lock {
            self.lock = lock;
        }
        if delta.client.is_some() {
            self.client = delta.client.clone();
        }
    }

    /// Apply a delta received from the store on behalf of `local_client`.
    ///
    /// The position of a move this client issued itself was already shown
    /// when it was made, so it is not applied again.
    pub fn apply_remote(&mut self, delta: &PieceDelta, local_client: &str) {
        if delta.is_echo_of(local_client) {
            let mut rest = delta.clone();
            rest.x = None;
            rest.y = None;
            self.apply(&rest);
        } else {
            self.apply(delta);
        }
    }
}

/// Partial piece update as decoded from a change notification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PieceDelta {
    pub faces: Option<Vec<String>>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub orientation: Option<f64>,
    pub lock: Option<bool>,
    pub client: Option<String>,
}

impl PieceDelta {
    pub fn from_value(value: &Value) -> Self {
        let field = |name: &str| value.get(name);
        Self {
            faces: field("faces").map(|faces| {
                sequence_items(faces)
                    .into_iter()
                    .filter_map(|f| f.as_str().map(str::to_string))
                    .collect()
            }),
            x: field("x").and_then(parse_number),
            y: field("y").and_then(parse_number),
            orientation: field("orientation").and_then(parse_number),
            lock: field("lock").and_then(parse_flag),
            client: field("client").and_then(|c| match c {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }),
        }
    }

    /// Both coordinates, when the delta is a move.
    pub fn position(&self) -> Option<(f64, f64)> {
        Some((self.x?, self.y?))
    }

    /// Whether this delta is a move issued by `client_id`.
    pub fn is_echo_of(&self, client_id: &str) -> bool {
        self.position().is_some() && self.client.as_deref() == Some(client_id)
    }
}

/// Fold an angle into `[0, 360)`.
pub fn normalize_orientation(degrees: f64) -> f64 {
    if !degrees.is_finite() {
        return 0.0;
    }
    let folded = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs.
    if folded >= 360.0 {
        0.0
    } else {
        folded
    }
}

/// Round an angle to the nearest multiple of `step` degrees, then fold it.
pub fn snap_orientation(degrees: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return normalize_orientation(degrees);
    }
    normalize_orientation((degrees / step).round() * step)
}

/// JSON number for `v`, written without a fraction when it has none.
pub(crate) fn number_value(v: f64) -> Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if v.is_finite() && v.fract() == 0.0 && v.abs() < MAX_EXACT {
        json!(v as i64)
    } else {
        json!(v)
    }
}

/// Flags travel as `0`/`1`.
pub(crate) fn flag_value(flag: bool) -> Value {
    json!(u8::from(flag))
}

pub(crate) fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

pub(crate) fn parse_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.trim() {
            "true" => Some(true),
            "false" | "" => Some(false),
            other => other.parse::<f64>().ok().map(|v| v != 0.0),
        },
        _ => None,
    }
}
