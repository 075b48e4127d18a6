use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{IoValue, TaskIo};

/// Declared kind of a single task parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Number,
    Text,
    Image,
    Audio,
    Video,
    File,
    ListOfNumbers,
    ListOfTexts,
    ListOfImages,
    ListOfAudios,
    ListOfVideos,
    ListOfFiles,
}

impl ShapeKind {
    fn element(self) -> Option<ShapeKind> {
        match self {
            ShapeKind::ListOfNumbers => Some(ShapeKind::Number),
            ShapeKind::ListOfTexts => Some(ShapeKind::Text),
            ShapeKind::ListOfImages => Some(ShapeKind::Image),
            ShapeKind::ListOfAudios => Some(ShapeKind::Audio),
            ShapeKind::ListOfVideos => Some(ShapeKind::Video),
            ShapeKind::ListOfFiles => Some(ShapeKind::File),
            _ => None,
        }
    }

    /// Whether `value` is acceptable for a parameter of this kind.
    pub fn accepts(self, value: &IoValue) -> bool {
        if let Some(element) = self.element() {
            return match value {
                IoValue::List(items) => items.iter().all(|item| element.accepts(item)),
                _ => false,
            };
        }
        match self {
            ShapeKind::Number => matches!(value, IoValue::Number(_)),
            ShapeKind::Text => matches!(value, IoValue::Text(_)),
            _ => matches!(value, IoValue::File(_)),
        }
    }
}

/// Human-facing description of one parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeDescriptor {
    pub name: String,
    pub description: String,
    pub kind: ShapeKind,
}

impl ShapeDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, kind: ShapeKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
        }
    }
}

/// Parameter name → descriptor.
pub type Shape = BTreeMap<String, ShapeDescriptor>;

/// Check `io` against a required and an optional shape.
///
/// Every required key must be present; every present key that either shape
/// declares must have the declared kind. Undeclared keys are ignored here and
/// dropped by [`retain_declared`].
pub fn validate(io: &TaskIo, required: &Shape, optional: &Shape) -> Result<(), String> {
    for (key, descriptor) in required {
        match io.get(key) {
            None => return Err(format!("missing required parameter `{key}`")),
            Some(value) if !descriptor.kind.accepts(value) => {
                return Err(format!(
                    "parameter `{key}` must be {:?}",
                    descriptor.kind
                ))
            }
            Some(_) => {}
        }
    }
    for (key, descriptor) in optional {
        if let Some(value) = io.get(key) {
            if !descriptor.kind.accepts(value) {
                return Err(format!(
                    "optional parameter `{key}` must be {:?}",
                    descriptor.kind
                ));
            }
        }
    }
    Ok(())
}

/// Drop every key neither shape declares.
pub fn retain_declared(io: &mut TaskIo, required: &Shape, optional: &Shape) {
    io.retain(|key, _| required.contains_key(key) || optional.contains_key(key));
}
