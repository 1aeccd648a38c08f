use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use crate::error::ValidationError;

/// Largest edge accepted before anything is handed to the model.
pub const MAX_EDGE: u32 = 4096;

/// Output frame size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Accepts `WIDTHxHEIGHT`, `WIDTHXHEIGHT` and the pipeline's native
/// `WIDTH*HEIGHT`. Surrounding whitespace is ignored.
impl FromStr for Resolution {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::Resolution(s.to_string());

        let trimmed = s.trim();
        let (w, h) = trimmed
            .split_once(['x', 'X', '*'])
            .ok_or_else(invalid)?;

        let parse_edge = |edge: &str| -> Result<u32, ValidationError> {
            let edge = edge.trim();
            if edge.is_empty() || !edge.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            edge.parse::<u32>().map_err(|_| invalid())
        };

        let width = parse_edge(w)?;
        let height = parse_edge(h)?;

        if width == 0 || height == 0 {
            return Err(invalid());
        }
        if width > MAX_EDGE || height > MAX_EDGE {
            return Err(ValidationError::OutOfRange {
                field: "size",
                reason: format!("{}x{} exceeds the {} pixel edge limit", width, height, MAX_EDGE),
            });
        }

        Ok(Self { width, height })
    }
}

/// Renders in the pipeline's `WIDTH*HEIGHT` form.
impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*{}", self.width, self.height)
    }
}
