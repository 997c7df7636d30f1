//! Request types and their scheduling priority.

use crate::{Error, Result};
use http::request::Parts;

/// Type name used for tile images.
pub const TILE: &str = "tile";
/// Type name used for UTF grid interactivity documents.
pub const GRID: &str = "grid";
/// Type name used for everything else.
pub const OTHER: &str = "other";

/// Ordered list of request type names, highest priority first.
///
/// The list is fixed when the dispatcher is built. Types are referred to by
/// their index everywhere else, so a lookup happens once per request. The
/// last entry doubles as the fallback for names that are not in the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypePriority {
    names: Vec<String>,
}

impl TypePriority {
    /// Builds a priority list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the list is empty or contains a
    /// blank or duplicate name.
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for name in names {
            let name = name.into().trim().to_owned();
            if name.is_empty() {
                return Err(Error::InvalidConfig {
                    reason: "request type names must not be empty".into(),
                });
            }
            if out.contains(&name) {
                return Err(Error::InvalidConfig {
                    reason: format!("request type `{name}` listed twice"),
                });
            }
            out.push(name);
        }
        if out.is_empty() {
            return Err(Error::InvalidConfig {
                reason: "at least one request type is required".into(),
            });
        }
        Ok(Self { names: out })
    }

    /// Number of configured types.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always `false`; construction rejects empty lists.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Index of the fallback type (the lowest priority one).
    pub fn fallback(&self) -> usize {
        self.names.len() - 1
    }

    /// Resolves a name to its priority index, or the fallback index.
    pub fn index_of(&self, name: &str) -> usize {
        self.names
            .iter()
            .position(|n| n == name)
            .unwrap_or_else(|| self.fallback())
    }

    /// Name at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl Default for TypePriority {
    fn default() -> Self {
        Self {
            names: vec![TILE.into(), GRID.into(), OTHER.into()],
        }
    }
}

/// Maps a request to one of the configured type names.
///
/// Implementations only look at the request head; the body is streamed
/// through to the backend untouched. Names the [`TypePriority`] does not
/// know land in its fallback type.
pub trait Classifier: Send + Sync + 'static {
    fn classify(&self, parts: &Parts) -> &str;
}

impl<F> Classifier for F
where
    F: Fn(&Parts) -> &'static str + Send + Sync + 'static,
{
    fn classify(&self, parts: &Parts) -> &str {
        self(parts)
    }
}

/// Default classifier for the tile server's URL scheme.
///
/// `…/{z}/{x}/{y}.png` is a tile, `…/{z}/{x}/{y}.grid.json` is a grid,
/// anything else is `other`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TileClassifier;

impl Classifier for TileClassifier {
    fn classify(&self, parts: &Parts) -> &str {
        let path = parts.uri.path();
        if path.ends_with(".png") {
            TILE
        } else if path.ends_with(".grid.json") {
            GRID
        } else {
            OTHER
        }
    }
}
