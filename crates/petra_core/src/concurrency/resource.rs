//! Hierarchical names for lockable resources.

use std::fmt;

/// The name of a lockable resource.
///
/// A resource name is an ordered sequence of path segments locating a node
/// in the lock hierarchy, e.g. `database/table17/page42`. The parent of a
/// name is the name minus its last segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceName(Vec<String>);

impl ResourceName {
    /// Creates a root resource name with a single segment.
    #[must_use]
    pub fn root(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    /// Creates a resource name from path segments.
    ///
    /// Empty segment lists are not meaningful; callers always build names
    /// from a root downwards.
    #[must_use]
    pub fn from_segments(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// Returns the name of a child of this resource.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// Returns the parent name, or `None` for a root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() <= 1 {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Whether this name lies strictly below `ancestor` in the hierarchy.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &ResourceName) -> bool {
        self.0.len() > ancestor.0.len() && self.0[..ancestor.0.len()] == ancestor.0[..]
    }

    /// The path segments of this name.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// The last segment of this name.
    #[must_use]
    pub fn leaf(&self) -> &str {
        // Names always have at least one segment.
        self.0.last().map(String::as_str).unwrap_or("")
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}
