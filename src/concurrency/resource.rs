// Hierarchical resource names.
//
// A resource is identified by its path from the root of the lock hierarchy,
// e.g. `database/orders/3` for page 3 of the orders table. Two names are
// equal iff their full paths are; ancestry is strict prefix containment.

use std::fmt;

/// Path of a lockable resource from the hierarchy root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName {
    segments: Vec<String>,
}

impl ResourceName {
    /// The root of a hierarchy.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            segments: vec![name.into()],
        }
    }

    /// Name of a direct child of this resource.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Name of the parent resource, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// True if `self` is a strict descendant of `other`.
    pub fn is_descendant_of(&self, other: &ResourceName) -> bool {
        self.segments.len() > other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    /// Path segments from the root.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Depth in the hierarchy; the root has depth 1.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// The final path segment.
    pub fn leaf(&self) -> &str {
        self.segments
            .last()
            .expect("resource name has at least one segment")
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}
