use core::fmt;

/// The name of a lockable resource: a path of segments from the
/// database root, e.g. `database/table42/page7`. Equality is by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceName {
    segments: Vec<String>,
}

impl ResourceName {
    pub fn new(segments: &[&str]) -> Self {
        Self {
            segments: segments.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn root(name: &str) -> Self {
        Self {
            segments: vec![name.to_string()],
        }
    }

    /// The name of this resource's child with the given segment.
    pub fn child(&self, segment: &str) -> ResourceName {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        ResourceName { segments }
    }

    pub fn parent(&self) -> Option<ResourceName> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(ResourceName {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn last_segment(&self) -> &str {
        self.segments.last().unwrap()
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Is `self` a strict descendant of `other`?
    pub fn is_descendant_of(&self, other: &ResourceName) -> bool {
        self.segments.len() > other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    /// The segments of `self` below `ancestor`, outermost first.
    pub fn segments_below(&self, ancestor: &ResourceName) -> &[String] {
        debug_assert!(self.is_descendant_of(ancestor));
        &self.segments[ancestor.segments.len()..]
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}
