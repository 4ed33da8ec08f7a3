//! Capability sets exchanged during negotiation.
//!
//! A [`VideoCaps`] is an ordered list of [`CapsStructure`]s, each describing a set of
//! acceptable raw video configurations. Earlier structures are preferred. The algebra
//! mirrors what pad-based media frameworks do: intersection keeps the order of the
//! first operand, fixation picks the first acceptable value.

use std::{cmp::Ordering, fmt};

use indexmap::IndexSet;

use super::format::VideoFormat;

/// A rational number, used for framerates and pixel aspect ratios.
#[derive(Debug, Clone, Copy)]
pub struct Fraction {
    /// Numerator
    pub num: i32,
    /// Denominator, never 0
    pub den: i32,
}

impl Fraction {
    /// Create a new fraction
    pub const fn new(num: i32, den: i32) -> Fraction {
        Fraction { num, den }
    }

    fn cmp_key(&self, other: &Fraction) -> Ordering {
        (self.num as i64 * other.den as i64).cmp(&(other.num as i64 * self.den as i64))
    }

    /// Value as a float
    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl PartialEq for Fraction {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_key(other) == Ordering::Equal
    }
}
impl Eq for Fraction {}

impl PartialOrd for Fraction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Fraction {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_key(other)
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Inclusive range of values. A range with `min == max` is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range<T> {
    /// Lower bound
    pub min: T,
    /// Upper bound
    pub max: T,
}

impl<T: Ord + Copy> Range<T> {
    /// Create a range
    pub fn new(min: T, max: T) -> Self {
        Range { min, max }
    }

    /// A range with a single value
    pub fn fixed(value: T) -> Self {
        Range {
            min: value,
            max: value,
        }
    }

    /// Whether the range holds exactly one value
    pub fn is_fixed(&self) -> bool {
        self.min == self.max
    }

    /// Whether `value` is inside the range
    pub fn contains(&self, value: T) -> bool {
        self.min <= value && value <= self.max
    }

    /// Overlap of both ranges, `None` if disjoint
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let min = std::cmp::max(self.min, other.min);
        let max = std::cmp::min(self.max, other.max);
        (min <= max).then_some(Range { min, max })
    }

    /// Whether `other` lies completely inside this range
    pub fn includes(&self, other: &Self) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    /// The value of the range closest to `target`
    pub fn nearest(&self, target: T) -> T {
        std::cmp::min(std::cmp::max(target, self.min), self.max)
    }
}

impl<T: fmt::Display + PartialEq> fmt::Display for Range<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "[ {}, {} ]", self.min, self.max)
        }
    }
}

/// Largest value a dimension may take in caps
pub const MAX_DIMENSION: i32 = i32::MAX;

/// Any framerate, `0/1` to `i32::MAX/1`
pub const ANY_FRAMERATE: Range<Fraction> = Range {
    min: Fraction::new(0, 1),
    max: Fraction::new(i32::MAX, 1),
};

/// One set of acceptable raw video configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsStructure {
    /// Accepted formats, in order of preference
    pub formats: IndexSet<VideoFormat>,
    /// Frame width in pixels
    pub width: Range<i32>,
    /// Frame height in pixels
    pub height: Range<i32>,
    /// Frames per second
    pub framerate: Range<Fraction>,
    /// Pixel aspect ratio, unconstrained if `None`
    pub pixel_aspect_ratio: Option<Range<Fraction>>,
    /// Whether buffers are carried in dma-buf memory (`memory:DMABuf` feature)
    pub dmabuf: bool,
}

impl CapsStructure {
    /// Structure accepting `formats` in any size and at any rate
    pub fn new(formats: impl IntoIterator<Item = VideoFormat>) -> Self {
        CapsStructure {
            formats: formats.into_iter().collect(),
            width: Range::new(1, MAX_DIMENSION),
            height: Range::new(1, MAX_DIMENSION),
            framerate: ANY_FRAMERATE,
            pixel_aspect_ratio: None,
            dmabuf: false,
        }
    }

    /// Restrict the frame size
    pub fn with_size(mut self, width: Range<i32>, height: Range<i32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Restrict the framerate
    pub fn with_framerate(mut self, framerate: Range<Fraction>) -> Self {
        self.framerate = framerate;
        self
    }

    /// Restrict the pixel aspect ratio
    pub fn with_pixel_aspect_ratio(mut self, par: Range<Fraction>) -> Self {
        self.pixel_aspect_ratio = Some(par);
        self
    }

    /// Set the dma-buf memory feature
    pub fn with_dmabuf(mut self, dmabuf: bool) -> Self {
        self.dmabuf = dmabuf;
        self
    }

    /// Whether every field holds exactly one value
    pub fn is_fixed(&self) -> bool {
        self.formats.len() == 1
            && self.width.is_fixed()
            && self.height.is_fixed()
            && self.framerate.is_fixed()
            && self.pixel_aspect_ratio.map_or(true, |par| par.is_fixed())
    }

    /// Configurations accepted by both structures
    pub fn intersect(&self, other: &CapsStructure) -> Option<CapsStructure> {
        if self.dmabuf != other.dmabuf {
            return None;
        }
        let formats: IndexSet<VideoFormat> = self
            .formats
            .iter()
            .filter(|f| other.formats.contains(*f))
            .copied()
            .collect();
        if formats.is_empty() {
            return None;
        }
        let pixel_aspect_ratio = match (self.pixel_aspect_ratio, other.pixel_aspect_ratio) {
            (Some(a), Some(b)) => Some(a.intersect(&b)?),
            (a, b) => a.or(b),
        };
        Some(CapsStructure {
            formats,
            width: self.width.intersect(&other.width)?,
            height: self.height.intersect(&other.height)?,
            framerate: self.framerate.intersect(&other.framerate)?,
            pixel_aspect_ratio,
            dmabuf: self.dmabuf,
        })
    }

    /// Whether every configuration of `other` is accepted by `self`
    pub fn is_superset_of(&self, other: &CapsStructure) -> bool {
        self.dmabuf == other.dmabuf
            && other.formats.iter().all(|f| self.formats.contains(f))
            && self.width.includes(&other.width)
            && self.height.includes(&other.height)
            && self.framerate.includes(&other.framerate)
            && match (self.pixel_aspect_ratio, other.pixel_aspect_ratio) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(a), Some(b)) => a.includes(&b),
            }
    }

    /// Pick the first format and the lowest value of every range.
    ///
    /// An unconstrained pixel aspect ratio fixates to `1/1`.
    pub fn fixate(&self) -> CapsStructure {
        let mut fixed = self.clone();
        fixed.formats.truncate(1);
        fixed.width = Range::fixed(self.width.min);
        fixed.height = Range::fixed(self.height.min);
        fixed.framerate = Range::fixed(self.framerate.min);
        let square = Fraction::new(1, 1);
        fixed.pixel_aspect_ratio = Some(Range::fixed(
            self.pixel_aspect_ratio.map_or(square, |par| par.nearest(square)),
        ));
        fixed
    }

    /// Narrow the framerate to the value nearest `target`
    pub fn fixate_framerate_nearest(&mut self, target: Fraction) {
        self.framerate = Range::fixed(self.framerate.nearest(target));
    }

    /// Narrow the pixel aspect ratio to the value nearest `target`
    pub fn fixate_pixel_aspect_ratio_nearest(&mut self, target: Fraction) {
        let par = self
            .pixel_aspect_ratio
            .map_or(target, |range| range.nearest(target));
        self.pixel_aspect_ratio = Some(Range::fixed(par));
    }
}

impl fmt::Display for CapsStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("video/x-raw")?;
        if self.dmabuf {
            f.write_str("(memory:DMABuf)")?;
        }
        if self.formats.len() == 1 {
            write!(f, ", format=(string){}", self.formats[0])?;
        } else {
            f.write_str(", format=(string){ ")?;
            for (i, format) in self.formats.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", format)?;
            }
            f.write_str(" }")?;
        }
        write!(
            f,
            ", width=(int){}, height=(int){}, framerate=(fraction){}",
            self.width, self.height, self.framerate
        )?;
        if let Some(par) = self.pixel_aspect_ratio {
            write!(f, ", pixel-aspect-ratio=(fraction){}", par)?;
        }
        Ok(())
    }
}

/// Ordered list of acceptable configurations. Empty caps accept nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoCaps {
    structures: Vec<CapsStructure>,
}

impl VideoCaps {
    /// Caps accepting nothing
    pub fn new_empty() -> Self {
        VideoCaps::default()
    }

    /// Caps holding a single structure
    pub fn new(structure: CapsStructure) -> Self {
        VideoCaps {
            structures: vec![structure],
        }
    }

    /// Whether no configuration is accepted
    pub fn is_empty(&self) -> bool {
        self.structures.is_empty()
    }

    /// Whether the caps describe exactly one configuration
    pub fn is_fixed(&self) -> bool {
        self.structures.len() == 1 && self.structures[0].is_fixed()
    }

    /// Iterate the structures in order of preference
    pub fn iter(&self) -> impl Iterator<Item = &CapsStructure> {
        self.structures.iter()
    }

    /// Mutably iterate the structures
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CapsStructure> {
        self.structures.iter_mut()
    }

    /// Number of structures
    pub fn len(&self) -> usize {
        self.structures.len()
    }

    /// Structure at `index`
    pub fn structure(&self, index: usize) -> Option<&CapsStructure> {
        self.structures.get(index)
    }

    /// Append a structure unless an earlier one already covers it
    pub fn append_structure(&mut self, structure: CapsStructure) {
        if !self.structures.iter().any(|s| s.is_superset_of(&structure)) {
            self.structures.push(structure);
        }
    }

    /// Append all structures of `other`
    pub fn append(&mut self, other: VideoCaps) {
        for structure in other.structures {
            self.append_structure(structure);
        }
    }

    /// Intersection keeping the order of `self`
    pub fn intersect(&self, other: &VideoCaps) -> VideoCaps {
        let mut result = VideoCaps::new_empty();
        for a in &self.structures {
            for b in &other.structures {
                if let Some(s) = a.intersect(b) {
                    result.append_structure(s);
                }
            }
        }
        result
    }

    /// Whether any configuration is accepted by both
    pub fn can_intersect(&self, other: &VideoCaps) -> bool {
        self.structures
            .iter()
            .any(|a| other.structures.iter().any(|b| a.intersect(b).is_some()))
    }

    /// Whether every configuration of `other` is accepted by `self`
    pub fn is_superset_of(&self, other: &VideoCaps) -> bool {
        other
            .structures
            .iter()
            .all(|b| self.structures.iter().any(|a| a.is_superset_of(b)))
    }

    /// Drop redundant structures and merge those differing only in their formats.
    pub fn simplify(self) -> VideoCaps {
        let mut merged: Vec<CapsStructure> = Vec::with_capacity(self.structures.len());
        for structure in self.structures {
            if merged.iter().any(|s| s.is_superset_of(&structure)) {
                continue;
            }
            if let Some(target) = merged.iter_mut().find(|s| {
                s.dmabuf == structure.dmabuf
                    && s.width == structure.width
                    && s.height == structure.height
                    && s.framerate == structure.framerate
                    && s.pixel_aspect_ratio == structure.pixel_aspect_ratio
            }) {
                target.formats.extend(structure.formats);
                continue;
            }
            merged.push(structure);
        }
        VideoCaps { structures: merged }
    }

    /// Keep the first structure and fixate it.
    pub fn fixate(&self) -> VideoCaps {
        match self.structures.first() {
            Some(first) => VideoCaps::new(first.fixate()),
            None => VideoCaps::new_empty(),
        }
    }

    /// Whether any structure carries the dma-buf memory feature
    pub fn has_dmabuf(&self) -> bool {
        self.structures.iter().any(|s| s.dmabuf)
    }
}

impl FromIterator<CapsStructure> for VideoCaps {
    fn from_iter<I: IntoIterator<Item = CapsStructure>>(iter: I) -> Self {
        let mut caps = VideoCaps::new_empty();
        for structure in iter {
            caps.append_structure(structure);
        }
        caps
    }
}

impl fmt::Display for VideoCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.structures.is_empty() {
            return f.write_str("EMPTY");
        }
        for (i, structure) in self.structures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", structure)?;
        }
        Ok(())
    }
}
