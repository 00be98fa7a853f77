//! Minimum bounding rectangles and their set algebra.
//!
//! An [`Mbr`] is an axis-aligned 2-D box in GeoJSON axis order: west, south,
//! east, north. The tree engine relies on six primitives (`area`, `within`,
//! `intersect`, `disjoint`, `merge`, `overlap`), all with inclusive
//! comparisons, so boxes that merely touch are not disjoint.

use serde::{Deserialize, Serialize};

/// A minimum bounding rectangle with `west <= east` and `south <= north`.
#[derive(Clone, Copy, PartialEq, Default, Debug, Serialize, Deserialize)]
pub struct Mbr {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl std::fmt::Display for Mbr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Mbr({}, {}, {}, {})",
            self.west, self.south, self.east, self.north
        )
    }
}

impl Mbr {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Mbr {
        Mbr {
            west,
            south,
            east,
            north,
        }
    }

    /// The degenerate zero box, returned by [`Mbr::overlap`] for disjoint
    /// inputs. Its area is zero.
    pub fn zero() -> Mbr {
        Mbr::new(0.0, 0.0, 0.0, 0.0)
    }

    /// Checks the ordering invariants `west <= east` and `south <= north`.
    pub fn is_valid(&self) -> bool {
        self.west <= self.east && self.south <= self.north
    }

    pub fn area(&self) -> f64 {
        (self.east - self.west).abs() * (self.north - self.south).abs()
    }

    /// True when `self` lies entirely inside `other` (edges may coincide).
    pub fn within(&self, other: &Mbr) -> bool {
        self.west >= other.west
            && self.south >= other.south
            && self.east <= other.east
            && self.north <= other.north
    }

    /// True when an edge of `self` crosses an edge of `other`.
    ///
    /// A vertical edge of `self` crosses `other` when it falls inside
    /// `other`'s horizontal span while the vertical spans overlap; the
    /// horizontal edges are tested symmetrically. All comparisons are
    /// inclusive, so touching edges count.
    pub fn intersect(&self, other: &Mbr) -> bool {
        let x_overlap = self.west <= other.east && other.west <= self.east;
        let y_overlap = self.south <= other.north && other.south <= self.north;

        (((other.west <= self.west && self.west <= other.east)
            || (other.west <= self.east && self.east <= other.east))
            && y_overlap)
            || (((other.south <= self.south && self.south <= other.north)
                || (other.south <= self.north && self.north <= other.north))
                && x_overlap)
    }

    /// True when the boxes share no point: neither contains the other and
    /// no edges cross.
    pub fn disjoint(&self, other: &Mbr) -> bool {
        !self.within(other) && !other.within(self) && !self.intersect(other)
    }

    /// The smallest box containing both inputs.
    pub fn merge(&self, other: &Mbr) -> Mbr {
        Mbr {
            west: self.west.min(other.west),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            north: self.north.max(other.north),
        }
    }

    /// The common region of the two boxes, or the zero box when disjoint.
    pub fn overlap(&self, other: &Mbr) -> Mbr {
        if self.disjoint(other) {
            return Mbr::zero();
        }
        Mbr {
            west: self.west.max(other.west),
            south: self.south.max(other.south),
            east: self.east.min(other.east),
            north: self.north.min(other.north),
        }
    }

    /// Growth in area needed to absorb `other`. Drives choose-subtree.
    pub fn expansion(&self, other: &Mbr) -> f64 {
        self.merge(other).area() - self.area()
    }
}
