//! Geometry information

use crate::types::Vec3;

/// Out of range code of a position relative to a [PhysicalBox].
///
/// Bit `2 * axis` is set if the position lies below the box along `axis`,
/// bit `2 * axis + 1` if it lies above.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BoundsCheck(u8);

impl BoundsCheck {
    /// The code of a position inside the box.
    pub const INSIDE: BoundsCheck = BoundsCheck(0);

    /// Raw bit pattern.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// True if no axis is out of range.
    pub fn is_inside(&self) -> bool {
        self.0 == 0
    }

    /// True if the position lies below the box along `axis`.
    pub fn below(&self, axis: usize) -> bool {
        self.0 & (1 << (2 * axis)) != 0
    }

    /// True if the position lies above the box along `axis`.
    pub fn above(&self, axis: usize) -> bool {
        self.0 & (1 << (2 * axis + 1)) != 0
    }
}

/// A bounding box describes the analysis domain.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PhysicalBox {
    coords: [f64; 6],
}

impl PhysicalBox {
    /// Create a new bounding box.
    ///
    /// The coordinates are given by `[xmin, ymin, zmin, xmax, ymax, zmax]`.
    pub fn new(coords: [f64; 6]) -> Self {
        Self { coords }
    }

    /// Create the box spanned by `origin` and `origin + extent`.
    pub fn from_origin_and_extent(origin: Vec3, extent: Vec3) -> Self {
        Self {
            coords: [
                origin[0],
                origin[1],
                origin[2],
                origin[0] + extent[0],
                origin[1] + extent[1],
                origin[2] + extent[2],
            ],
        }
    }

    /// Return coordinates
    pub fn coordinates(&self) -> [f64; 6] {
        self.coords
    }

    /// Lower corner.
    pub fn lower(&self) -> Vec3 {
        [self.coords[0], self.coords[1], self.coords[2]]
    }

    /// Upper corner.
    pub fn upper(&self) -> Vec3 {
        [self.coords[3], self.coords[4], self.coords[5]]
    }

    /// Check which faces of the box a point lies beyond.
    ///
    /// Both faces are inclusive, a point on the upper face is inside.
    pub fn check_bounds(&self, point: Vec3) -> BoundsCheck {
        let mut code = 0_u8;
        for axis in 0..3 {
            // NaN is flagged as below.
            if point[axis].is_nan() || point[axis] < self.coords[axis] {
                code |= 1 << (2 * axis);
            } else if point[axis] > self.coords[axis + 3] {
                code |= 1 << (2 * axis + 1);
            }
        }
        BoundsCheck(code)
    }

    /// True if the point lies in the closed box.
    pub fn contains(&self, point: Vec3) -> bool {
        self.check_bounds(point).is_inside()
    }
}

impl std::fmt::Display for PhysicalBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        write!(
            f,
            "(xmin: {}, ymin: {}, zmin: {}, xmax: {}, ymax: {}, zmax: {})",
            xmin, ymin, zmin, xmax, ymax, zmax
        )
    }
}

#[cfg(test)]
mod test {
    use super::PhysicalBox;

    #[test]
    fn test_check_bounds() {
        let domain = PhysicalBox::from_origin_and_extent([0.0, 0.0, 0.0], [1.0, 2.0, 3.0]);

        assert!(domain.contains([0.5, 0.5, 0.5]));
        assert!(domain.contains([1.0, 2.0, 3.0]));
        assert!(domain.contains([0.0, 0.0, 0.0]));

        let code = domain.check_bounds([-0.1, 0.5, 3.5]);
        assert!(code.below(0));
        assert!(!code.above(0));
        assert!(code.above(2));
        assert!(!code.below(1) && !code.above(1));
        assert_eq!(code.bits(), 0b10_00_01);

        assert!(!domain.check_bounds([f64::NAN, 0.0, 0.0]).is_inside());
    }
}
