//! Camera pose value type.
//!
//! A pose is a 4×4 rigid transform in the device's local AR world space,
//! stored column-major. Each column is kept in the conventional
//! `(x, y, z, w)` component order in memory; the wire codec is responsible
//! for the `(w, x, y, z)` ordering used on the network (see [`crate::protocol`]).

/// 4×4 column-major transform: `columns[c][r]`, `r` in `x, y, z, w` order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    columns: [[f32; 4]; 4],
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        columns: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    /// Build from four columns, each in `(x, y, z, w)` order.
    pub const fn from_columns(columns: [[f32; 4]; 4]) -> Self {
        Self { columns }
    }

    /// Identity rotation with the given translation in the fourth column.
    pub fn from_translation(x: f32, y: f32, z: f32) -> Self {
        let mut pose = Self::IDENTITY;
        pose.columns[3] = [x, y, z, 1.0];
        pose
    }

    /// Columns in `(x, y, z, w)` order.
    pub fn columns(&self) -> &[[f32; 4]; 4] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<[f32; 4]> {
        self.columns.get(index).copied()
    }

    /// Translation component (x, y, z of the fourth column).
    pub fn translation(&self) -> [f32; 3] {
        let c = self.columns[3];
        [c[0], c[1], c[2]]
    }

    /// Whether every component is finite (no NaN or infinity).
    pub fn is_finite(&self) -> bool {
        self.columns.iter().flatten().all(|v| v.is_finite())
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}
