/// 3D affine transform as a 3x4 matrix (row-major, last column is the
/// translation part). Canvas-to-screen and source-to-global transforms are
/// composed and inverted through this type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform3d {
    m: [[f64; 4]; 3],
}

impl Default for AffineTransform3d {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform3d {
    pub fn identity() -> Self {
        Self {
            m: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
        }
    }

    pub fn scaling(scale_x: f64, scale_y: f64, scale_z: f64) -> Self {
        Self {
            m: [
                [scale_x, 0.0, 0.0, 0.0],
                [0.0, scale_y, 0.0, 0.0],
                [0.0, 0.0, scale_z, 0.0],
            ],
        }
    }

    pub fn translation(tx: f64, ty: f64, tz: f64) -> Self {
        Self {
            m: [
                [1.0, 0.0, 0.0, tx],
                [0.0, 1.0, 0.0, ty],
                [0.0, 0.0, 1.0, tz],
            ],
        }
    }

    pub fn element(&self, row: usize, column: usize) -> f64 {
        self.m[row][column]
    }

    pub fn apply(&self, point: [f64; 3]) -> [f64; 3] {
        let mut result = [0.0; 3];
        for row in 0..3 {
            result[row] = self.m[row][0] * point[0]
                + self.m[row][1] * point[1]
                + self.m[row][2] * point[2]
                + self.m[row][3];
        }
        result
    }

    /// `self = self ∘ other`: the combined transform applies `other` first.
    pub fn concatenate(&mut self, other: &AffineTransform3d) {
        self.m = compose(&self.m, &other.m);
    }

    /// `self = other ∘ self`: the combined transform applies `self` first.
    pub fn pre_concatenate(&mut self, other: &AffineTransform3d) {
        self.m = compose(&other.m, &self.m);
    }

    /// Add a translation in target coordinates.
    pub fn translate(&mut self, tx: f64, ty: f64, tz: f64) {
        self.m[0][3] += tx;
        self.m[1][3] += ty;
        self.m[2][3] += tz;
    }

    /// Length of the image of a unit step along source axis `axis`. Used to
    /// estimate how many target pixels one source voxel covers.
    pub fn axis_scale(&self, axis: usize) -> f64 {
        let column = [self.m[0][axis], self.m[1][axis], self.m[2][axis]];
        (column[0] * column[0] + column[1] * column[1] + column[2] * column[2]).sqrt()
    }

    /// Returns `None` for (near-)singular transforms.
    pub fn invert(&self) -> Option<AffineTransform3d> {
        let m = &self.m;
        let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        if !det.is_finite() || det.abs() < f64::EPSILON {
            return None;
        }

        let inv_det = 1.0 / det;
        let mut inv = [[0.0; 4]; 3];
        inv[0][0] = (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det;
        inv[0][1] = (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det;
        inv[0][2] = (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det;
        inv[1][0] = (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det;
        inv[1][1] = (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det;
        inv[1][2] = (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det;
        inv[2][0] = (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det;
        inv[2][1] = (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det;
        inv[2][2] = (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det;

        // t' = -inv * t
        for row in 0..3 {
            inv[row][3] = -(inv[row][0] * m[0][3] + inv[row][1] * m[1][3] + inv[row][2] * m[2][3]);
        }
        Some(AffineTransform3d { m: inv })
    }
}

fn compose(first_applied_last: &[[f64; 4]; 3], first_applied: &[[f64; 4]; 3]) -> [[f64; 4]; 3] {
    let a = first_applied_last;
    let b = first_applied;
    let mut out = [[0.0; 4]; 3];
    for row in 0..3 {
        for col in 0..3 {
            out[row][col] =
                a[row][0] * b[0][col] + a[row][1] * b[1][col] + a[row][2] * b[2][col];
        }
        out[row][3] =
            a[row][0] * b[0][3] + a[row][1] * b[1][3] + a[row][2] * b[2][3] + a[row][3];
    }
    out
}
