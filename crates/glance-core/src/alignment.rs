//! Face alignment to the canonical ArcFace crop.
//!
//! Estimates a 4-DOF similarity transform (scale, rotation, translation) from
//! the five detected landmarks to the InsightFace reference positions, then
//! warps the face into a 112×112 crop.

use image::GrayImage;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub(crate) const ALIGNED_SIZE: u32 = 112;

/// Align a detected face to the canonical 112×112 crop.
pub(crate) fn align_face(image: &GrayImage, landmarks: &[(f32, f32); 5]) -> GrayImage {
    Similarity::estimate(landmarks, &REFERENCE_LANDMARKS).warp(image, ALIGNED_SIZE)
}

/// Similarity transform with matrix form:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
#[derive(Debug, Clone, Copy)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares estimate of the transform mapping `src` points onto `dst`.
    ///
    /// Each point pair contributes two equations:
    ///   sx * a - sy * b + tx = dx
    ///   sy * a + sx * b + ty = dy
    /// which form the normal equations solved below.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let mut ata = [[0.0f32; 4]; 4];
        let mut atb = [0.0f32; 4];

        for i in 0..5 {
            let (sx, sy) = src[i];
            let (dx, dy) = dst[i];

            let r1 = [sx, -sy, 1.0, 0.0];
            let r2 = [sy, sx, 0.0, 1.0];

            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
                }
                atb[j] += r1[j] * dx + r2[j] * dy;
            }
        }

        let [a, b, tx, ty] = solve_4x4(&ata, &atb);
        Self { a, b, tx, ty }
    }

    /// Warp `image` into a `size`×`size` output by inverse mapping every output
    /// pixel back into the source and sampling bilinearly. Out-of-bounds
    /// samples read as black.
    fn warp(&self, image: &GrayImage, size: u32) -> GrayImage {
        // The 2×2 part [[a, -b], [b, a]] inverts to [[a, b], [-b, a]] / det.
        let det = self.a * self.a + self.b * self.b;
        if det.abs() < 1e-12 {
            return GrayImage::new(size, size);
        }

        GrayImage::from_fn(size, size, |ox, oy| {
            let dx = ox as f32 - self.tx;
            let dy = oy as f32 - self.ty;
            let sx = (self.a * dx + self.b * dy) / det;
            let sy = (self.a * dy - self.b * dx) / det;
            image::Luma([bilinear(image, sx, sy)])
        })
    }
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
fn solve_4x4(ata: &[[f32; 4]; 4], atb: &[f32; 4]) -> [f32; 4] {
    // Augmented matrix [A | b]
    let mut m = [[0.0f32; 5]; 4];
    for (i, row) in ata.iter().enumerate() {
        m[i][..4].copy_from_slice(row);
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut pivot_row = col;
        for row in (col + 1)..4 {
            if m[row][col].abs() > m[pivot_row][col].abs() {
                pivot_row = row;
            }
        }
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0]; // degenerate landmarks; identity-ish fallback
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Bilinear sample at a fractional position; outside the image reads 0.
fn bilinear(image: &GrayImage, x: f32, y: f32) -> u8 {
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let sample = |px: i64, py: i64| -> f32 {
        if px >= 0 && py >= 0 && (px as u32) < image.width() && (py as u32) < image.height() {
            image.get_pixel(px as u32, py as u32).0[0] as f32
        } else {
            0.0
        }
    };

    let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + sample(x0 + 1, y0) * fx * (1.0 - fy)
        + sample(x0, y0 + 1) * (1.0 - fx) * fy
        + sample(x0 + 1, y0 + 1) * fx * fy;

    val.round().clamp(0.0, 255.0) as u8
}
