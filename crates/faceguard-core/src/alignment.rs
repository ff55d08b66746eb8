//! Face alignment to the canonical ArcFace 112x112 crop.
//!
//! A 4-DOF similarity transform (scale, rotation, translation) is fitted
//! from the five detected landmarks to the InsightFace reference points by
//! least squares, then the image is warped with bilinear sampling.

use image::{Rgb, RgbImage};

/// InsightFace reference landmarks for a 112x112 crop.
const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + [tx; ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit over the point pairs; `None` if degenerate.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let (cx, cy) = src.iter().fold((0.0, 0.0), |(x, y), p| (x + p.0 / n, y + p.1 / n));
        let spread: f32 = src.iter().map(|p| (p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sum();
        if spread < 1e-6 {
            return None;
        }

        // Normal equations for unknowns [a, b, tx, ty].
        let mut ata = [[0.0f32; 4]; 4];
        let mut atb = [0.0f32; 4];
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            for (row, rhs) in [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)] {
                for j in 0..4 {
                    for k in 0..4 {
                        ata[j][k] += row[j] * row[k];
                    }
                    atb[j] += row[j] * rhs;
                }
            }
        }
        let [a, b, tx, ty] = solve(ata, atb)?;
        Some(Self { a, b, tx, ty })
    }

    /// Source point that lands on `(x, y)`.
    fn invert_point(self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some((
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        ))
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(mut m: [[f32; 4]; 4], mut rhs: [f32; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot = (col..4).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        m.swap(col, pivot);
        rhs.swap(col, pivot);
        if m[col][col].abs() < 1e-12 {
            return None;
        }
        for row in col + 1..4 {
            let factor = m[row][col] / m[col][col];
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = (i + 1..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Bilinear sample; outside the image reads as black.
fn sample(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let texel = |px: f32, py: f32| -> [f32; 3] {
        if px < 0.0 || py < 0.0 || px >= image.width() as f32 || py >= image.height() as f32 {
            return [0.0; 3];
        }
        let p = image.get_pixel(px as u32, py as u32);
        [p[0] as f32, p[1] as f32, p[2] as f32]
    };

    let (tl, tr) = (texel(x0, y0), texel(x0 + 1.0, y0));
    let (bl, br) = (texel(x0, y0 + 1.0), texel(x0 + 1.0, y0 + 1.0));
    Rgb(std::array::from_fn(|c| {
        let v = tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy;
        v.round().clamp(0.0, 255.0) as u8
    }))
}

/// Warp the face described by `landmarks` into a 112x112 ArcFace crop.
///
/// Returns `None` when the landmarks are degenerate (e.g. all coincident).
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> Option<RgbImage> {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS)?;
    Some(RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |x, y| {
        match transform.invert_point(x as f32, y as f32) {
            Some((sx, sy)) => sample(image, sx, sy),
            None => Rgb([0, 0, 0]),
        }
    }))
}
