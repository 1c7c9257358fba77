//! Anchor tables, computed once per trace and embedded as constants.
use crate::internal::*;
use mo_ndarray::{Array2, Axis, concatenate};

/// Per-level anchor shapes: `sizes[l] x aspect_ratios[l]` boxes centered on
/// each cell of the level's feature grid.
#[derive(Clone, Debug, PartialEq)]
pub struct AnchorGenerator {
    pub sizes: Vec<TVec<f32>>,
    pub aspect_ratios: Vec<TVec<f32>>,
}

impl Default for AnchorGenerator {
    fn default() -> AnchorGenerator {
        AnchorGenerator {
            sizes: [32., 64., 128., 256., 512.].iter().map(|&s| tvec!(s)).collect(),
            aspect_ratios: vec![tvec!(0.5, 1.0, 2.0); 5],
        }
    }
}

impl AnchorGenerator {
    pub fn levels(&self) -> usize {
        self.sizes.len()
    }

    pub fn num_anchors_per_location(&self) -> Vec<usize> {
        self.sizes.iter().zip(&self.aspect_ratios).map(|(s, r)| s.len() * r.len()).collect()
    }

    /// Zero-centered `[x0, y0, x1, y1]` anchors of one level, aspect ratio
    /// major, rounded half to even.
    pub fn cell_anchors(sizes: &[f32], aspect_ratios: &[f32]) -> Array2<f32> {
        let mut anchors = Array2::zeros((sizes.len() * aspect_ratios.len(), 4));
        for (ix, (ratio, size)) in aspect_ratios.iter().cartesian_product(sizes).enumerate() {
            let h_ratio = ratio.sqrt();
            let w = size / h_ratio;
            let h = size * h_ratio;
            for (c, v) in [-w, -h, w, h].into_iter().enumerate() {
                anchors[(ix, c)] = (v / 2.0).round_ties_even();
            }
        }
        anchors
    }

    /// All anchors of all levels, in absolute image coordinates, one row per
    /// anchor: levels in order, then grid rows, grid columns, cell anchors.
    pub fn grid_anchors(&self, image: (usize, usize), grids: &[(usize, usize)]) -> MoResult<Array2<f32>> {
        ensure!(
            grids.len() == self.levels(),
            "{} feature maps for {} anchor levels",
            grids.len(),
            self.levels()
        );
        ensure!(self.aspect_ratios.len() == self.levels(), "Anchor sizes and aspect ratios disagree");
        let mut levels = vec![];
        for (level, &(grid_h, grid_w)) in grids.iter().enumerate() {
            ensure!(grid_h > 0 && grid_w > 0, "Empty feature map at level {}", level);
            let (stride_h, stride_w) = ((image.0 / grid_h) as f32, (image.1 / grid_w) as f32);
            let cell = Self::cell_anchors(&self.sizes[level], &self.aspect_ratios[level]);
            let per_cell = cell.nrows();
            let mut anchors = Array2::zeros((grid_h * grid_w * per_cell, 4));
            for (y, x) in (0..grid_h).cartesian_product(0..grid_w) {
                let shift = [x as f32 * stride_w, y as f32 * stride_h];
                for a in 0..per_cell {
                    let row = (y * grid_w + x) * per_cell + a;
                    for c in 0..4 {
                        anchors[(row, c)] = cell[(a, c)] + shift[c % 2];
                    }
                }
            }
            levels.push(anchors);
        }
        let views = levels.iter().map(|l| l.view()).collect_vec();
        Ok(concatenate(Axis(0), &views)?)
    }

    /// Anchors scaled to `[0, 1]` by the image width and height.
    pub fn normalized_anchors(&self, image: (usize, usize), grids: &[(usize, usize)]) -> MoResult<Array2<f32>> {
        let mut anchors = self.grid_anchors(image, grids)?;
        let (h, w) = (image.0 as f32, image.1 as f32);
        for mut row in anchors.rows_mut() {
            row[0] /= w;
            row[1] /= h;
            row[2] /= w;
            row[3] /= h;
        }
        Ok(anchors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn cell_anchors_round_half_even() {
        let cell = AnchorGenerator::cell_anchors(&[32.], &[0.5, 1.0, 2.0]);
        assert_eq!(cell.nrows(), 3);
        assert_eq!(cell.row(1).to_vec(), vec![-16., -16., 16., 16.]);
        // 32 / sqrt(0.5) / 2 = 22.627
        assert_eq!(cell.row(0).to_vec(), vec![-23., -11., 23., 11.]);
        assert_eq!(cell.row(2).to_vec(), vec![-11., -23., 11., 23.]);
    }

    #[test]
    fn grid_layout() {
        let generator = AnchorGenerator { sizes: vec![tvec!(8.)], aspect_ratios: vec![tvec!(1.0)] };
        let anchors = generator.grid_anchors((16, 16), &[(2, 2)]).unwrap();
        assert_eq!(anchors.nrows(), 4);
        assert_eq!(anchors.row(1).to_vec(), vec![4., -4., 12., 4.]);
        assert_eq!(anchors.row(2).to_vec(), vec![-4., 4., 4., 12.]);
    }

    #[test]
    fn normalized() {
        let generator = AnchorGenerator { sizes: vec![tvec!(8.), tvec!(16.)], aspect_ratios: vec![tvec!(1.0); 2] };
        let anchors = generator.normalized_anchors((32, 64), &[(4, 8), (2, 4)]).unwrap();
        assert_eq!(anchors.nrows(), 32 + 8);
        let last = anchors.row(39);
        assert_abs_diff_eq!(last[0], (48. - 8.) / 64., epsilon = 1e-6);
        assert_abs_diff_eq!(last[1], (16. - 8.) / 32., epsilon = 1e-6);
        assert_abs_diff_eq!(last[2], (48. + 8.) / 64., epsilon = 1e-6);
        assert_abs_diff_eq!(last[3], (16. + 8.) / 32., epsilon = 1e-6);
    }

    #[test]
    fn level_count_mismatch() {
        assert!(AnchorGenerator::default().grid_anchors((64, 64), &[(8, 8)]).is_err());
        assert_eq!(AnchorGenerator::default().num_anchors_per_location(), vec![3; 5]);
    }
}
