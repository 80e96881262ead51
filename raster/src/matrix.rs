//! Ordered photon-count results of a raster scan.

use hardware::odmr::AcquisitionResult;
use ndarray::Array2;
use serde::Serialize;

use crate::grid::{Coordinate, RasterGrid};

/// A result together with the position it was measured at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    /// Position in microns
    pub coordinate: Coordinate,
    /// Measured count
    pub result: AcquisitionResult,
}

/// Photon counts in raster order.
///
/// Row `i` corresponds to `x_labels[i]`, column `j` to `y_labels[j]`. The
/// labels always describe the full grid. The rows are filled strictly in
/// visiting order, so an aborted scan holds a prefix of the raster: complete
/// rows followed by at most one partial row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMatrix {
    x_labels: Vec<f64>,
    y_labels: Vec<f64>,
    rows: Vec<Vec<AcquisitionResult>>,
}

impl ResultMatrix {
    /// Empty matrix labelled for `grid`.
    pub fn new(grid: &RasterGrid) -> Self {
        Self {
            x_labels: grid.xs().to_vec(),
            y_labels: grid.ys().to_vec(),
            rows: Vec::with_capacity(grid.xs().len()),
        }
    }

    /// Append the result for the next point in raster order.
    ///
    /// Returns the `(i, j)` index the result was stored at, or `None` if the
    /// matrix is already full.
    pub fn push(&mut self, result: AcquisitionResult) -> Option<(usize, usize)> {
        let ny = self.y_labels.len();
        if ny == 0 || self.is_complete() {
            return None;
        }
        match self.rows.last_mut() {
            Some(row) if row.len() < ny => row.push(result),
            _ => {
                let mut row = Vec::with_capacity(ny);
                row.push(result);
                self.rows.push(row);
            }
        }
        let i = self.rows.len() - 1;
        Some((i, self.rows[i].len() - 1))
    }

    /// Row labels (X positions, µm).
    pub fn x_labels(&self) -> &[f64] {
        &self.x_labels
    }

    /// Column labels (Y positions, µm).
    pub fn y_labels(&self) -> &[f64] {
        &self.y_labels
    }

    /// Filled rows.
    pub fn rows(&self) -> &[Vec<AcquisitionResult>] {
        &self.rows
    }

    /// Full grid dimensions `(len(xs), len(ys))`.
    pub fn shape(&self) -> (usize, usize) {
        (self.x_labels.len(), self.y_labels.len())
    }

    /// Number of cells filled so far.
    pub fn filled(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    /// Whether every cell of the grid has a result.
    pub fn is_complete(&self) -> bool {
        let (nx, ny) = self.shape();
        self.filled() == nx * ny
    }

    /// Number of filled cells without a valid count.
    pub fn invalid_count(&self) -> usize {
        self.rows.iter().flatten().filter(|r| !r.valid).count()
    }

    /// Result at `(i, j)`, if that cell has been filled.
    pub fn get(&self, i: usize, j: usize) -> Option<&AcquisitionResult> {
        self.rows.get(i)?.get(j)
    }

    /// Result at `(i, j)` with its coordinate.
    pub fn cell(&self, i: usize, j: usize) -> Option<Cell> {
        let result = *self.get(i, j)?;
        Some(Cell {
            coordinate: Coordinate {
                x: self.x_labels[i],
                y: self.y_labels[j],
            },
            result,
        })
    }

    /// Dense count array over the full grid; invalid or unfilled cells are 0.
    pub fn counts(&self) -> Array2<u64> {
        Array2::from_shape_fn(self.shape(), |(i, j)| {
            self.get(i, j).map_or(0, |r| r.photon_count)
        })
    }

    /// Dense mask over the full grid; true where a valid count exists.
    pub fn valid_mask(&self) -> Array2<bool> {
        Array2::from_shape_fn(self.shape(), |(i, j)| {
            self.get(i, j).is_some_and(|r| r.valid)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> RasterGrid {
        RasterGrid::new(vec![0.0, 1.0], vec![5.0, 6.0, 7.0])
    }

    #[test]
    fn test_push_fills_in_raster_order() {
        let mut m = ResultMatrix::new(&grid());
        let mut indices = Vec::new();
        for n in 0..6 {
            indices.push(m.push(AcquisitionResult::counted(n)).unwrap());
        }
        assert_eq!(
            indices,
            vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]
        );
        assert!(m.is_complete());
        assert_eq!(m.push(AcquisitionResult::counted(99)), None);
        assert_eq!(m.get(1, 0), Some(&AcquisitionResult::counted(3)));
    }

    #[test]
    fn test_cell_carries_coordinate() {
        let mut m = ResultMatrix::new(&grid());
        for n in 0..5 {
            m.push(AcquisitionResult::counted(n));
        }
        let cell = m.cell(1, 1).unwrap();
        assert_eq!(cell.coordinate, Coordinate { x: 1.0, y: 6.0 });
        assert_eq!(cell.result.photon_count, 4);
        assert_eq!(m.cell(1, 2), None);
    }

    #[test]
    fn test_partial_matrix_dense_views() {
        let mut m = ResultMatrix::new(&grid());
        m.push(AcquisitionResult::counted(10));
        m.push(AcquisitionResult::invalid());
        m.push(AcquisitionResult::counted(30));
        m.push(AcquisitionResult::counted(40));

        assert!(!m.is_complete());
        assert_eq!(m.filled(), 4);
        assert_eq!(m.invalid_count(), 1);

        let counts = m.counts();
        assert_eq!(counts.shape(), &[2, 3]);
        assert_eq!(counts[[0, 0]], 10);
        assert_eq!(counts[[0, 1]], 0);
        assert_eq!(counts[[1, 0]], 40);
        assert_eq!(counts[[1, 2]], 0);

        let mask = m.valid_mask();
        assert!(mask[[0, 0]]);
        assert!(!mask[[0, 1]]);
        assert!(!mask[[1, 1]]);
    }

    #[test]
    fn test_labels_cover_full_grid() {
        let m = ResultMatrix::new(&grid());
        assert_eq!(m.x_labels(), &[0.0, 1.0]);
        assert_eq!(m.y_labels(), &[5.0, 6.0, 7.0]);
        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m.filled(), 0);
    }
}
