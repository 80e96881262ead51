//! Raster grid generation.

use serde::{Deserialize, Serialize};

/// Sample position in microns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// X position (µm)
    pub x: f64,
    /// Y position (µm)
    pub y: f64,
}

/// Positions `start, start + step, ...` strictly below `stop`.
///
/// Positions are computed as `start + i * step` rather than accumulated, so
/// rounding error does not grow along the axis. Returns an empty vector if
/// `step` is not positive or `stop <= start`.
pub fn axis_positions(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let span = (stop - start) / step;
    if step <= 0.0 || !span.is_finite() || span <= 0.0 {
        return Vec::new();
    }
    (0..span.ceil() as usize)
        .map(|i| start + i as f64 * step)
        .collect()
}

/// The ordered set of positions a scan visits.
///
/// Points are visited x-major: for each X position every Y position in turn.
/// Matrix row `i` therefore holds X position `xs[i]` and column `j` holds
/// `ys[j]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterGrid {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

/// One visit of the raster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    /// Row (X index)
    pub i: usize,
    /// Column (Y index)
    pub j: usize,
    /// Position in microns
    pub coordinate: Coordinate,
}

impl RasterGrid {
    /// Build a grid from explicit axis positions.
    pub fn new(xs: Vec<f64>, ys: Vec<f64>) -> Self {
        Self { xs, ys }
    }

    /// X positions (row labels).
    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    /// Y positions (column labels).
    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    /// `(len(xs), len(ys))`
    pub fn shape(&self) -> (usize, usize) {
        (self.xs.len(), self.ys.len())
    }

    /// Total number of points.
    pub fn len(&self) -> usize {
        self.xs.len() * self.ys.len()
    }

    /// True if either axis is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Coordinate of cell `(i, j)`.
    pub fn coordinate(&self, i: usize, j: usize) -> Option<Coordinate> {
        Some(Coordinate {
            x: *self.xs.get(i)?,
            y: *self.ys.get(j)?,
        })
    }

    /// Extreme positions of the grid.
    pub fn corners(&self) -> Vec<(f64, f64)> {
        let ends = |v: &[f64]| match (v.first(), v.last()) {
            (Some(&a), Some(&b)) => vec![a, b],
            _ => Vec::new(),
        };
        let xs = ends(&self.xs);
        let ys = ends(&self.ys);
        xs.iter()
            .flat_map(|&x| ys.iter().map(move |&y| (x, y)))
            .collect()
    }

    /// Points in visiting order.
    pub fn points(&self) -> impl Iterator<Item = GridPoint> + '_ {
        self.xs.iter().enumerate().flat_map(move |(i, &x)| {
            self.ys.iter().enumerate().map(move |(j, &y)| GridPoint {
                i,
                j,
                coordinate: Coordinate { x, y },
            })
        })
    }
}
