use std::collections::HashMap;

use crate::data::model::Detection;

/// Uniform bucket grid over a point set.
///
/// With a cell size at least as large as the search radius, every point
/// within the radius of a query lies in the query's cell or one of its
/// eight neighbours.
#[derive(Debug)]
pub struct SpatialGrid<'a> {
    cell: f64,
    buckets: HashMap<(i64, i64), Vec<&'a Detection>>,
}

impl<'a> SpatialGrid<'a> {
    /// `radius` must be finite and non-negative. A zero radius still needs a
    /// positive cell size; any positive value works.
    pub fn new(points: &'a [Detection], radius: f64) -> Self {
        // Slightly wider than the radius so rounding in the division can
        // never push a point at exactly `radius` two cells away.
        let cell = if radius > 0.0 { radius * (1.0 + 1e-9) } else { 1.0 };
        let mut buckets: HashMap<(i64, i64), Vec<&'a Detection>> = HashMap::new();
        for p in points {
            buckets.entry(cell_of(p.x, p.y, cell)).or_default().push(p);
        }
        SpatialGrid { cell, buckets }
    }

    /// Points in the 3×3 block of cells around `(x, y)`. A superset of the
    /// points within the radius; callers still check the distance.
    pub fn neighbours(&self, x: f64, y: f64) -> impl Iterator<Item = &'a Detection> + '_ {
        let (cx, cy) = cell_of(x, y, self.cell);
        (-1i64..=1)
            .flat_map(move |dx| (-1i64..=1).map(move |dy| (cx.saturating_add(dx), cy.saturating_add(dy))))
            .filter_map(move |c| self.buckets.get(&c))
            .flat_map(|bucket| bucket.iter().copied())
    }
}

fn cell_of(x: f64, y: f64, cell: f64) -> (i64, i64) {
    // `as` saturates for out-of-range floats.
    ((x / cell).floor() as i64, (y / cell).floor() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbours_cover_radius() {
        let pts: Vec<Detection> = vec![
            Detection::new(0, 0.0, 0.0),
            Detection::new(1, 4.9, 0.0),
            Detection::new(2, 20.0, 20.0),
            Detection::new(3, -4.0, -3.0),
        ];
        let grid = SpatialGrid::new(&pts, 5.0);
        let mut ids: Vec<usize> = grid.neighbours(0.0, 0.0).map(|d| d.id).collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 3]);
    }

    #[test]
    fn zero_radius_finds_coincident_points() {
        let pts = vec![Detection::new(0, 2.5, 2.5), Detection::new(1, 7.0, 7.0)];
        let grid = SpatialGrid::new(&pts, 0.0);
        let ids: Vec<usize> = grid.neighbours(2.5, 2.5).map(|d| d.id).collect();
        assert_eq!(ids, vec![0]);
    }
}
