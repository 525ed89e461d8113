//! Geographic namespace covering.
//!
//! Geohash math itself lives outside the core behind the [`Geohasher`]
//! trait; this module only decides *which* cells to enroll in. A peer near
//! a cell boundary enrolls in the center cell plus every cardinal neighbor
//! whose boundary lies within [`NEIGHBOR_THRESHOLD_M`], so two peers on
//! opposite sides of a boundary always share at least one namespace. The
//! effective discovery reach works out to roughly one precision-7 cell
//! (~150 m) around the peer.

use std::f64::consts::PI;

/// Geohash precision used for proximity namespaces.
pub const GEO_PRECISION: u32 = 7;

/// Distance to a cell boundary below which the adjacent cell is enrolled.
///
/// Peers with different thresholds can miss each other across a boundary;
/// the value is part of the peer contract.
pub const NEIGHBOR_THRESHOLD_M: f64 = 50.0;

/// Meters per degree of latitude.
const M_PER_DEG_LAT: f64 = 111_320.0;

/// Cardinal directions for neighbor lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Increasing latitude.
    North,
    /// Decreasing latitude.
    South,
    /// Increasing longitude.
    East,
    /// Decreasing longitude.
    West,
}

/// Latitude/longitude extent of one cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellBounds {
    /// Southern edge.
    pub min_lat: f64,
    /// Northern edge.
    pub max_lat: f64,
    /// Western edge.
    pub min_lon: f64,
    /// Eastern edge.
    pub max_lon: f64,
}

/// External geohash implementation.
pub trait Geohasher: Send + Sync {
    /// Encode a position into a cell id at the given precision.
    fn encode(&self, lat: f64, lon: f64, precision: u32) -> String;
    /// The lat/lon extent of a cell.
    fn bounds(&self, cell: &str) -> Option<CellBounds>;
    /// The adjacent cell in a cardinal direction.
    fn neighbor(&self, cell: &str, direction: Direction) -> Option<String>;
}

/// Approximate edge length of a cell at the given precision, in meters.
///
/// Uses the bit-count formula (5 bits per character, split between the
/// axes); precision 7 lands near 153 m.
pub fn cell_size_meters(precision: u32) -> f64 {
    let lat_bits = (5 * precision) / 2;
    let height_deg = 180.0 / 2f64.powi(lat_bits as i32);
    height_deg * M_PER_DEG_LAT
}

/// The covering set for a position: center cell plus every cardinal
/// neighbor whose shared boundary is within [`NEIGHBOR_THRESHOLD_M`].
///
/// Returns 1–5 unique cells, center first.
pub fn covering_cells(hasher: &dyn Geohasher, lat: f64, lon: f64) -> Vec<String> {
    let center = hasher.encode(lat, lon, GEO_PRECISION);
    let mut cells = vec![center.clone()];

    let Some(bounds) = hasher.bounds(&center) else {
        return cells;
    };
    let m_per_deg_lon = M_PER_DEG_LAT * (lat * PI / 180.0).cos().abs().max(1e-6);

    let candidates = [
        (Direction::North, (bounds.max_lat - lat) * M_PER_DEG_LAT),
        (Direction::South, (lat - bounds.min_lat) * M_PER_DEG_LAT),
        (Direction::East, (bounds.max_lon - lon) * m_per_deg_lon),
        (Direction::West, (lon - bounds.min_lon) * m_per_deg_lon),
    ];

    for (direction, distance) in candidates {
        if distance <= NEIGHBOR_THRESHOLD_M {
            if let Some(neighbor) = hasher.neighbor(&center, direction) {
                if !cells.contains(&neighbor) {
                    cells.push(neighbor);
                }
            }
        }
    }
    cells
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Flat square grid with precision-7-sized cells, for tests.
    pub struct GridHasher {
        pub cell_deg: f64,
    }

    impl GridHasher {
        pub fn new() -> Self {
            Self {
                cell_deg: cell_size_meters(GEO_PRECISION) / M_PER_DEG_LAT,
            }
        }

        fn parse(&self, cell: &str) -> Option<(i64, i64)> {
            let (y, x) = cell.strip_prefix("g:")?.split_once(':')?;
            Some((y.parse().ok()?, x.parse().ok()?))
        }
    }

    impl Geohasher for GridHasher {
        fn encode(&self, lat: f64, lon: f64, _precision: u32) -> String {
            let y = (lat / self.cell_deg).floor() as i64;
            let x = (lon / self.cell_deg).floor() as i64;
            format!("g:{y}:{x}")
        }

        fn bounds(&self, cell: &str) -> Option<CellBounds> {
            let (y, x) = self.parse(cell)?;
            Some(CellBounds {
                min_lat: y as f64 * self.cell_deg,
                max_lat: (y + 1) as f64 * self.cell_deg,
                min_lon: x as f64 * self.cell_deg,
                max_lon: (x + 1) as f64 * self.cell_deg,
            })
        }

        fn neighbor(&self, cell: &str, direction: Direction) -> Option<String> {
            let (y, x) = self.parse(cell)?;
            let (y, x) = match direction {
                Direction::North => (y + 1, x),
                Direction::South => (y - 1, x),
                Direction::East => (y, x + 1),
                Direction::West => (y, x - 1),
            };
            Some(format!("g:{y}:{x}"))
        }
    }

    #[test]
    fn test_cell_size_precision_7() {
        let size = cell_size_meters(GEO_PRECISION);
        assert!((150.0..160.0).contains(&size), "unexpected size {size}");
    }

    #[test]
    fn test_cell_center_enrolls_alone() {
        // Mid-cell, every boundary is ~76 m away: just the center cell.
        let hasher = GridHasher::new();
        let cell_deg = hasher.cell_deg;
        let cells = covering_cells(&hasher, cell_deg * 10.5, cell_deg * 20.5);
        assert_eq!(cells, vec!["g:10:20".to_string()]);
    }

    #[test]
    fn test_near_boundary_enrolls_in_two() {
        let hasher = GridHasher::new();
        let cell_deg = hasher.cell_deg;
        let boundary_lat = cell_deg * 11.0;
        // 10 m south of the northern boundary, centered in longitude.
        let cells = covering_cells(
            &hasher,
            boundary_lat - 10.0 / M_PER_DEG_LAT,
            cell_deg * 20.5,
        );
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0], "g:10:20");
        assert_eq!(cells[1], "g:11:20");
    }

    #[test]
    fn test_boundary_peers_share_a_cell() {
        let hasher = GridHasher::new();
        let cell_deg = hasher.cell_deg;
        let boundary_lat = cell_deg * 11.0;
        let lon = cell_deg * 20.5;

        // 10 m south of the boundary: own cell + northern neighbor.
        let a = covering_cells(&hasher, boundary_lat - 10.0 / M_PER_DEG_LAT, lon);
        // 100 m north of the boundary: far enough from every edge, 1 cell.
        let b = covering_cells(&hasher, boundary_lat + 100.0 / M_PER_DEG_LAT, lon);

        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        let common: Vec<_> = a.iter().filter(|c| b.contains(c)).collect();
        assert_eq!(common, vec![&"g:11:20".to_string()]);
    }

    #[test]
    fn test_corner_enrolls_in_three() {
        let hasher = GridHasher::new();
        let cell_deg = hasher.cell_deg;
        // 10 m from both the northern and eastern boundaries.
        let cells = covering_cells(
            &hasher,
            cell_deg * 11.0 - 10.0 / M_PER_DEG_LAT,
            cell_deg * 21.0 - 10.0 / M_PER_DEG_LAT,
        );
        assert_eq!(cells.len(), 3);
    }

    #[test]
    fn test_covering_bounds() {
        let hasher = GridHasher::new();
        let cell_deg = hasher.cell_deg;
        for frac in [0.01, 0.25, 0.5, 0.75, 0.99] {
            let cells = covering_cells(&hasher, cell_deg * (5.0 + frac), cell_deg * 3.3);
            assert!((1..=5).contains(&cells.len()));
            let mut unique = cells.clone();
            unique.dedup();
            assert_eq!(unique.len(), cells.len());
        }
    }
}
