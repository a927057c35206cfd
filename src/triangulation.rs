//! Polygon triangulation for iso-surface loops with more than three
//! vertices: a dynamic program minimizing total triangle area.

use crate::Real;
use na::Point3;

fn triangle_area(a: &Point3<Real>, b: &Point3<Real>, c: &Point3<Real>) -> Real {
    (b - a).cross(&(c - a)).norm() * 0.5
}

/// Triangulates the closed polygon `vertices[0..n]` (in order) with minimal
/// total area. Returned triangles index into `vertices` and preserve the
/// polygon's winding.
pub fn minimal_area_triangulation(vertices: &[Point3<Real>]) -> Vec<[usize; 3]> {
    let n = vertices.len();
    if n < 3 {
        return vec![];
    }
    if n == 3 {
        return vec![[0, 1, 2]];
    }

    // best[i][j]: minimal area of triangulating the fan between vertices i
    // and j (along increasing indices); mid[i][j] the apex realizing it.
    let idx = |i: usize, j: usize| i * n + j;
    let mut best = vec![0.0; n * n];
    let mut mid = vec![usize::MAX; n * n];
    for gap in 2..n {
        for i in 0..n - gap {
            let j = i + gap;
            let mut best_area = Real::INFINITY;
            let mut best_mid = i + 1;
            for k in i + 1..j {
                let area = triangle_area(&vertices[i], &vertices[k], &vertices[j])
                    + best[idx(i, k)]
                    + best[idx(k, j)];
                if area < best_area {
                    best_area = area;
                    best_mid = k;
                }
            }
            best[idx(i, j)] = best_area;
            mid[idx(i, j)] = best_mid;
        }
    }

    let mut triangles = vec![];
    let mut stack = vec![(0, n - 1)];
    while let Some((i, j)) = stack.pop() {
        if j - i < 2 {
            continue;
        }
        let k = mid[idx(i, j)];
        triangles.push([i, k, j]);
        stack.push((i, k));
        stack.push((k, j));
    }
    triangles
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quad_becomes_two_triangles() {
        let quad = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let tris = minimal_area_triangulation(&quad);
        assert_eq!(tris.len(), 2);
        let area: Real = tris
            .iter()
            .map(|t| triangle_area(&quad[t[0]], &quad[t[1]], &quad[t[2]]))
            .sum();
        assert!((area - 1.0).abs() < 1.0e-12);
    }

    #[test]
    fn bent_pentagon_area_is_minimal() {
        // A non-planar pentagon: the minimal-area triangulation beats the
        // worst fan.
        let poly = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.5, 1.0, 0.8),
            Point3::new(0.5, 1.6, 0.0),
            Point3::new(-0.5, 1.0, 0.8),
        ];
        let tris = minimal_area_triangulation(&poly);
        assert_eq!(tris.len(), 3);
        let best: Real = tris
            .iter()
            .map(|t| triangle_area(&poly[t[0]], &poly[t[1]], &poly[t[2]]))
            .sum();
        // Compare against every fan rooted at each vertex.
        for root in 0..poly.len() {
            let mut fan = 0.0;
            for i in 1..poly.len() - 1 {
                let a = root;
                let b = (root + i) % poly.len();
                let c = (root + i + 1) % poly.len();
                fan += triangle_area(&poly[a], &poly[b], &poly[c]);
            }
            assert!(best <= fan + 1.0e-12);
        }
    }

    #[test]
    fn triangle_passthrough() {
        let tri = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        assert_eq!(minimal_area_triangulation(&tri), vec![[0, 1, 2]]);
    }
}
