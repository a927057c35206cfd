use crate::Real;
use na::{Point3, Vector3};

/// A restartable stream of oriented samples in world coordinates.
///
/// The reconstruction reads the stream twice (once for bounds, once for
/// splatting) plus once more when density estimation is enabled, calling
/// [`PointStream::reset`] between passes.
pub trait PointStream {
    fn next_point(&mut self) -> Option<(Point3<Real>, Vector3<Real>)>;
    fn reset(&mut self);
}

/// A stream over point/normal slices held in memory.
pub struct SlicePointStream<'a> {
    points: &'a [Point3<Real>],
    normals: &'a [Vector3<Real>],
    cursor: usize,
}

impl<'a> SlicePointStream<'a> {
    pub fn new(points: &'a [Point3<Real>], normals: &'a [Vector3<Real>]) -> Self {
        assert_eq!(
            points.len(),
            normals.len(),
            "Exactly one normal per point must be provided."
        );
        Self {
            points,
            normals,
            cursor: 0,
        }
    }
}

impl PointStream for SlicePointStream<'_> {
    fn next_point(&mut self) -> Option<(Point3<Real>, Vector3<Real>)> {
        let i = self.cursor;
        if i < self.points.len() {
            self.cursor += 1;
            Some((self.points[i], self.normals[i]))
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_restarts() {
        let points = vec![Point3::origin(), Point3::new(1.0, 0.0, 0.0)];
        let normals = vec![Vector3::y(), Vector3::z()];
        let mut stream = SlicePointStream::new(&points, &normals);
        assert_eq!(stream.next_point().unwrap().0, points[0]);
        assert_eq!(stream.next_point().unwrap().0, points[1]);
        assert!(stream.next_point().is_none());
        stream.reset();
        assert_eq!(stream.next_point().unwrap().1, normals[0]);
    }
}
