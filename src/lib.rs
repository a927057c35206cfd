/*!
Screened Poisson surface reconstruction on an adaptive octree, after
[Kazhdan and Hoppe](https://www.cs.jhu.edu/~misha/MyPapers/ToG13.pdf).

Given an oriented point cloud sampled from a closed surface, the solver
computes an implicit indicator function over an octree refined around the
samples and extracts its iso-surface as a polygon mesh:

```no_run
use nalgebra::{Point3, Vector3};
use screened_poisson::{PoissonReconstruction, ReconstructionParams};

let points: Vec<Point3<f64>> = load_points();
let normals: Vec<Vector3<f64>> = load_normals();
let mut surface = PoissonReconstruction::from_points_and_normals(
    &points,
    &normals,
    ReconstructionParams {
        max_depth: 7,
        ..Default::default()
    },
)?;
let mesh = surface.reconstruct_mesh();
# fn load_points() -> Vec<Point3<f64>> { vec![] }
# fn load_normals() -> Vec<Vector3<f64>> { vec![] }
# Ok::<(), screened_poisson::ReconstructionError>(())
```
*/

#![allow(clippy::type_complexity, clippy::too_many_arguments)]
#![warn(missing_docs)]

/// Floating-point type used by this library.
pub type Real = f64;

pub(crate) const EPSILON: Real = 1.0e-6;

extern crate nalgebra as na;
extern crate parry3d_f64 as parry;

pub use self::bspline::BoundaryType;
pub use self::config::ReconstructionParams;
pub use self::error::ReconstructionError;
pub use self::mesh::{
    CoredMeshData, MeshSink, MeshVertex, PointIndex, ReconstructedMesh,
};
pub use self::poisson::PoissonReconstruction;
pub use self::stream::{PointStream, SlicePointStream};

mod bspline;
mod config;
mod conjugate_gradient;
mod cube;
mod error;
mod iso;
pub mod marching_cubes;
mod mesh;
mod octree;
mod operators;
mod poisson;
mod polynomial;
mod solver;
mod sorted_nodes;
mod splat;
mod stream;
mod triangulation;
