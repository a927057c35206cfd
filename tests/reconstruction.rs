use nalgebra::{Point3, Vector3};
use screened_poisson::{
    BoundaryType, PoissonReconstruction, ReconstructedMesh, ReconstructionParams,
};
use std::collections::HashMap;

// Counts how many polygons share each undirected mesh edge.
fn edge_use_counts(mesh: &ReconstructedMesh) -> HashMap<(usize, usize), usize> {
    let mut counts = HashMap::new();
    for poly in &mesh.polygons {
        for k in 0..poly.len() {
            let a = poly[k];
            let b = poly[(k + 1) % poly.len()];
            *counts.entry((a.min(b), a.max(b))).or_insert(0) += 1;
        }
    }
    counts
}

// A deterministic, evenly distributed point cloud on a sphere.
fn sphere_cloud(
    n: usize,
    radius: f64,
    center: Point3<f64>,
) -> (Vec<Point3<f64>>, Vec<Vector3<f64>>) {
    let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
    let mut points = Vec::with_capacity(n);
    let mut normals = Vec::with_capacity(n);
    for i in 0..n {
        let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
        let r = (1.0 - y * y).sqrt();
        let theta = golden * i as f64;
        let dir = Vector3::new(theta.cos() * r, y, theta.sin() * r);
        points.push(center + dir * radius);
        normals.push(dir);
    }
    (points, normals)
}

fn sphere_params(max_depth: usize) -> ReconstructionParams {
    ReconstructionParams {
        max_depth,
        splat_depth: max_depth.saturating_sub(2),
        constraint_weight: 0.0,
        ..Default::default()
    }
}

#[test]
fn sphere_reconstruction_is_plausible() {
    let (points, normals) = sphere_cloud(8000, 0.5, Point3::origin());
    let mut surface =
        PoissonReconstruction::from_points_and_normals(&points, &normals, sphere_params(5))
            .unwrap();
    let mesh = surface.reconstruct_mesh();

    assert!(!mesh.vertices.is_empty());
    assert!(!mesh.polygons.is_empty());
    for poly in &mesh.polygons {
        assert!(poly.len() >= 3);
        for &i in poly {
            assert!(i < mesh.vertices.len(), "polygon references a missing vertex");
        }
    }

    // Vertices concentrate on the sampled sphere.
    let mean_deviation: f64 = mesh
        .vertices
        .iter()
        .map(|v| (v.point.coords.norm() - 0.5).abs())
        .sum::<f64>()
        / mesh.vertices.len() as f64;
    assert!(
        mean_deviation < 0.08,
        "mean radial deviation too large: {mean_deviation}"
    );
    for v in &mesh.vertices {
        assert!(
            v.point.coords.norm() < 0.8,
            "vertex far outside the input: {:?}",
            v.point
        );
    }
}

#[test]
fn implicit_function_separates_inside_from_outside() {
    let (points, normals) = sphere_cloud(6000, 0.35, Point3::origin());
    let mut params = sphere_params(5);
    // Widen the domain so there is room clearly outside the surface.
    params.scale_factor = 1.5;
    let surface =
        PoissonReconstruction::from_points_and_normals(&points, &normals, params).unwrap();

    let inside = surface.eval(&Point3::origin());
    // Still inside the solver domain, three cells past the surface.
    let outside = surface.eval(&Point3::new(0.45, 0.0, 0.0));
    assert!(
        inside * outside < 0.0,
        "no sign change across the surface: inside {inside}, outside {outside}"
    );

    // The gradient near the surface points along the radial direction.
    let g = surface.eval_gradient(&Point3::new(0.35, 0.0, 0.0));
    assert!(
        g.x.abs() > g.y.abs() && g.x.abs() > g.z.abs(),
        "gradient not radial at the surface: {g:?}"
    );
}

#[test]
fn reconstruction_is_deterministic() {
    let (points, normals) = sphere_cloud(4000, 0.45, Point3::origin());
    let run = || {
        let mut surface = PoissonReconstruction::from_points_and_normals(
            &points,
            &normals,
            sphere_params(5),
        )
        .unwrap();
        surface.reconstruct_mesh()
    };
    let a = run();
    let b = run();
    assert_eq!(a.vertices.len(), b.vertices.len());
    assert_eq!(a.polygons, b.polygons);
    for (va, vb) in a.vertices.iter().zip(&b.vertices) {
        assert_eq!(va.point, vb.point);
    }
}

#[test]
fn transformed_input_moves_the_mesh() {
    let (points, normals) = sphere_cloud(4000, 0.45, Point3::origin());
    let plain = {
        let mut s =
            PoissonReconstruction::from_points_and_normals(&points, &normals, sphere_params(5))
                .unwrap();
        s.reconstruct_mesh()
    };
    let shifted = {
        let mut params = sphere_params(5);
        params.x_form = nalgebra::Matrix4::new_translation(&Vector3::new(10.0, 0.0, 0.0));
        let mut s =
            PoissonReconstruction::from_points_and_normals(&points, &normals, params).unwrap();
        s.reconstruct_mesh()
    };
    // The normalized problem only changes by rounding, so the meshes agree
    // up to the translation (allow a little slack for borderline corners).
    let count_delta = plain.vertices.len().abs_diff(shifted.vertices.len());
    assert!(
        count_delta * 100 <= plain.vertices.len(),
        "vertex counts diverged: {} vs {}",
        plain.vertices.len(),
        shifted.vertices.len()
    );
    let centroid = |mesh: &screened_poisson::ReconstructedMesh| {
        mesh.vertices
            .iter()
            .fold(Vector3::zeros(), |acc, v| acc + v.point.coords)
            / mesh.vertices.len() as f64
    };
    let delta = centroid(&shifted) - centroid(&plain);
    assert!((delta.x - 10.0).abs() < 1.0e-2, "centroid shift {delta:?}");
    assert!(delta.y.abs() < 1.0e-2);
    assert!(delta.z.abs() < 1.0e-2);
}

#[test]
fn two_disjoint_spheres_give_two_components() {
    let (mut points, mut normals) = sphere_cloud(4000, 0.3, Point3::new(-0.8, 0.0, 0.0));
    let (p2, n2) = sphere_cloud(4000, 0.3, Point3::new(0.8, 0.0, 0.0));
    points.extend(p2);
    normals.extend(n2);

    let mut surface =
        PoissonReconstruction::from_points_and_normals(&points, &normals, sphere_params(5))
            .unwrap();
    let mesh = surface.reconstruct_mesh();
    assert!(!mesh.polygons.is_empty());

    // Union-find over shared vertices.
    let mut parent: Vec<usize> = (0..mesh.vertices.len()).collect();
    fn find(parent: &mut Vec<usize>, mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }
    for poly in &mesh.polygons {
        for w in poly.windows(2) {
            let (a, b) = (find(&mut parent, w[0]), find(&mut parent, w[1]));
            parent[a] = b;
        }
    }
    let mut sizes: std::collections::HashMap<usize, usize> = Default::default();
    for poly in &mesh.polygons {
        let root = find(&mut parent, poly[0]);
        *sizes.entry(root).or_insert(0) += 1;
    }
    let mut counts: Vec<usize> = sizes.values().copied().collect();
    counts.sort_unstable_by(|a, b| b.cmp(a));
    let substantial = counts.iter().filter(|&&c| c > 20).count();
    assert_eq!(
        substantial, 2,
        "expected two substantial components, got sizes {counts:?}"
    );
    // The two spheres carry almost all polygons.
    let covered: usize = counts.iter().take(2).sum();
    assert!(covered * 100 >= mesh.polygons.len() * 95);
}

#[test]
fn screening_cuts_sphere_deviation_by_a_fifth() {
    // Turning the screening weight on for the sphere input must reduce the
    // mean absolute radial deviation by at least 20%.
    let (points, normals) = sphere_cloud(40_000, 0.5, Point3::origin());
    let deviation = |constraint_weight: f64| {
        let params = ReconstructionParams {
            max_depth: 7,
            splat_depth: 5,
            constraint_weight,
            ..Default::default()
        };
        let mut s =
            PoissonReconstruction::from_points_and_normals(&points, &normals, params).unwrap();
        let mesh = s.reconstruct_mesh();
        assert!(!mesh.vertices.is_empty());
        mesh.vertices
            .iter()
            .map(|v| (v.point.coords.norm() - 0.5).abs())
            .sum::<f64>()
            / mesh.vertices.len() as f64
    };
    let unscreened = deviation(0.0);
    let screened = deviation(4.0);
    assert!(
        screened <= unscreened * 0.8,
        "screening only moved the mean deviation from {unscreened} to {screened}"
    );
}

#[test]
fn unit_cube_surface_is_watertight() {
    // 12000 samples on the surface of a cube of side 0.8 with outward
    // normals.
    let side = 0.8_f64;
    let m = 45usize;
    let mut points = vec![];
    let mut normals = vec![];
    for axis in 0..3 {
        for sign in [-1.0, 1.0] {
            for i in 0..m {
                for j in 0..m {
                    let u = ((i as f64 + 0.5) / m as f64 - 0.5) * side;
                    let v = ((j as f64 + 0.5) / m as f64 - 0.5) * side;
                    let mut p = [0.0; 3];
                    p[axis] = sign * side / 2.0;
                    p[(axis + 1) % 3] = u;
                    p[(axis + 2) % 3] = v;
                    let mut n = [0.0; 3];
                    n[axis] = sign;
                    points.push(Point3::new(p[0], p[1], p[2]));
                    normals.push(Vector3::new(n[0], n[1], n[2]));
                }
            }
        }
    }

    let params = ReconstructionParams {
        max_depth: 6,
        splat_depth: 4,
        samples_per_node: 1.0,
        scale_factor: 1.1,
        boundary_type: BoundaryType::Neumann,
        ..Default::default()
    };
    let mut surface =
        PoissonReconstruction::from_points_and_normals(&points, &normals, params).unwrap();
    let mesh = surface.reconstruct_mesh();

    assert!(
        (5_000..=20_000).contains(&mesh.vertices.len()),
        "vertex count {} outside the expected range",
        mesh.vertices.len()
    );

    // Watertight: every edge borders exactly two polygons.
    for ((a, b), count) in edge_use_counts(&mesh) {
        assert_eq!(count, 2, "edge ({a}, {b}) borders {count} polygons");
    }

    // The mesh hugs the cube: bounding box within 5% of the input.
    let mut mins = Vector3::repeat(f64::INFINITY);
    let mut maxs = Vector3::repeat(f64::NEG_INFINITY);
    for v in &mesh.vertices {
        mins = mins.inf(&v.point.coords);
        maxs = maxs.sup(&v.point.coords);
    }
    for k in 0..3 {
        assert!(maxs[k] <= 0.4 * 1.05 && maxs[k] >= 0.4 * 0.95, "maxs {maxs:?}");
        assert!(mins[k] >= -0.4 * 1.05 && mins[k] <= -0.4 * 0.95, "mins {mins:?}");
    }
}

#[test]
fn free_boundary_plane_stays_inside_its_hull() {
    // 10000 coplanar samples with consistent normals under the free
    // (no-boundary) basis.
    let m = 100usize;
    let mut points = vec![];
    let mut normals = vec![];
    for i in 0..m {
        for j in 0..m {
            let x = ((i as f64 + 0.5) / m as f64 - 0.5) * 0.8;
            let y = ((j as f64 + 0.5) / m as f64 - 0.5) * 0.8;
            points.push(Point3::new(x, y, 0.0));
            normals.push(Vector3::z());
        }
    }

    let params = ReconstructionParams {
        max_depth: 5,
        splat_depth: 3,
        boundary_type: BoundaryType::None,
        constraint_weight: 0.0,
        ..Default::default()
    };
    let mut surface =
        PoissonReconstruction::from_points_and_normals(&points, &normals, params).unwrap();
    let mesh = surface.reconstruct_mesh();
    assert!(!mesh.polygons.is_empty());

    // The patch may not extend more than one finest cell beyond the convex
    // hull of the samples (the doubled cube spans 0.8 · 2 · 1.1 across
    // 2^5 user-visible cells).
    let cell = 0.8 * 2.0 * 1.1 / 32.0;
    for v in &mesh.vertices {
        assert!(
            v.point.x.abs() <= 0.4 + cell + 1.0e-9
                && v.point.y.abs() <= 0.4 + cell + 1.0e-9
                && v.point.z.abs() <= cell + 1.0e-9,
            "vertex {:?} strays outside the sampled plane",
            v.point
        );
    }

    // An open patch: some edges belong to only one polygon.
    let boundary_edges = edge_use_counts(&mesh)
        .values()
        .filter(|&&count| count == 1)
        .count();
    assert!(boundary_edges > 0, "plane patch unexpectedly closed");
}

#[test]
fn reconstruction_is_deterministic_across_thread_counts() {
    let (points, normals) = sphere_cloud(4000, 0.45, Point3::origin());
    let run = |threads: usize| {
        let mut params = sphere_params(5);
        params.threads = threads;
        let mut surface =
            PoissonReconstruction::from_points_and_normals(&points, &normals, params).unwrap();
        surface.reconstruct_mesh()
    };
    let reference = run(1);
    let mut reference_points: Vec<_> = reference.vertices.iter().map(|v| v.point).collect();
    reference_points.sort_by(|a, b| {
        (a.x, a.y, a.z)
            .partial_cmp(&(b.x, b.y, b.z))
            .unwrap()
    });

    for threads in [2, 4, 8] {
        let mesh = run(threads);
        assert_eq!(mesh.vertices.len(), reference.vertices.len());
        assert_eq!(mesh.polygons.len(), reference.polygons.len());
        let mut mesh_points: Vec<_> = mesh.vertices.iter().map(|v| v.point).collect();
        mesh_points.sort_by(|a, b| {
            (a.x, a.y, a.z)
                .partial_cmp(&(b.x, b.y, b.z))
                .unwrap()
        });
        for (a, b) in reference_points.iter().zip(&mesh_points) {
            assert!(
                (a - b).norm() < 1.0e-5,
                "{threads} threads moved a vertex: {a:?} vs {b:?}"
            );
        }
    }
}
