use crate::bspline::BoundaryType;
use crate::error::ReconstructionError;
use crate::Real;
use na::Matrix4;

/// All knobs of the reconstruction pipeline.
///
/// The defaults reproduce the usual screened-reconstruction setup: depth-8
/// octree, one sample per leaf, Neumann boundary, screening weight 4.
#[derive(Clone, Debug)]
pub struct ReconstructionParams {
    /// Finest octree depth.
    pub max_depth: usize,
    /// Coarsest solved depth.
    pub min_depth: usize,
    /// Finest depth used for density estimation; 0 disables adaptive
    /// sample-depth selection.
    pub splat_depth: usize,
    /// Target number of samples per leaf, driving the adaptive depth.
    pub samples_per_node: Real,
    /// Multiplicative padding of the bounding cube.
    pub scale_factor: Real,
    /// Scale each sample's contribution by the magnitude of its normal.
    pub use_confidence: bool,
    /// Weight screening points by the magnitude of their normal.
    pub use_normal_weights: bool,
    /// Screening strength; 0 disables the screening term.
    pub constraint_weight: Real,
    /// Exponent of the depth-adaptive screening rescaling.
    pub adaptive_exponent: i32,
    /// Basis boundary behavior.
    pub boundary_type: BoundaryType,
    /// Sub-domain partition depth for the solver; 0 solves each depth whole.
    pub subdivide_depth: usize,
    /// Lower bound on CG iterations per depth.
    pub min_iters: usize,
    /// Depths beyond this are propagated but not solved. `None` solves all.
    pub max_solve_depth: Option<usize>,
    /// Run exactly this many CG iterations instead of the adaptive budget.
    pub fixed_iters: Option<usize>,
    /// CG tolerance scale.
    pub accuracy: Real,
    /// Log the per-depth residual norms.
    pub show_residual: bool,
    /// Extraction iso-value override; computed from the solution when `None`.
    pub iso_value: Option<Real>,
    /// Locate edge roots with the quadratic Hermite fit instead of linear
    /// interpolation.
    pub non_linear_fit: bool,
    /// Emit whole polygons instead of triangulating loops.
    pub polygon_mesh: bool,
    /// Triangulate non-planar loops around an added barycenter instead of
    /// the minimal-area triangulation.
    pub add_barycenter: bool,
    /// Attach the sample-depth estimate to every output vertex.
    pub output_density: bool,
    /// Parallel width; 0 uses all available cores.
    pub threads: usize,
    /// Rigid/affine transform applied to the input samples.
    pub x_form: Matrix4<Real>,
}

impl Default for ReconstructionParams {
    fn default() -> Self {
        Self {
            max_depth: 8,
            min_depth: 0,
            splat_depth: 6,
            samples_per_node: 1.0,
            scale_factor: 1.1,
            use_confidence: false,
            use_normal_weights: false,
            constraint_weight: 4.0,
            adaptive_exponent: 1,
            boundary_type: BoundaryType::Neumann,
            subdivide_depth: 0,
            min_iters: 24,
            max_solve_depth: None,
            fixed_iters: None,
            accuracy: 1.0e-3,
            show_residual: false,
            iso_value: None,
            non_linear_fit: true,
            polygon_mesh: false,
            add_barycenter: false,
            output_density: false,
            threads: 0,
            x_form: Matrix4::identity(),
        }
    }
}

impl ReconstructionParams {
    pub fn validate(&self) -> Result<(), ReconstructionError> {
        if self.max_depth == 0 || self.max_depth > 16 {
            return Err(ReconstructionError::InvalidParameters(format!(
                "max_depth must lie in [1, 16], got {}",
                self.max_depth
            )));
        }
        if self.min_depth > self.max_depth {
            return Err(ReconstructionError::InvalidParameters(format!(
                "min_depth ({}) exceeds max_depth ({})",
                self.min_depth, self.max_depth
            )));
        }
        if self.splat_depth > self.max_depth {
            return Err(ReconstructionError::InvalidParameters(format!(
                "splat_depth ({}) exceeds max_depth ({})",
                self.splat_depth, self.max_depth
            )));
        }
        if self.samples_per_node <= 0.0 {
            return Err(ReconstructionError::InvalidParameters(
                "samples_per_node must be positive".to_string(),
            ));
        }
        if self.scale_factor < 1.0 {
            return Err(ReconstructionError::InvalidParameters(
                "scale_factor must be at least 1".to_string(),
            ));
        }
        if self.constraint_weight < 0.0 {
            return Err(ReconstructionError::InvalidParameters(
                "constraint_weight must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ReconstructionParams::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_depths() {
        let params = ReconstructionParams {
            min_depth: 9,
            max_depth: 8,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }
}
