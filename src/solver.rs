use crate::{
    datatypes::{Element, Vertex},
    error::{ResonatorError, Result},
    mesher::{compute_element_area, Mesh},
};
use log::debug;
use nalgebra::{linalg::SymmetricEigen, matrix, DMatrix, DVector, SMatrix};
use nalgebra_sparse::{factorization::CscCholesky, CooMatrix, CscMatrix, CsrMatrix};
use rand::{rngs::StdRng, Rng, SeedableRng};

use argmin::{
    core::{Executor, Operator},
    solver::conjugategradient::ConjugateGradient,
};

/// Free DOF count up to which `EigenSolver::Auto` solves densely
pub const DENSE_DOF_THRESHOLD: usize = 400;
pub const MAX_SUBSPACE_ITER: usize = 300;
/// Relative eigen-residual at which subspace iteration stops
pub const SUBSPACE_TOLERANCE: f64 = 1e-9;
/// Eigenvalues within this fraction of the largest computed one are rigid-body modes
pub const RIGID_BODY_TOLERANCE: f64 = 1e-6;
/// Shift applied to singular (free) stiffness, as a fraction of `tr(K) / tr(M)`
pub const FREE_SHIFT_FRACTION: f64 = 1e-3;
pub const MAX_CG_ITER: u64 = 10_000;
/// Conjugate gradient residual target, relative to the right hand side norm
pub const TARGET_CG_COST: f64 = 1e-12;

const SUBSPACE_SEED: u64 = 0x5EED_F00D;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BoundaryCondition {
    /// Boundary nodes are fixed; they carry no degrees of freedom
    #[default]
    Clamped,
    /// No constraints; the constant mode is filtered as a rigid-body mode
    Free,
}

impl BoundaryCondition {
    /// Number of zero-frequency modes the pencil has
    pub fn rigid_modes(&self) -> usize {
        match self {
            BoundaryCondition::Clamped => 0,
            BoundaryCondition::Free => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EigenSolver {
    /// Cholesky reduction to a standard symmetric problem
    Dense,
    /// Shift-invert subspace iteration on the sparse pencil
    Subspace,
    #[default]
    Auto,
}

/// How the shifted stiffness operator is inverted inside subspace iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinearSolver {
    #[default]
    Cholesky,
    ConjugateGradient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SolverOptions {
    pub eigen_solver: EigenSolver,
    pub linear_solver: LinearSolver,
}

/// Maps mesh nodes to equation numbers
#[derive(Debug, Clone)]
pub struct DofMap {
    node_to_dof: Vec<Option<usize>>,
    dof_to_node: Vec<usize>,
}

impl DofMap {
    pub fn new(mesh: &Mesh, boundary: BoundaryCondition) -> DofMap {
        let mut node_to_dof = vec![None; mesh.n_vertices()];
        let mut dof_to_node = Vec::new();
        for node in 0..mesh.n_vertices() {
            if boundary == BoundaryCondition::Clamped && mesh.is_boundary(node) {
                continue;
            }
            node_to_dof[node] = Some(dof_to_node.len());
            dof_to_node.push(node);
        }
        DofMap {
            node_to_dof,
            dof_to_node,
        }
    }

    pub fn dof(&self, node: usize) -> Option<usize> {
        self.node_to_dof[node]
    }

    pub fn node(&self, dof: usize) -> usize {
        self.dof_to_node[dof]
    }

    pub fn len(&self) -> usize {
        self.dof_to_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dof_to_node.is_empty()
    }

    pub fn n_nodes(&self) -> usize {
        self.node_to_dof.len()
    }
}

/// Stiffness and mass of a mesh for unit material constants
#[derive(Debug, Clone)]
pub struct GeometryMatrices {
    pub stiffness: CsrMatrix<f64>,
    pub mass: CsrMatrix<f64>,
    pub dofs: DofMap,
}

/// Eigenpairs sorted by ascending eigenvalue, vectors as columns
#[derive(Debug, Clone)]
pub struct EigenPairs {
    pub values: Vec<f64>,
    pub vectors: DMatrix<f64>,
}

/// Calculates the shape function gradients of a linear triangle
///
/// # Arguments
/// * `element` - The Element to target
/// * `vertices` - A reference to the mesh vertices
/// * `element_area` - The area of the element
///
/// # Returns
/// A 2x3 matrix whose column `i` is the gradient of shape function `i`
pub fn compute_gradient_matrix(
    element: &Element,
    vertices: &[Vertex],
    element_area: f64,
) -> SMatrix<f64, 2, 3> {
    let v0 = &vertices[element.nodes[0]];
    let v1 = &vertices[element.nodes[1]];
    let v2 = &vertices[element.nodes[2]];

    let beta_1 = v1.y - v2.y;
    let beta_2 = v2.y - v0.y;
    let beta_3 = v0.y - v1.y;

    let gamma_1 = v2.x - v1.x;
    let gamma_2 = v0.x - v2.x;
    let gamma_3 = v1.x - v0.x;

    let mut gradient_mat: SMatrix<f64, 2, 3> = matrix![
        beta_1, beta_2, beta_3;
        gamma_1, gamma_2, gamma_3;
    ];

    gradient_mat /= 2.0 * element_area;

    gradient_mat
}

/// Computes the unit stiffness matrix `∫ ∇Nᵢ·∇Nⱼ` for a given element
pub fn compute_element_stiffness_matrix(element: &Element, vertices: &[Vertex]) -> SMatrix<f64, 3, 3> {
    let element_area = compute_element_area(element, vertices);
    let gradient_mat = compute_gradient_matrix(element, vertices, element_area);

    gradient_mat.transpose() * gradient_mat * element_area
}

/// Computes the consistent unit mass matrix `∫ NᵢNⱼ` for a given element
pub fn compute_element_mass_matrix(element: &Element, vertices: &[Vertex]) -> SMatrix<f64, 3, 3> {
    let element_area = compute_element_area(element, vertices);

    matrix![
        2.0, 1.0, 1.0;
        1.0, 2.0, 1.0;
        1.0, 1.0, 2.0;
    ] * (element_area / 12.0)
}

/// Assembles the unit stiffness and mass matrices over the free DOFs
///
/// # Arguments
/// * `mesh` - The mesh to assemble
/// * `boundary` - Which nodes carry degrees of freedom
pub fn assemble_geometry(mesh: &Mesh, boundary: BoundaryCondition) -> Result<GeometryMatrices> {
    let dofs = DofMap::new(mesh, boundary);
    if dofs.is_empty() {
        return Err(ResonatorError::Solver(
            "Mesh has no free degrees of freedom".to_owned(),
        ));
    }

    let mut stiffness: CooMatrix<f64> = CooMatrix::new(dofs.len(), dofs.len());
    let mut mass: CooMatrix<f64> = CooMatrix::new(dofs.len(), dofs.len());

    for element in mesh.elements() {
        let stiffness_mat = compute_element_stiffness_matrix(element, mesh.vertices());
        let mass_mat = compute_element_mass_matrix(element, mesh.vertices());

        for (local_row, node_row) in element.nodes.iter().enumerate() {
            let Some(global_row) = dofs.dof(*node_row) else {
                continue;
            };
            for (local_col, node_col) in element.nodes.iter().enumerate() {
                let Some(global_col) = dofs.dof(*node_col) else {
                    continue;
                };
                stiffness.push(global_row, global_col, stiffness_mat[(local_row, local_col)]);
                mass.push(global_row, global_col, mass_mat[(local_row, local_col)]);
            }
        }
    }

    debug!(
        "assembled {} dofs from {} elements",
        dofs.len(),
        mesh.n_elements()
    );

    Ok(GeometryMatrices {
        stiffness: CsrMatrix::from(&stiffness),
        mass: CsrMatrix::from(&mass),
        dofs,
    })
}

/// Multiplies every stored entry by `factor`
pub fn scale_matrix(a: &CsrMatrix<f64>, factor: f64) -> CsrMatrix<f64> {
    let mut scaled = a.clone();
    for value in scaled.values_mut() {
        *value *= factor;
    }
    scaled
}

/// Returns `a + factor * b`
fn add_scaled(a: &CsrMatrix<f64>, b: &CsrMatrix<f64>, factor: f64) -> CsrMatrix<f64> {
    let mut sum: CooMatrix<f64> = CooMatrix::new(a.nrows(), a.ncols());
    for (i, j, v) in a.triplet_iter() {
        sum.push(i, j, *v);
    }
    for (i, j, v) in b.triplet_iter() {
        sum.push(i, j, factor * v);
    }
    CsrMatrix::from(&sum)
}

pub fn to_dense(a: &CsrMatrix<f64>) -> DMatrix<f64> {
    let mut dense = DMatrix::zeros(a.nrows(), a.ncols());
    for (i, j, v) in a.triplet_iter() {
        dense[(i, j)] += *v;
    }
    dense
}

fn trace(a: &CsrMatrix<f64>) -> f64 {
    a.triplet_iter()
        .filter(|(i, j, _)| i == j)
        .map(|(_, _, v)| *v)
        .sum()
}

/// Runs multiplication for Conjugate Gradient Solver
struct ConjugateGradientOperator<'a> {
    a: &'a CsrMatrix<f64>,
}

impl<'a> Operator for ConjugateGradientOperator<'a> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, x: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        Ok((self.a * &DVector::from_column_slice(x))
            .data
            .as_vec()
            .clone())
    }
}

/// Solves a system of equations using the conjugate gradient method.
///
/// This function returns an approximation for x in `Ax=b`
///
/// # Arguments
/// * `a` - A sparse symmetric positive definite matrix
/// * `b` - A vector of the solutions to the system
fn run_conjugate_gradient(a: &CsrMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    let b_norm = b.norm();
    if b_norm == 0.0 {
        return Ok(DVector::zeros(b.nrows()));
    }

    let b_flat: Vec<f64> = b.iter().copied().collect();
    let solver: ConjugateGradient<_, f64> = ConjugateGradient::new(b_flat);
    let initial_guess: Vec<f64> = vec![0.0; b.nrows()];

    let operator = ConjugateGradientOperator { a };

    let res = match Executor::new(operator, solver)
        .configure(|state| {
            state
                .param(initial_guess)
                .max_iters(MAX_CG_ITER)
                .target_cost(TARGET_CG_COST * b_norm)
        })
        .run()
    {
        Ok(r) => r,
        Err(err) => {
            return Err(ResonatorError::Solver(format!(
                "Conjugate Gradient error: {err}"
            )))
        }
    };

    let best_cost = res.state().best_cost;
    if !(best_cost <= TARGET_CG_COST * b_norm * 1e3) {
        return Err(ResonatorError::Solver(format!(
            "Conjugate Gradient did not converge (residual {best_cost:e})"
        )));
    }

    match &res.state().best_param {
        Some(vec) => Ok(DVector::from_vec(vec.clone())),
        None => Err(ResonatorError::Solver(
            "Conjugate Gradient could not produce best parameter".to_owned(),
        )),
    }
}

/// Applies `(K + sM)⁻¹` to blocks of vectors
enum ShiftedInverse<'a> {
    Cholesky(CscCholesky<f64>),
    ConjugateGradient(&'a CsrMatrix<f64>),
}

impl<'a> ShiftedInverse<'a> {
    fn new(shifted: &'a CsrMatrix<f64>, linear_solver: LinearSolver) -> Result<ShiftedInverse<'a>> {
        match linear_solver {
            LinearSolver::Cholesky => {
                let factor = CscCholesky::factor(&CscMatrix::from(shifted)).map_err(|err| {
                    ResonatorError::Solver(format!(
                        "Shifted stiffness matrix is not positive definite: {err:?}"
                    ))
                })?;
                Ok(ShiftedInverse::Cholesky(factor))
            }
            LinearSolver::ConjugateGradient => Ok(ShiftedInverse::ConjugateGradient(shifted)),
        }
    }

    fn solve(&self, rhs: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        match self {
            ShiftedInverse::Cholesky(factor) => Ok(factor.solve(rhs)),
            ShiftedInverse::ConjugateGradient(a) => {
                let mut solution = DMatrix::zeros(rhs.nrows(), rhs.ncols());
                for c in 0..rhs.ncols() {
                    let column = run_conjugate_gradient(a, &rhs.column(c).into_owned())?;
                    solution.set_column(c, &column);
                }
                Ok(solution)
            }
        }
    }
}

/// Solves the dense generalized problem `K x = λ M x` for every eigenpair.
///
/// Uses the standard form transformation `L⁻¹ K L⁻ᵀ` where `M = L Lᵀ`.
/// Eigenvectors come back M-orthonormal.
pub fn solve_generalized_dense(k: &DMatrix<f64>, m: &DMatrix<f64>) -> Result<EigenPairs> {
    let n = k.nrows();

    let chol = m.clone().cholesky().ok_or_else(|| {
        ResonatorError::Solver("Mass matrix is not positive definite".to_owned())
    })?;
    let l = chol.l();

    let singular = || ResonatorError::Solver("Singular Cholesky factor".to_owned());
    let l_inv_k = l.solve_lower_triangular(k).ok_or_else(singular)?;
    let k_tilde = l.solve_lower_triangular(&l_inv_k.transpose()).ok_or_else(singular)?;

    // Symmetrize to remove numerical errors
    let k_tilde_sym = (&k_tilde + k_tilde.transpose()) * 0.5;

    let eig = SymmetricEigen::new(k_tilde_sym);

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));

    let values: Vec<f64> = order.iter().map(|&i| eig.eigenvalues[i]).collect();
    let sorted = DMatrix::from_fn(n, n, |r, c| eig.eigenvectors[(r, order[c])]);

    // Transform eigenvectors back: φ = L⁻ᵀ y
    let vectors = l.tr_solve_lower_triangular(&sorted).ok_or_else(singular)?;

    Ok(EigenPairs { values, vectors })
}

/// Largest relative eigen-residual `‖Kx - λMx‖ / (λ_ref ‖Mx‖)` over the pairs
fn max_residual(
    k: &CsrMatrix<f64>,
    m: &CsrMatrix<f64>,
    values: &[f64],
    vectors: &DMatrix<f64>,
) -> f64 {
    let kx = k * vectors;
    let mx = m * vectors;
    let reference = values
        .iter()
        .fold(f64::MIN_POSITIVE, |acc, v| acc.max(v.abs()));

    (0..values.len())
        .map(|i| {
            let residual = kx.column(i) - mx.column(i) * values[i];
            residual.norm() / (reference * mx.column(i).norm())
        })
        .fold(0.0, f64::max)
}

/// Shift-invert subspace iteration with Rayleigh-Ritz projection.
///
/// Computes the `n_request` smallest eigenpairs of `K x = λ M x`.
fn solve_subspace(
    k: &CsrMatrix<f64>,
    m: &CsrMatrix<f64>,
    n_request: usize,
    shift: f64,
    linear_solver: LinearSolver,
) -> Result<EigenPairs> {
    let n = k.nrows();
    let p = usize::min(n, usize::max(2 * n_request, n_request + 8));

    let shifted = add_scaled(k, m, shift);
    let inverse = ShiftedInverse::new(&shifted, linear_solver)?;

    let mut rng = StdRng::seed_from_u64(SUBSPACE_SEED);
    let mut x: DMatrix<f64> = DMatrix::from_fn(n, p, |_, _| rng.gen_range(-1.0..1.0));

    for iteration in 0..MAX_SUBSPACE_ITER {
        let y = inverse.solve(&(m * &x))?;

        let k_reduced = y.transpose() * (k * &y);
        let m_reduced = y.transpose() * (m * &y);
        let k_reduced = (&k_reduced + k_reduced.transpose()) * 0.5;
        let m_reduced = (&m_reduced + m_reduced.transpose()) * 0.5;

        let ritz = solve_generalized_dense(&k_reduced, &m_reduced)?;
        x = y * ritz.vectors;

        let values = &ritz.values[..n_request];
        let vectors = x.columns(0, n_request).into_owned();
        let residual = max_residual(k, m, values, &vectors);
        if residual <= SUBSPACE_TOLERANCE {
            debug!(
                "subspace iteration converged after {} iterations (residual {residual:e})",
                iteration + 1
            );
            return Ok(EigenPairs {
                values: values.to_vec(),
                vectors,
            });
        }
    }

    Err(ResonatorError::Solver(format!(
        "Subspace iteration did not converge in {MAX_SUBSPACE_ITER} iterations"
    )))
}

/// Flips each eigenvector so that its largest-magnitude entry is positive
fn normalize_signs(vectors: &mut DMatrix<f64>) {
    for mut column in vectors.column_iter_mut() {
        let pivot = column
            .iter()
            .copied()
            .fold(0.0_f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
        if pivot < 0.0 {
            column.neg_mut();
        }
    }
}

/// Solves `K φ = λ M φ` for the `n_modes` smallest non-rigid modes
///
/// # Arguments
/// * `k` - Stiffness over the free DOFs
/// * `m` - Mass over the free DOFs
/// * `n_modes` - Number of elastic modes to return
/// * `rigid_modes` - Number of zero modes the pencil is expected to have
/// * `options` - Solver selection
///
/// # Returns
/// Ascending eigenvalues and M-orthonormal eigenvectors
pub fn solve_eigenproblem(
    k: &CsrMatrix<f64>,
    m: &CsrMatrix<f64>,
    n_modes: usize,
    rigid_modes: usize,
    options: &SolverOptions,
) -> Result<EigenPairs> {
    let n = k.nrows();
    let n_request = n_modes + rigid_modes;

    if n_modes == 0 {
        return Err(ResonatorError::Solver(
            "At least one mode must be requested".to_owned(),
        ));
    }
    if n_request > n {
        return Err(ResonatorError::Solver(format!(
            "Requested {n_modes} modes but the system only has {} free degrees of freedom",
            n - rigid_modes.min(n)
        )));
    }

    let use_dense = match options.eigen_solver {
        EigenSolver::Dense => true,
        EigenSolver::Subspace => false,
        EigenSolver::Auto => n <= DENSE_DOF_THRESHOLD,
    };

    let pairs = if use_dense {
        let all = solve_generalized_dense(&to_dense(k), &to_dense(m))?;
        EigenPairs {
            values: all.values[..n_request].to_vec(),
            vectors: all.vectors.columns(0, n_request).into_owned(),
        }
    } else {
        let shift = if rigid_modes > 0 {
            FREE_SHIFT_FRACTION * trace(k) / trace(m)
        } else {
            0.0
        };
        solve_subspace(k, m, n_request, shift, options.linear_solver)?
    };

    // Filter rigid-body modes
    let largest = pairs.values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let tolerance = RIGID_BODY_TOLERANCE * largest;

    let mut keep: Vec<usize> = Vec::with_capacity(n_modes);
    for (i, value) in pairs.values.iter().enumerate() {
        if *value < -tolerance {
            return Err(ResonatorError::Solver(format!(
                "Negative eigenvalue {value:e}; the system is not positive semi-definite"
            )));
        }
        if *value > tolerance && keep.len() < n_modes {
            keep.push(i);
        }
    }
    if keep.len() < n_modes {
        return Err(ResonatorError::Solver(format!(
            "Only {} elastic modes found, {n_modes} requested",
            keep.len()
        )));
    }

    let values: Vec<f64> = keep.iter().map(|&i| pairs.values[i]).collect();
    let mut vectors = pairs.vectors.select_columns(keep.iter());
    normalize_signs(&mut vectors);

    Ok(EigenPairs { values, vectors })
}
