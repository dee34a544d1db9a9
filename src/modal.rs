use std::{
    collections::{BTreeMap, HashMap},
    f64::consts::PI,
    sync::Arc,
};

use log::debug;
use nalgebra::DMatrix;
use nalgebra_sparse::CsrMatrix;

use crate::{
    error::{ResonatorError, Result},
    material::{Material, Physical},
    mesher::{Mesh, MeshId},
    renderer::{damped_frequency, damping_ratio, length_in_samples, render_modes},
    solver::{
        assemble_geometry, scale_matrix, solve_eigenproblem, BoundaryCondition, DofMap,
        GeometryMatrices, SolverOptions,
    },
};

/// Natural frequency in Hz of an eigenvalue `λ = ω²`
pub fn eigenvalue_to_frequency(eigenvalue: f64) -> f64 {
    eigenvalue.sqrt() / (2.0 * PI)
}

pub fn frequency_to_eigenvalue(frequency: f64) -> f64 {
    (2.0 * PI * frequency).powi(2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModalOptions {
    pub boundary: BoundaryCondition,
    pub solver: SolverOptions,
}

/// Geometry-only matrices shared across materials on the same mesh
#[derive(Debug, Default)]
pub struct AssemblyCache {
    entries: HashMap<(MeshId, BoundaryCondition), Arc<GeometryMatrices>>,
}

impl AssemblyCache {
    pub fn new() -> AssemblyCache {
        AssemblyCache::default()
    }

    pub fn get_or_assemble(
        &mut self,
        mesh: &Mesh,
        boundary: BoundaryCondition,
    ) -> Result<Arc<GeometryMatrices>> {
        let key = (mesh.id(), boundary);
        if let Some(geometry) = self.entries.get(&key) {
            return Ok(geometry.clone());
        }
        let geometry = Arc::new(assemble_geometry(mesh, boundary)?);
        self.entries.insert(key, geometry.clone());
        Ok(geometry)
    }

    /// Drops every entry of a mesh, returning how many were removed
    pub fn evict(&mut self, mesh_id: MeshId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(id, _), _| *id != mesh_id);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Unassembled,
    Assembled,
    Solved,
    GainsExtracted,
    Released,
}

#[derive(Debug)]
struct Matrices {
    geometry: Arc<GeometryMatrices>,
    stiffness: CsrMatrix<f64>,
    mass: CsrMatrix<f64>,
}

#[derive(Debug)]
struct Modes {
    eigenvalues: Vec<f64>,
    /// One row per mesh node, zero on constrained nodes
    eigenvectors: DMatrix<f64>,
}

#[derive(Debug, Default)]
struct ExtractedGains {
    all: Option<DMatrix<f64>>,
    rows: BTreeMap<usize, Vec<f64>>,
}

impl ExtractedGains {
    fn row(&self, node: usize) -> Option<Vec<f64>> {
        if let Some(all) = &self.all {
            return Some(all.row(node).iter().copied().collect());
        }
        self.rows.get(&node).cloned()
    }
}

#[derive(Debug)]
enum State {
    Unassembled,
    Assembled(Matrices),
    Solved(Matrices, Modes),
    GainsExtracted(Matrices, Modes, ExtractedGains),
    Released {
        eigenvalues: Option<Vec<f64>>,
        gains: ExtractedGains,
    },
}

#[derive(Debug)]
pub struct ModalSystem {
    material: Material<Physical>,
    mesh: Arc<Mesh>,
    n_modes: usize,
    options: ModalOptions,
    state: State,
}

impl ModalSystem {
    pub fn new(material: Material<Physical>, mesh: Arc<Mesh>, n_modes: usize) -> ModalSystem {
        ModalSystem {
            material,
            mesh,
            n_modes,
            options: ModalOptions::default(),
            state: State::Unassembled,
        }
    }

    pub fn with_options(mut self, options: ModalOptions) -> ModalSystem {
        self.options = options;
        self
    }

    pub fn material(&self) -> &Material<Physical> {
        &self.material
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    pub fn n_modes(&self) -> usize {
        self.n_modes
    }

    pub fn stage(&self) -> Stage {
        match self.state {
            State::Unassembled => Stage::Unassembled,
            State::Assembled(..) => Stage::Assembled,
            State::Solved(..) => Stage::Solved,
            State::GainsExtracted(..) => Stage::GainsExtracted,
            State::Released { .. } => Stage::Released,
        }
    }

    /// Builds the material stiffness and mass matrices.
    ///
    /// Geometry matrices come from `cache` when one is given; with `None`
    /// they are always assembled afresh. Does nothing past `Unassembled`
    /// except in `Released`, which is an error.
    pub fn assemble(&mut self, cache: Option<&mut AssemblyCache>) -> Result<()> {
        match self.state {
            State::Unassembled => {}
            State::Released { .. } => return Err(released("assemble")),
            _ => return Ok(()),
        }

        let geometry = match cache {
            Some(cache) => cache.get_or_assemble(&self.mesh, self.options.boundary)?,
            None => Arc::new(assemble_geometry(&self.mesh, self.options.boundary)?),
        };

        let stiffness = scale_matrix(&geometry.stiffness, self.material.shear_modulus());
        let mass = scale_matrix(&geometry.mass, self.material.density());

        debug!(
            "assembled modal system for mesh {:?} ({} dofs)",
            self.mesh.id(),
            geometry.dofs.len()
        );

        self.state = State::Assembled(Matrices {
            geometry,
            stiffness,
            mass,
        });
        Ok(())
    }

    fn matrices(&self) -> Result<&Matrices> {
        match &self.state {
            State::Assembled(matrices)
            | State::Solved(matrices, _)
            | State::GainsExtracted(matrices, _, _) => Ok(matrices),
            State::Unassembled => Err(ResonatorError::Solver(
                "Modal system has not been assembled".to_owned(),
            )),
            State::Released { .. } => Err(released("access matrices of")),
        }
    }

    /// Mass matrix over the free degrees of freedom
    pub fn mass(&self) -> Result<&CsrMatrix<f64>> {
        Ok(&self.matrices()?.mass)
    }

    /// Stiffness matrix over the free degrees of freedom
    pub fn stiffness(&self) -> Result<&CsrMatrix<f64>> {
        Ok(&self.matrices()?.stiffness)
    }

    pub fn dofs(&self) -> Result<&DofMap> {
        Ok(&self.matrices()?.geometry.dofs)
    }

    /// Solves for the `k` lowest elastic modes, assembling without a cache
    /// first if needed
    pub fn solve(&mut self) -> Result<()> {
        match self.state {
            State::Unassembled => self.assemble(None)?,
            State::Assembled(_) => {}
            State::Released { .. } => return Err(released("solve")),
            _ => return Ok(()),
        }

        let State::Assembled(matrices) = std::mem::replace(&mut self.state, State::Unassembled)
        else {
            return Err(ResonatorError::Solver(
                "Modal system is not assembled".to_owned(),
            ));
        };

        let pairs = match solve_eigenproblem(
            &matrices.stiffness,
            &matrices.mass,
            self.n_modes,
            self.options.boundary.rigid_modes(),
            &self.options.solver,
        ) {
            Ok(pairs) => pairs,
            Err(err) => {
                self.state = State::Assembled(matrices);
                return Err(err);
            }
        };

        let dofs = &matrices.geometry.dofs;
        let mut eigenvectors = DMatrix::zeros(dofs.n_nodes(), pairs.values.len());
        for dof in 0..dofs.len() {
            eigenvectors
                .row_mut(dofs.node(dof))
                .copy_from(&pairs.vectors.row(dof));
        }

        debug!(
            "solved {} modes, f1 = {:.2} Hz",
            pairs.values.len(),
            eigenvalue_to_frequency(pairs.values[0])
        );

        self.state = State::Solved(
            matrices,
            Modes {
                eigenvalues: pairs.values,
                eigenvectors,
            },
        );
        Ok(())
    }

    fn modes(&self) -> Result<&Modes> {
        match &self.state {
            State::Solved(_, modes) | State::GainsExtracted(_, modes, _) => Ok(modes),
            State::Released { .. } => Err(released("access mode shapes of")),
            _ => Err(not_solved()),
        }
    }

    /// Eigenvalues in ascending order
    pub fn eigenvalues(&self) -> Result<&[f64]> {
        match &self.state {
            State::Solved(_, modes) | State::GainsExtracted(_, modes, _) => Ok(&modes.eigenvalues),
            State::Released {
                eigenvalues: Some(eigenvalues),
                ..
            } => Ok(eigenvalues),
            _ => Err(not_solved()),
        }
    }

    /// Mass-normalized mode shapes, one column per mode and one row per node
    pub fn eigenvectors(&self) -> Result<&DMatrix<f64>> {
        Ok(&self.modes()?.eigenvectors)
    }

    pub fn frequencies(&self) -> Result<Vec<f64>> {
        Ok(self
            .eigenvalues()?
            .iter()
            .map(|l| eigenvalue_to_frequency(*l))
            .collect())
    }

    /// Rayleigh damping ratio of each mode
    pub fn damping_coefficients(&self) -> Result<Vec<f64>> {
        let (alpha, beta) = (self.material.alpha(), self.material.beta());
        Ok(self
            .eigenvalues()?
            .iter()
            .map(|l| damping_ratio(*l, alpha, beta))
            .collect())
    }

    /// Damped frequency of each mode in Hz
    pub fn damped_frequencies(&self) -> Result<Vec<f64>> {
        let zetas = self.damping_coefficients()?;
        Ok(self
            .eigenvalues()?
            .iter()
            .zip(zetas)
            .map(|(l, zeta)| damped_frequency(*l, zeta))
            .collect())
    }

    fn check_node(&self, node: usize) -> Result<()> {
        if node >= self.mesh.n_vertices() {
            return Err(ResonatorError::Input(format!(
                "Node {node} is out of range for a mesh with {} vertices",
                self.mesh.n_vertices()
            )));
        }
        Ok(())
    }

    /// Moves `Solved` into `GainsExtracted` and returns the gains store
    fn extracted(&mut self) -> Result<(&Modes, &mut ExtractedGains)> {
        if let State::Solved(..) = self.state {
            let State::Solved(matrices, modes) =
                std::mem::replace(&mut self.state, State::Unassembled)
            else {
                return Err(not_solved());
            };
            self.state = State::GainsExtracted(matrices, modes, ExtractedGains::default());
        }
        match &mut self.state {
            State::GainsExtracted(_, modes, gains) => Ok((modes, gains)),
            _ => Err(not_solved()),
        }
    }

    /// Amplitude of each mode at one mesh node
    pub fn mode_gains(&mut self, node: usize) -> Result<Vec<f64>> {
        self.check_node(node)?;

        if let State::Released { gains, .. } = &self.state {
            return gains.row(node).ok_or_else(|| released("extract new gains from"));
        }

        let (modes, gains) = self.extracted()?;
        let row: Vec<f64> = modes.eigenvectors.row(node).iter().copied().collect();
        gains.rows.insert(node, row.clone());
        Ok(row)
    }

    /// Amplitude of each mode at every mesh node, `N x k`
    pub fn all_mode_gains(&mut self) -> Result<DMatrix<f64>> {
        if let State::Released { gains, .. } = &self.state {
            return gains
                .all
                .clone()
                .ok_or_else(|| released("extract new gains from"));
        }

        let (modes, gains) = self.extracted()?;
        let all = modes.eigenvectors.clone();
        gains.all = Some(all.clone());
        Ok(all)
    }

    /// Drops the matrices and mode shapes, keeping eigenvalues and gains
    pub fn release(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Unassembled);
        self.state = match state {
            State::Unassembled | State::Assembled(_) => State::Released {
                eigenvalues: None,
                gains: ExtractedGains::default(),
            },
            State::Solved(_, modes) => State::Released {
                eigenvalues: Some(modes.eigenvalues),
                gains: ExtractedGains::default(),
            },
            State::GainsExtracted(_, modes, gains) => State::Released {
                eigenvalues: Some(modes.eigenvalues),
                gains,
            },
            already @ State::Released { .. } => already,
        };
    }

    /// Discards everything computed so far
    pub fn reset(&mut self) {
        self.state = State::Unassembled;
    }

    /// Impulse response observed at a mesh node
    ///
    /// # Arguments
    /// * `length_seconds` - Duration of the output
    /// * `sample_rate` - Output sample rate in Hz
    /// * `node` - Excitation and observation node
    pub fn render(&mut self, length_seconds: f64, sample_rate: f64, node: usize) -> Result<Vec<f32>> {
        if !(length_seconds >= 0.0) {
            return Err(ResonatorError::Input(format!(
                "Audio length must be non-negative, got {length_seconds}"
            )));
        }
        if self.stage() != Stage::Released {
            self.solve()?;
        }
        let gains = self.mode_gains(node)?;
        let eigenvalues = self.eigenvalues()?;
        let length = length_in_samples(length_seconds, sample_rate);

        render_modes(
            eigenvalues,
            &gains,
            self.material.alpha(),
            self.material.beta(),
            length,
            sample_rate,
        )
    }
}

fn released(action: &str) -> ResonatorError {
    ResonatorError::Solver(format!(
        "Cannot {action} a released modal system; call reset() to recompute"
    ))
}

fn not_solved() -> ResonatorError {
    ResonatorError::Solver("Modal system has not been solved".to_owned())
}
