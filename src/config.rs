use std::path::PathBuf;

use json::JsonValue;

use crate::{
    dataset::SolverFailurePolicy,
    error::{ResonatorError, Result},
    material::{MaterialRanges, ParamRange, PARAM_NAMES},
    modal::ModalOptions,
    solver::{BoundaryCondition, EigenSolver},
};

/// Settings for a dataset sweep and for rendering samples from it
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetConfig {
    pub n_shapes: usize,
    pub n_materials: usize,
    /// Vertices per random shape
    pub n_vertices: usize,
    pub n_modes: usize,
    pub n_refinements: usize,
    pub scale_factor: f64,
    /// Occupancy map `(rows, cols)`
    pub resolution: (usize, usize),
    /// Index only interior nodes when set
    pub without_boundary_nodes: bool,
    pub data_dir: PathBuf,
    pub seed: Option<u64>,
    pub audio_length_seconds: f64,
    pub sample_rate: f64,
    pub modal: ModalOptions,
    pub on_solver_error: SolverFailurePolicy,
    pub material_ranges: MaterialRanges,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        DatasetConfig {
            n_shapes: 100,
            n_materials: 10,
            n_vertices: 10,
            n_modes: 32,
            n_refinements: 3,
            scale_factor: 1.0,
            resolution: (64, 64),
            without_boundary_nodes: true,
            data_dir: PathBuf::from("data"),
            seed: None,
            audio_length_seconds: 0.3,
            sample_rate: 16000.0,
            modal: ModalOptions::default(),
            on_solver_error: SolverFailurePolicy::Abort,
            material_ranges: MaterialRanges::default(),
        }
    }
}

impl DatasetConfig {
    /// Checks the values a sweep cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.n_modes == 0 {
            return Err(ResonatorError::Input(
                "n_modes must be at least 1".to_owned(),
            ));
        }
        if !(self.scale_factor.is_finite() && self.scale_factor > 0.0) {
            return Err(ResonatorError::Input(format!(
                "scale_factor must be positive, got {}",
                self.scale_factor
            )));
        }
        if self.resolution.0 == 0 || self.resolution.1 == 0 {
            return Err(ResonatorError::Input(format!(
                "resolution must be non-zero, got {:?}",
                self.resolution
            )));
        }
        if self.n_vertices < 3 {
            return Err(ResonatorError::Input(format!(
                "n_vertices must be at least 3, got {}",
                self.n_vertices
            )));
        }
        if !(self.sample_rate > 0.0) || !(self.audio_length_seconds >= 0.0) {
            return Err(ResonatorError::Input(
                "sample_rate must be positive and audio_length_seconds non-negative".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Reads a JSON configuration file over the defaults
///
/// # Arguments
/// * `config_file` - The path to the json file
pub fn load_config(config_file: &str) -> Result<DatasetConfig> {
    let file_string = match std::fs::read_to_string(config_file) {
        Ok(s) => s,
        Err(err) => {
            return Err(ResonatorError::Input(format!(
                "Unable to read config file {config_file}: {err}"
            )))
        }
    };
    parse_config(&file_string)
}

/// Parses a JSON configuration; absent keys keep their defaults
pub fn parse_config(contents: &str) -> Result<DatasetConfig> {
    let config_json = match json::parse(contents) {
        Ok(j) => j,
        Err(err) => {
            return Err(ResonatorError::Input(format!(
                "Error in config file json: {err}"
            )))
        }
    };

    if !config_json.is_object() {
        return Err(ResonatorError::Input(
            "Config json must be an object".to_owned(),
        ));
    }

    let mut config = DatasetConfig::default();

    for (key, value) in config_json.entries() {
        match key {
            "n_shapes" => config.n_shapes = as_usize(key, value)?,
            "n_materials" => config.n_materials = as_usize(key, value)?,
            "n_vertices" => config.n_vertices = as_usize(key, value)?,
            "n_modes" => config.n_modes = as_usize(key, value)?,
            "n_refinements" => config.n_refinements = as_usize(key, value)?,
            "scale_factor" => config.scale_factor = as_f64(key, value)?,
            "resolution" => {
                let pair = as_pair(key, value)?;
                config.resolution = (
                    as_usize(key, &pair[0])?,
                    as_usize(key, &pair[1])?,
                );
            }
            "without_boundary_nodes" => {
                config.without_boundary_nodes = value
                    .as_bool()
                    .ok_or_else(|| wrong_type(key, "a boolean"))?
            }
            "data_dir" => config.data_dir = PathBuf::from(as_str(key, value)?),
            "seed" => {
                config.seed = if value.is_null() {
                    None
                } else {
                    Some(
                        value
                            .as_u64()
                            .ok_or_else(|| wrong_type(key, "an unsigned integer"))?,
                    )
                }
            }
            "audio_length_seconds" => config.audio_length_seconds = as_f64(key, value)?,
            "sample_rate" => config.sample_rate = as_f64(key, value)?,
            "solver" => {
                config.modal.solver.eigen_solver = match as_str(key, value)? {
                    "auto" => EigenSolver::Auto,
                    "dense" => EigenSolver::Dense,
                    "subspace" => EigenSolver::Subspace,
                    other => return Err(unknown_choice(key, other)),
                }
            }
            "boundary" => {
                config.modal.boundary = match as_str(key, value)? {
                    "clamped" => BoundaryCondition::Clamped,
                    "free" => BoundaryCondition::Free,
                    other => return Err(unknown_choice(key, other)),
                }
            }
            "on_solver_error" => {
                config.on_solver_error = match as_str(key, value)? {
                    "abort" => SolverFailurePolicy::Abort,
                    "skip" => SolverFailurePolicy::Skip,
                    other => return Err(unknown_choice(key, other)),
                }
            }
            "material_ranges" => config.material_ranges = parse_ranges(value)?,
            other => {
                return Err(ResonatorError::Input(format!(
                    "Unknown config field {other}"
                )))
            }
        }
    }

    config.validate()?;
    Ok(config)
}

/// Parses `{"density": [min, max], ...}`; missing parameters keep their
/// default ranges
fn parse_ranges(value: &JsonValue) -> Result<MaterialRanges> {
    if !value.is_object() {
        return Err(wrong_type("material_ranges", "an object"));
    }

    let mut ranges = MaterialRanges::default().as_array();
    for (key, range) in value.entries() {
        let Some(index) = PARAM_NAMES.iter().position(|name| *name == key) else {
            return Err(ResonatorError::Input(format!(
                "Unknown material parameter {key}"
            )));
        };
        let pair = as_pair(key, range)?;
        ranges[index] = ParamRange::new(as_f64(key, &pair[0])?, as_f64(key, &pair[1])?)?;
    }

    MaterialRanges::new(ranges)
}

fn as_usize(key: &str, value: &JsonValue) -> Result<usize> {
    value
        .as_usize()
        .ok_or_else(|| wrong_type(key, "a non-negative integer"))
}

fn as_f64(key: &str, value: &JsonValue) -> Result<f64> {
    value.as_f64().ok_or_else(|| wrong_type(key, "a number"))
}

fn as_str<'a>(key: &str, value: &'a JsonValue) -> Result<&'a str> {
    value.as_str().ok_or_else(|| wrong_type(key, "a string"))
}

fn as_pair<'a>(key: &str, value: &'a JsonValue) -> Result<[&'a JsonValue; 2]> {
    if !value.is_array() || value.len() != 2 {
        return Err(wrong_type(key, "a two element array"));
    }
    Ok([&value[0], &value[1]])
}

fn wrong_type(key: &str, expected: &str) -> ResonatorError {
    ResonatorError::Input(format!("Config field {key} must be {expected}"))
}

fn unknown_choice(key: &str, value: &str) -> ResonatorError {
    ResonatorError::Input(format!("Unknown value {value} for config field {key}"))
}
