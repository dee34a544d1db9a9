use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use indicatif::ProgressBar;
use log::{info, warn};
use rand::Rng;
use tempfile::NamedTempFile;

use crate::{
    config::DatasetConfig,
    error::{ResonatorError, Result},
    material::{Material, MaterialRanges, Physical, Scaled, N_MATERIAL_PARAMS},
    mesher::{create_mesh, generate_convex_mesh, Mesh},
    modal::{AssemblyCache, ModalOptions, ModalSystem},
    post_processor::IndexMapWriter,
    renderer::{length_in_samples, render_modes},
    shape::{generate_convex_shape, rasterize, OccupancyMap, Polygon},
};

pub const INDEX_MAP_FILE: &str = "index_map.csv";
pub const INDEX_MAP_HEADER: &str = "mesh_idx,material_idx,node_index";

const RECORD_MAGIC: &[u8; 4] = b"RSNT";
pub const RECORD_VERSION: u32 = 1;

/// What to do when a (shape, material) pair fails to solve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverFailurePolicy {
    #[default]
    Abort,
    /// Log the failure and leave the pair out of the dataset
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub mesh_idx: usize,
    pub material_idx: usize,
    pub node_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatasetSummary {
    pub records: usize,
    pub index_rows: usize,
    pub skipped: usize,
}

pub fn record_file_name(mesh_idx: usize, material_idx: usize) -> String {
    format!("{mesh_idx:05}_{material_idx:05}.rec")
}

/// Everything persisted for one (shape, material) pair
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRecord {
    pub occupancy: OccupancyMap,
    /// Scaled material parameters
    pub material_params: [f32; N_MATERIAL_PARAMS],
    /// Unscaled vertex coordinates
    pub coords: Vec<[f32; 2]>,
    pub eigenvalues: Vec<f32>,
    /// `N x k` mode gains, row-major
    pub gains: Vec<f32>,
}

impl DatasetRecord {
    pub fn n_vertices(&self) -> usize {
        self.coords.len()
    }

    pub fn n_modes(&self) -> usize {
        self.eigenvalues.len()
    }

    pub fn gain_row(&self, node: usize) -> Option<&[f32]> {
        let k = self.n_modes();
        self.gains.get(node * k..(node + 1) * k)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(RECORD_MAGIC);
        push_u32(&mut bytes, RECORD_VERSION);

        push_u32(&mut bytes, self.occupancy.rows as u32);
        push_u32(&mut bytes, self.occupancy.cols as u32);
        bytes.extend_from_slice(&self.occupancy.data);

        push_u32(&mut bytes, self.material_params.len() as u32);
        push_f32s(&mut bytes, &self.material_params);

        push_u32(&mut bytes, self.coords.len() as u32);
        for [x, y] in &self.coords {
            push_f32s(&mut bytes, &[*x, *y]);
        }

        push_u32(&mut bytes, self.eigenvalues.len() as u32);
        push_f32s(&mut bytes, &self.eigenvalues);
        push_f32s(&mut bytes, &self.gains);

        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<DatasetRecord> {
        let mut reader = ByteReader { bytes, pos: 0 };

        if reader.take(4)? != RECORD_MAGIC {
            return Err(ResonatorError::Dataset(
                "Not a record file (bad magic)".to_owned(),
            ));
        }
        let version = reader.u32()?;
        if version != RECORD_VERSION {
            return Err(ResonatorError::Dataset(format!(
                "Unsupported record version {version}"
            )));
        }

        let rows = reader.u32()? as usize;
        let cols = reader.u32()? as usize;
        let data = reader.take(rows * cols)?.to_vec();

        let n_params = reader.u32()? as usize;
        if n_params != N_MATERIAL_PARAMS {
            return Err(ResonatorError::Dataset(format!(
                "Record has {n_params} material parameters, expected {N_MATERIAL_PARAMS}"
            )));
        }
        let mut material_params = [0.0f32; N_MATERIAL_PARAMS];
        for param in material_params.iter_mut() {
            *param = reader.f32()?;
        }

        let n_vertices = reader.u32()? as usize;
        let flat = reader.f32s(2 * n_vertices)?;
        let coords = flat.chunks_exact(2).map(|c| [c[0], c[1]]).collect();

        let n_modes = reader.u32()? as usize;
        let eigenvalues = reader.f32s(n_modes)?;
        let gains = reader.f32s(n_vertices * n_modes)?;

        if reader.pos != bytes.len() {
            return Err(ResonatorError::Dataset(format!(
                "Record has {} trailing bytes",
                bytes.len() - reader.pos
            )));
        }

        Ok(DatasetRecord {
            occupancy: OccupancyMap { rows, cols, data },
            material_params,
            coords,
            eigenvalues,
            gains,
        })
    }

    /// Writes the record next to `path` and renames it into place, so the
    /// file is either complete or absent
    pub fn write(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let persist_error = |err: std::io::Error| {
            ResonatorError::Dataset(format!("Failed to write {}: {err}", path.display()))
        };

        let mut file = NamedTempFile::new_in(dir).map_err(persist_error)?;
        file.write_all(&self.to_bytes()).map_err(persist_error)?;
        file.as_file().sync_all().map_err(persist_error)?;
        file.persist(path).map_err(|err| persist_error(err.error))?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<DatasetRecord> {
        let bytes = fs::read(path).map_err(|err| {
            ResonatorError::Dataset(format!("Failed to read record {}: {err}", path.display()))
        })?;
        DatasetRecord::from_bytes(&bytes).map_err(|err| match err {
            ResonatorError::Dataset(msg) => {
                ResonatorError::Dataset(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }
}

fn push_u32(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_le_bytes());
}

fn push_f32s(bytes: &mut Vec<u8>, values: &[f32]) {
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                ResonatorError::Dataset(format!(
                    "Record is truncated: wanted {n} bytes at offset {}",
                    self.pos
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut word = [0u8; 4];
        word.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(word))
    }

    fn f32(&mut self) -> Result<f32> {
        let mut word = [0u8; 4];
        word.copy_from_slice(self.take(4)?);
        Ok(f32::from_le_bytes(word))
    }

    fn f32s(&mut self, n: usize) -> Result<Vec<f32>> {
        let byte_len = n.checked_mul(4).ok_or_else(|| {
            ResonatorError::Dataset("Record length field overflows".to_owned())
        })?;
        Ok(self
            .take(byte_len)?
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Solves every (shape, material) pair and writes the records and index map
///
/// # Arguments
/// * `materials` - Materials to pair with every shape
/// * `shapes` - Polygons in the unit frame
/// * `config` - Sweep settings
///
/// # Returns
/// Counts of what was written and skipped
pub fn generate_dataset(
    materials: &[Material<Physical>],
    shapes: &[Polygon],
    config: &DatasetConfig,
) -> Result<DatasetSummary> {
    config.validate()?;

    let scaled: Vec<Material<Scaled>> = materials
        .iter()
        .map(|m| m.scaled(&config.material_ranges))
        .collect::<Result<_>>()?;

    fs::create_dir_all(&config.data_dir).map_err(|err| {
        ResonatorError::Dataset(format!(
            "Failed to create {}: {err}",
            config.data_dir.display()
        ))
    })?;

    info!(
        "generating {} records from {} shapes and {} materials into {}",
        shapes.len() * materials.len(),
        shapes.len(),
        materials.len(),
        config.data_dir.display()
    );

    let mut index = IndexMapWriter::create(&config.data_dir.join(INDEX_MAP_FILE))?;
    let mut cache = AssemblyCache::new();
    let mut summary = DatasetSummary::default();

    let bar = ProgressBar::new((shapes.len() * materials.len()) as u64);

    for (mesh_idx, polygon) in shapes.iter().enumerate() {
        let mesh = Arc::new(create_mesh(polygon, config.n_refinements)?.scaled(config.scale_factor));
        let occupancy = rasterize(polygon, config.resolution);

        let nodes: Vec<usize> = if config.without_boundary_nodes {
            mesh.interior_nodes()
        } else {
            (0..mesh.n_vertices()).collect()
        };
        let coords: Vec<[f32; 2]> = mesh
            .vertices()
            .iter()
            .map(|v| {
                [
                    (v.x / config.scale_factor) as f32,
                    (v.y / config.scale_factor) as f32,
                ]
            })
            .collect();

        for (material_idx, material) in materials.iter().enumerate() {
            let mut system = ModalSystem::new(*material, mesh.clone(), config.n_modes)
                .with_options(config.modal);

            let solved = system
                .assemble(Some(&mut cache))
                .and_then(|_| system.solve());
            match solved {
                Err(err @ ResonatorError::Solver(_))
                    if config.on_solver_error == SolverFailurePolicy::Skip =>
                {
                    warn!("skipping shape {mesh_idx} material {material_idx}: {err}");
                    summary.skipped += 1;
                    bar.inc(1);
                    continue;
                }
                Err(err) => return Err(err),
                Ok(()) => {}
            }

            let all_gains = system.all_mode_gains()?;
            let eigenvalues: Vec<f32> = system.eigenvalues()?.iter().map(|v| *v as f32).collect();

            let mut gains = Vec::with_capacity(all_gains.len());
            for row in all_gains.row_iter() {
                gains.extend(row.iter().map(|g| *g as f32));
            }

            let params = scaled[material_idx].params();
            let record = DatasetRecord {
                occupancy: occupancy.clone(),
                material_params: params.map(|p| p as f32),
                coords: coords.clone(),
                eigenvalues,
                gains,
            };

            let file_name = record_file_name(mesh_idx, material_idx);
            record.write(&config.data_dir.join(&file_name))?;
            system.release();

            for node_index in &nodes {
                index.write_row(&IndexEntry {
                    mesh_idx,
                    material_idx,
                    node_index: *node_index,
                })?;
            }

            summary.records += 1;
            summary.index_rows += nodes.len();
            bar.set_message(format!("saved {file_name}"));
            bar.inc(1);
        }

        cache.evict(mesh.id());
    }

    index.finish()?;
    bar.finish_with_message(format!(
        "info: wrote {} records, skipped {}",
        summary.records, summary.skipped
    ));

    info!(
        "dataset complete: {} records, {} index rows, {} skipped",
        summary.records, summary.index_rows, summary.skipped
    );

    Ok(summary)
}

/// Draws random materials and convex shapes and sweeps them
///
/// Shapes are generated centered on the origin and shifted by `+0.5` into
/// the unit frame before rasterization.
pub fn generate_random_dataset<R: Rng + ?Sized>(
    n_shapes: usize,
    n_materials: usize,
    n_vertices: usize,
    config: &DatasetConfig,
    rng: &mut R,
) -> Result<DatasetSummary> {
    let materials: Vec<Material<Physical>> = (0..n_materials)
        .map(|_| Material::random(&config.material_ranges, rng))
        .collect();

    let shapes: Vec<Polygon> = (0..n_shapes)
        .map(|_| Ok(generate_convex_shape(n_vertices, rng)?.translated(0.5, 0.5)))
        .collect::<Result<_>>()?;

    info!("generated {n_shapes} shapes and {n_materials} materials");

    generate_dataset(&materials, &shapes, config)
}

/// Reads an index map, checking the header and every row
pub fn read_index_map(path: &Path) -> Result<Vec<IndexEntry>> {
    let contents = fs::read_to_string(path).map_err(|err| {
        ResonatorError::Dataset(format!("Failed to read {}: {err}", path.display()))
    })?;

    let mut lines = contents.lines();
    match lines.next() {
        Some(header) if header.trim() == INDEX_MAP_HEADER => {}
        _ => {
            return Err(ResonatorError::Dataset(format!(
                "{} does not start with the header {INDEX_MAP_HEADER}",
                path.display()
            )))
        }
    }

    let mut entries = Vec::new();
    for (line_no, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<usize> = line
            .split(',')
            .map(|f| f.trim().parse::<usize>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|err| {
                ResonatorError::Dataset(format!("Malformed index row {}: {err}", line_no + 2))
            })?;
        let [mesh_idx, material_idx, node_index] = fields[..] else {
            return Err(ResonatorError::Dataset(format!(
                "Index row {} has {} fields, expected 3",
                line_no + 2,
                fields.len()
            )));
        };
        entries.push(IndexEntry {
            mesh_idx,
            material_idx,
            node_index,
        });
    }

    Ok(entries)
}

/// One training example: an excitation point on a shape and its audio
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub mask: OccupancyMap,
    pub coords: [f32; 2],
    pub audio: Vec<f32>,
    /// Scaled material parameters
    pub material_params: [f32; N_MATERIAL_PARAMS],
}

pub struct DatasetLoader {
    root: PathBuf,
    entries: Vec<IndexEntry>,
    audio_length_seconds: f64,
    sample_rate: f64,
    ranges: MaterialRanges,
}

impl DatasetLoader {
    pub fn open(
        index_map: &Path,
        audio_length_seconds: f64,
        sample_rate: f64,
        ranges: MaterialRanges,
    ) -> Result<DatasetLoader> {
        let entries = read_index_map(index_map)?;
        let root = match index_map.parent() {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from("."),
        };
        Ok(DatasetLoader {
            root,
            entries,
            audio_length_seconds,
            sample_rate,
            ranges,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, idx: usize) -> Result<&IndexEntry> {
        self.entries.get(idx).ok_or_else(|| {
            ResonatorError::Dataset(format!(
                "Sample {idx} is out of range for {} index rows",
                self.entries.len()
            ))
        })
    }

    pub fn record(&self, entry: &IndexEntry) -> Result<DatasetRecord> {
        DatasetRecord::read(
            &self
                .root
                .join(record_file_name(entry.mesh_idx, entry.material_idx)),
        )
    }

    /// Loads the record behind index row `idx` and renders its audio
    pub fn sample(&self, idx: usize) -> Result<Sample> {
        let entry = *self.entry(idx)?;
        let record = self.record(&entry)?;

        let (Some(coords), Some(gains)) = (
            record.coords.get(entry.node_index),
            record.gain_row(entry.node_index),
        ) else {
            return Err(ResonatorError::Dataset(format!(
                "Node {} is out of range for record {} with {} vertices",
                entry.node_index,
                record_file_name(entry.mesh_idx, entry.material_idx),
                record.n_vertices()
            )));
        };

        let material = Material::<Scaled>::from_params(record.material_params.map(f64::from))
            .unscaled(&self.ranges)
            .map_err(|err| ResonatorError::Dataset(format!("Invalid material in record: {err}")))?;

        let eigenvalues: Vec<f64> = record.eigenvalues.iter().map(|v| f64::from(*v)).collect();
        let gains: Vec<f64> = gains.iter().map(|g| f64::from(*g)).collect();

        let audio = render_modes(
            &eigenvalues,
            &gains,
            material.alpha(),
            material.beta(),
            length_in_samples(self.audio_length_seconds, self.sample_rate),
            self.sample_rate,
        )?;

        Ok(Sample {
            mask: record.occupancy.clone(),
            coords: *coords,
            audio,
            material_params: record.material_params,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SingleShapeOptions {
    pub n_modes: usize,
    pub audio_length_seconds: f64,
    pub sample_rate: f64,
    /// Only used when the mesh is generated
    pub n_refinements: usize,
    pub modal: ModalOptions,
}

impl Default for SingleShapeOptions {
    fn default() -> Self {
        SingleShapeOptions {
            n_modes: 32,
            audio_length_seconds: 0.3,
            sample_rate: 32000.0,
            n_refinements: 3,
            modal: ModalOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SingleShapeSample {
    pub coords: [f32; 2],
    pub audio: Vec<f32>,
}

/// Samples every interior node of one plate in one material, rendering the
/// audio on demand. Nothing touches the disk.
pub struct SingleShapeDataset {
    system: ModalSystem,
    valid_nodes: Vec<usize>,
    audio_length_seconds: f64,
    sample_rate: f64,
}

impl SingleShapeDataset {
    pub fn new(
        material: Material<Physical>,
        mesh: Arc<Mesh>,
        options: SingleShapeOptions,
    ) -> SingleShapeDataset {
        let valid_nodes = mesh.interior_nodes();
        let system = ModalSystem::new(material, mesh, options.n_modes).with_options(options.modal);

        SingleShapeDataset {
            system,
            valid_nodes,
            audio_length_seconds: options.audio_length_seconds,
            sample_rate: options.sample_rate,
        }
    }

    /// Builds the dataset on a random convex plate with `n_points` vertices
    pub fn random<R: Rng + ?Sized>(
        material: Material<Physical>,
        n_points: usize,
        options: SingleShapeOptions,
        rng: &mut R,
    ) -> Result<SingleShapeDataset> {
        let (mesh, _) = generate_convex_mesh(n_points, options.n_refinements, rng)?;
        Ok(SingleShapeDataset::new(material, Arc::new(mesh), options))
    }

    pub fn len(&self) -> usize {
        self.valid_nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid_nodes.is_empty()
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        self.system.mesh()
    }

    /// Renders the impulse response at the `idx`-th interior node. The
    /// first call solves the modal system.
    pub fn sample(&mut self, idx: usize) -> Result<SingleShapeSample> {
        let Some(&node) = self.valid_nodes.get(idx) else {
            return Err(ResonatorError::Dataset(format!(
                "Sample {idx} is out of range for {} interior nodes",
                self.valid_nodes.len()
            )));
        };

        let audio = self
            .system
            .render(self.audio_length_seconds, self.sample_rate, node)?;
        let vertex = self.system.mesh().vertices()[node];

        Ok(SingleShapeSample {
            coords: [vertex.x as f32, vertex.y as f32],
            audio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> DatasetRecord {
        DatasetRecord {
            occupancy: OccupancyMap {
                rows: 2,
                cols: 3,
                data: vec![0, 1, 1, 0, 1, 0],
            },
            material_params: [0.1, 0.2, 0.3, 0.4, 0.5],
            coords: vec![[0.0, 0.0], [1.0, 0.0], [0.5, 0.75]],
            eigenvalues: vec![10.0, 20.0],
            gains: vec![0.0, 0.0, 1.5, -0.5, 0.25, 2.0],
        }
    }

    #[test]
    fn record_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(record_file_name(3, 12));
        let record = sample_record();
        record.write(&path).unwrap();

        assert_eq!(path.file_name().unwrap(), "00003_00012.rec");
        assert_eq!(DatasetRecord::read(&path).unwrap(), record);
        assert_eq!(record.gain_row(1), Some(&[1.5f32, -0.5][..]));
        assert_eq!(record.gain_row(3), None);
    }

    #[test]
    fn truncated_and_padded_records_are_rejected() {
        let bytes = sample_record().to_bytes();

        for cut in [0, 3, 8, bytes.len() - 1] {
            assert!(matches!(
                DatasetRecord::from_bytes(&bytes[..cut]),
                Err(ResonatorError::Dataset(_))
            ));
        }

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(
            DatasetRecord::from_bytes(&padded),
            Err(ResonatorError::Dataset(_))
        ));

        let mut wrong_magic = bytes;
        wrong_magic[0] = b'X';
        assert!(matches!(
            DatasetRecord::from_bytes(&wrong_magic),
            Err(ResonatorError::Dataset(_))
        ));
    }

    #[test]
    fn index_map_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_MAP_FILE);

        fs::write(&path, format!("{INDEX_MAP_HEADER}\n0,0,5\n1,2,7\n\n")).unwrap();
        let entries = read_index_map(&path).unwrap();
        assert_eq!(
            entries,
            vec![
                IndexEntry {
                    mesh_idx: 0,
                    material_idx: 0,
                    node_index: 5
                },
                IndexEntry {
                    mesh_idx: 1,
                    material_idx: 2,
                    node_index: 7
                },
            ]
        );

        for bad in [
            "mesh,material,node\n0,0,1\n".to_owned(),
            format!("{INDEX_MAP_HEADER}\n0,0\n"),
            format!("{INDEX_MAP_HEADER}\n0,x,1\n"),
            format!("{INDEX_MAP_HEADER}\n0,0,1,2\n"),
        ] {
            fs::write(&path, bad).unwrap();
            assert!(matches!(
                read_index_map(&path),
                Err(ResonatorError::Dataset(_))
            ));
        }
    }

    #[test]
    fn out_of_range_material_is_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatasetConfig {
            data_dir: dir.path().join("data"),
            ..Default::default()
        };
        let too_dense = Material::new(1e6, 1e10, 0.3, 1.0, 1e-7).unwrap();
        let square = Polygon::new(vec![
            crate::datatypes::Vertex::new(0.2, 0.2),
            crate::datatypes::Vertex::new(0.8, 0.2),
            crate::datatypes::Vertex::new(0.8, 0.8),
            crate::datatypes::Vertex::new(0.2, 0.8),
        ])
        .unwrap();

        assert!(matches!(
            generate_dataset(&[too_dense], &[square], &config),
            Err(ResonatorError::Material(_))
        ));
        assert!(!config.data_dir.join(INDEX_MAP_FILE).exists());
    }
}
