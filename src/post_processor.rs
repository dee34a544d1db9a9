use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use log::info;
use nalgebra::DMatrix;
use tempfile::NamedTempFile;

use crate::{
    dataset::{IndexEntry, INDEX_MAP_HEADER},
    error::{ResonatorError, Result},
    mesher::Mesh,
};

/// Streams index map rows into a temporary file that only appears at its
/// final path once [`IndexMapWriter::finish`] succeeds
pub struct IndexMapWriter {
    writer: BufWriter<NamedTempFile>,
    path: PathBuf,
    rows: usize,
}

impl IndexMapWriter {
    pub fn create(path: &Path) -> Result<IndexMapWriter> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let file = NamedTempFile::new_in(dir).map_err(|err| {
            ResonatorError::PostProcessor(format!(
                "Failed to create index map in {}: {err}",
                dir.display()
            ))
        })?;

        let mut writer = BufWriter::new(file);
        writeln!(writer, "{INDEX_MAP_HEADER}")?;

        Ok(IndexMapWriter {
            writer,
            path: path.to_path_buf(),
            rows: 0,
        })
    }

    pub fn write_row(&mut self, entry: &IndexEntry) -> Result<()> {
        writeln!(
            self.writer,
            "{},{},{}",
            entry.mesh_idx, entry.material_idx, entry.node_index
        )?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Flushes and atomically moves the index map into place
    pub fn finish(self) -> Result<usize> {
        let file = self.writer.into_inner().map_err(|err| {
            ResonatorError::PostProcessor(format!("Failed to flush index map: {}", err.error()))
        })?;
        file.persist(&self.path).map_err(|err| {
            ResonatorError::PostProcessor(format!(
                "Failed to persist {}: {}",
                self.path.display(),
                err.error
            ))
        })?;

        info!("wrote {} index rows to {}", self.rows, self.path.display());
        Ok(self.rows)
    }
}

/// Writes mono audio as a 32-bit float WAV file
///
/// # Arguments
/// * `samples` - The audio samples
/// * `sample_rate` - Sample rate in Hz
/// * `output` - The filename of the output wav
pub fn wav_output(samples: &[f32], sample_rate: u32, output: &str) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut writer = match hound::WavWriter::create(output, spec) {
        Ok(w) => w,
        Err(err) => {
            return Err(ResonatorError::PostProcessor(format!(
                "Failed to create {output}: {err}"
            )));
        }
    };

    for sample in samples {
        writer
            .write_sample(*sample)
            .map_err(|err| ResonatorError::PostProcessor(format!("Failed to write sample: {err}")))?;
    }
    writer
        .finalize()
        .map_err(|err| ResonatorError::PostProcessor(format!("Failed to finalize {output}: {err}")))?;

    info!("wrote {} samples to {output}", samples.len());
    Ok(())
}

/// Writes one row per mode: eigenvalue, natural and damped frequency, damping
///
/// # Arguments
/// * `eigenvalues` - Mode eigenvalues in ascending order
/// * `frequencies` - Natural frequencies in Hz
/// * `damped_frequencies` - Damped frequencies in Hz
/// * `damping` - Damping ratios
/// * `output` - The filename of the output csv
pub fn mode_table_output(
    eigenvalues: &[f64],
    frequencies: &[f64],
    damped_frequencies: &[f64],
    damping: &[f64],
    output: &str,
) -> Result<()> {
    let n = eigenvalues.len();
    if frequencies.len() != n || damped_frequencies.len() != n || damping.len() != n {
        return Err(ResonatorError::PostProcessor(format!(
            "Got {n} eigenvalues but {} frequencies, {} damped frequencies and {} damping ratios",
            frequencies.len(),
            damped_frequencies.len(),
            damping.len()
        )));
    }

    let mut file = create(output)?;

    writeln!(file, "mode,eigenvalue,frequency,damped_frequency,damping_ratio")?;
    for (i, eigenvalue) in eigenvalues.iter().enumerate() {
        writeln!(
            file,
            "{i},{eigenvalue},{f},{fd},{zeta}",
            f = frequencies[i],
            fd = damped_frequencies[i],
            zeta = damping[i],
        )?;
    }
    file.flush()?;

    info!("wrote {} modes to {output}", eigenvalues.len());
    Ok(())
}

/// Writes node coordinates followed by the gain of each mode
///
/// # Arguments
/// * `mesh` - The mesh the gains belong to
/// * `gains` - `N x k` mode gains
/// * `output` - The filename of the output csv
pub fn mode_shapes_output(mesh: &Mesh, gains: &DMatrix<f64>, output: &str) -> Result<()> {
    if gains.nrows() != mesh.n_vertices() {
        return Err(ResonatorError::PostProcessor(format!(
            "Got gains for {} nodes but the mesh has {}",
            gains.nrows(),
            mesh.n_vertices()
        )));
    }

    let mut file = create(output)?;

    let header: Vec<String> = (0..gains.ncols()).map(|m| format!("mode_{m}")).collect();
    writeln!(file, "x,y,boundary,{}", header.join(","))?;
    for (node, vertex) in mesh.vertices().iter().enumerate() {
        let row: Vec<String> = gains.row(node).iter().map(|g| g.to_string()).collect();
        writeln!(
            file,
            "{x},{y},{b},{gains}",
            x = vertex.x,
            y = vertex.y,
            b = mesh.is_boundary(node) as u8,
            gains = row.join(",")
        )?;
    }
    file.flush()?;

    info!("wrote mode shapes to {output}");
    Ok(())
}

fn create(output: &str) -> Result<BufWriter<File>> {
    match File::create(output) {
        Ok(f) => Ok(BufWriter::new(f)),
        Err(err) => Err(ResonatorError::PostProcessor(format!(
            "Failed to create {output}: {err}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_map_appears_only_after_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index_map.csv");

        let mut writer = IndexMapWriter::create(&path).unwrap();
        writer
            .write_row(&IndexEntry {
                mesh_idx: 0,
                material_idx: 1,
                node_index: 7,
            })
            .unwrap();
        assert!(!path.exists());

        assert_eq!(writer.finish().unwrap(), 1);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, format!("{INDEX_MAP_HEADER}\n0,1,7\n"));
    }

    #[test]
    fn wav_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let path = path.to_str().unwrap();

        let samples = vec![0.0f32, 0.5, -0.25, 1.0];
        wav_output(&samples, 16000, path).unwrap();

        let mut reader = hound::WavReader::open(path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        let read: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(read, samples);
    }

    #[test]
    fn mode_table_has_a_row_per_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modes.csv");
        let path = path.to_str().unwrap();

        mode_table_output(&[4.0, 9.0], &[0.3, 0.5], &[0.29, 0.49], &[0.01, 0.02], path).unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "0,4,0.3,0.29,0.01");
    }

    #[test]
    fn mode_table_rejects_mismatched_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modes.csv");
        let path = path.to_str().unwrap();

        let result = mode_table_output(&[4.0, 9.0], &[0.3], &[0.29, 0.49], &[0.01, 0.02], path);
        assert!(matches!(result, Err(ResonatorError::PostProcessor(_))));
        assert!(!std::path::Path::new(path).exists());
    }
}
