use std::f64::consts::PI;

use log::debug;
use rand::{seq::SliceRandom, Rng};

use crate::{
    datatypes::{orient, BoundingBox, Vertex},
    error::{ResonatorError, Result},
};

/// Relative tolerance used when classifying a turn as straight
const COLLINEAR_TOLERANCE: f64 = 1e-12;

/// An ordered, closed boundary. The last vertex connects back to the first.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    vertices: Vec<Vertex>,
}

impl Polygon {
    pub fn new(vertices: Vec<Vertex>) -> Result<Polygon> {
        if vertices.len() < 3 {
            return Err(ResonatorError::Shape(format!(
                "A polygon needs at least 3 vertices, got {}",
                vertices.len()
            )));
        }
        if let Some(v) = vertices.iter().find(|v| !v.x.is_finite() || !v.y.is_finite()) {
            return Err(ResonatorError::Shape(format!(
                "Non-finite polygon vertex {:?}",
                v
            )));
        }

        Ok(Polygon { vertices })
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Iterates over the closed edge list `(v_i, v_{i+1})`
    pub fn edges(&self) -> impl Iterator<Item = (&Vertex, &Vertex)> {
        let n = self.vertices.len();
        (0..n).map(move |i| (&self.vertices[i], &self.vertices[(i + 1) % n]))
    }

    /// Signed shoelace area. Positive for counter-clockwise vertex order.
    pub fn area(&self) -> f64 {
        0.5 * self.edges().map(|(a, b)| a.x * b.y - b.x * a.y).sum::<f64>()
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let mut bbox = BoundingBox {
            x_min: f64::MAX,
            x_max: f64::MIN,
            y_min: f64::MAX,
            y_max: f64::MIN,
        };
        for v in &self.vertices {
            bbox.x_min = bbox.x_min.min(v.x);
            bbox.x_max = bbox.x_max.max(v.x);
            bbox.y_min = bbox.y_min.min(v.y);
            bbox.y_max = bbox.y_max.max(v.y);
        }
        bbox
    }

    /// Checks that every turn along the boundary has the same orientation and
    /// that the boundary winds exactly once.
    pub fn is_convex(&self) -> bool {
        let n = self.vertices.len();
        let bbox = self.bounding_box();
        let scale = f64::max(bbox.width(), bbox.height()).powi(2);
        if scale <= 0.0 || self.area().abs() <= COLLINEAR_TOLERANCE * scale {
            return false;
        }

        let mut sign = 0.0;
        let mut winding = 0.0;
        for i in 0..n {
            let a = &self.vertices[i];
            let b = &self.vertices[(i + 1) % n];
            let c = &self.vertices[(i + 2) % n];

            let (e0x, e0y) = (b.x - a.x, b.y - a.y);
            let (e1x, e1y) = (c.x - b.x, c.y - b.y);
            if (e0x == 0.0 && e0y == 0.0) || (e1x == 0.0 && e1y == 0.0) {
                return false;
            }

            let cross = orient(a, b, c);
            if cross.abs() > COLLINEAR_TOLERANCE * scale {
                if sign == 0.0 {
                    sign = cross.signum();
                } else if cross.signum() != sign {
                    return false;
                }
            }
            winding += f64::atan2(e0x * e1y - e0y * e1x, e0x * e1x + e0y * e1y);
        }

        (winding.abs() - 2.0 * PI).abs() < 1e-6
    }

    /// Returns the same boundary in counter-clockwise order
    pub fn counter_clockwise(&self) -> Polygon {
        let mut vertices = self.vertices.clone();
        if self.area() < 0.0 {
            vertices.reverse();
        }
        Polygon { vertices }
    }

    pub fn translated(&self, dx: f64, dy: f64) -> Polygon {
        Polygon {
            vertices: self
                .vertices
                .iter()
                .map(|v| Vertex::new(v.x + dx, v.y + dy))
                .collect(),
        }
    }

    pub fn scaled(&self, factor: f64) -> Polygon {
        Polygon {
            vertices: self
                .vertices
                .iter()
                .map(|v| Vertex::new(v.x * factor, v.y * factor))
                .collect(),
        }
    }

    /// Even-odd point-in-polygon test
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.y > y) != (b.y > y) {
                let x_cross = a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y);
                if x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }
}

/// Generates a random convex polygon with `n` vertices using Valtr's algorithm.
///
/// The result fits inside the unit square and is centered on the origin.
pub fn generate_convex_shape<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Result<Polygon> {
    if n < 3 {
        return Err(ResonatorError::Shape(format!(
            "Convex shapes need at least 3 vertices, got {n}"
        )));
    }

    let mut x_rand: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
    let mut y_rand: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
    x_rand.sort_by(f64::total_cmp);
    y_rand.sort_by(f64::total_cmp);

    let mut x_new = vec![0.0; n];
    let mut y_new = vec![0.0; n];

    // Divide the interior points into two chains
    let mut last_top = 0;
    let mut last_bottom = 0;
    for i in 1..n {
        if i != n - 1 {
            if rng.gen::<bool>() {
                x_new[i] = x_rand[i] - x_rand[last_top];
                y_new[i] = y_rand[i] - y_rand[last_top];
                last_top = i;
            } else {
                x_new[i] = x_rand[last_bottom] - x_rand[i];
                y_new[i] = y_rand[last_bottom] - y_rand[i];
                last_bottom = i;
            }
        } else {
            x_new[0] = x_rand[i] - x_rand[last_top];
            y_new[0] = y_rand[i] - y_rand[last_top];
            x_new[i] = x_rand[last_bottom] - x_rand[i];
            y_new[i] = y_rand[last_bottom] - y_rand[i];
        }
    }

    // Pair x and y components at random, then order by polar angle
    y_new.shuffle(rng);
    let mut edges: Vec<Vertex> = std::iter::zip(x_new, y_new)
        .map(|(x, y)| Vertex::new(x, y))
        .collect();
    edges.sort_by(|a, b| f64::atan2(a.y, a.x).total_cmp(&f64::atan2(b.y, b.x)));

    // Lay the edges end to end
    let mut vertices: Vec<Vertex> = Vec::with_capacity(n);
    let mut cursor = Vertex::new(0.0, 0.0);
    for edge in edges {
        cursor = Vertex::new(cursor.x + edge.x, cursor.y + edge.y);
        vertices.push(cursor);
    }

    let polygon = Polygon::new(vertices)?;
    let center = polygon.bounding_box().center();
    debug!("generated convex shape with {n} vertices");

    Ok(polygon.translated(-center.x, -center.y))
}

/// A binary raster of the pixels covered by a shape, stored row-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupancyMap {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<u8>,
}

impl OccupancyMap {
    pub fn get(&self, row: usize, col: usize) -> u8 {
        self.data[row * self.cols + col]
    }

    pub fn occupied(&self) -> usize {
        self.data.iter().filter(|p| **p != 0).count()
    }
}

/// Rasterizes a polygon given in the unit frame `[0, 1]²` onto a
/// `rows x cols` grid. Pixel `(r, c)` samples the point at its centre,
/// `((c + 0.5) / cols, (r + 0.5) / rows)`, with each axis scaled by its own
/// resolution. Sampling at the pixel corner instead (`c / cols`) shifts the
/// mask by half a pixel toward the origin.
pub fn rasterize(polygon: &Polygon, resolution: (usize, usize)) -> OccupancyMap {
    let (rows, cols) = resolution;
    let mut data = vec![0u8; rows * cols];

    for r in 0..rows {
        let y = (r as f64 + 0.5) / rows as f64;
        for c in 0..cols {
            let x = (c as f64 + 0.5) / cols as f64;
            if polygon.contains(x, y) {
                data[r * cols + c] = 1;
            }
        }
    }

    OccupancyMap { rows, cols, data }
}

/// Parses a CSV file with `x` and `y` columns into a polygon
///
/// # Arguments
/// * `csv_file` - The path to the input csv file
pub fn parse_csv(csv_file: &str) -> Result<Polygon> {
    let contents = match std::fs::read_to_string(csv_file) {
        Ok(c) => c,
        Err(_err) => {
            return Err(ResonatorError::Input(format!(
                "Unable to open csv file {}",
                csv_file
            )))
        }
    };

    let mut headers: Vec<&str> = Vec::new();
    let mut x_index: usize = 0;
    let mut y_index: usize = 0;
    let mut vertices: Vec<Vertex> = Vec::new();

    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        if headers.is_empty() {
            headers = line.split(',').map(|x| x.trim()).collect();

            let (Some(x), Some(y)) = (
                headers.iter().position(|f| f == &"x"),
                headers.iter().position(|f| f == &"y"),
            ) else {
                return Err(ResonatorError::Input(
                    "Error in csv file: Missing x and/or y field".to_string(),
                ));
            };
            x_index = x;
            y_index = y;
        } else {
            let line_contents: Vec<f64> = line
                .split(',')
                .map(|x| x.trim().parse::<f64>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|err| {
                    ResonatorError::Input(format!(
                        "Non-float value in csv points on line {}: {err}",
                        line_no + 1
                    ))
                })?;

            if line_contents.len() != headers.len() {
                return Err(ResonatorError::Input(format!(
                    "Expected {} columns on line {} of {csv_file}",
                    headers.len(),
                    line_no + 1
                )));
            }

            vertices.push(Vertex::new(line_contents[x_index], line_contents[y_index]));
        }
    }

    Polygon::new(vertices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::io::Write;

    fn unit_square() -> Polygon {
        Polygon::new(vec![
            Vertex::new(0.0, 0.0),
            Vertex::new(1.0, 0.0),
            Vertex::new(1.0, 1.0),
            Vertex::new(0.0, 1.0),
        ])
        .unwrap()
    }

    #[test]
    fn rejects_degenerate_vertex_counts() {
        let mut rng = StdRng::seed_from_u64(0);
        for n in 0..3 {
            assert!(matches!(
                generate_convex_shape(n, &mut rng),
                Err(ResonatorError::Shape(_))
            ));
        }
        assert!(Polygon::new(vec![Vertex::new(0.0, 0.0), Vertex::new(1.0, 0.0)]).is_err());
    }

    proptest! {
        #[test]
        fn generated_shapes_are_convex_and_centered(n in 3usize..40, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let polygon = generate_convex_shape(n, &mut rng).unwrap();
            prop_assert_eq!(polygon.len(), n);

            // every consecutive turn goes the same way
            let v = polygon.vertices();
            let scale = 1e-12;
            for i in 0..n {
                let cross = orient(&v[i], &v[(i + 1) % n], &v[(i + 2) % n]);
                prop_assert!(cross >= -scale, "clockwise turn {} at {}", cross, i);
            }
            prop_assert!(polygon.area() > 0.0);

            let center = polygon.bounding_box().center();
            prop_assert!(center.x.abs() < 1e-12);
            prop_assert!(center.y.abs() < 1e-12);

            let bbox = polygon.bounding_box();
            prop_assert!(bbox.width() <= 1.0 && bbox.height() <= 1.0);
        }
    }

    #[test]
    fn convexity_check() {
        assert!(unit_square().is_convex());

        let dart = Polygon::new(vec![
            Vertex::new(0.0, 0.0),
            Vertex::new(2.0, 1.0),
            Vertex::new(0.0, 2.0),
            Vertex::new(0.5, 1.0),
        ])
        .unwrap();
        assert!(!dart.is_convex());

        let pentagram = Polygon::new(
            (0..5)
                .map(|i| {
                    let t = 2.0 * PI * (2 * i) as f64 / 5.0;
                    Vertex::new(t.cos(), t.sin())
                })
                .collect(),
        )
        .unwrap();
        assert!(!pentagram.is_convex());

        let flat = Polygon::new(vec![
            Vertex::new(0.0, 0.0),
            Vertex::new(1.0, 0.0),
            Vertex::new(2.0, 0.0),
        ])
        .unwrap();
        assert!(!flat.is_convex());
    }

    #[test]
    fn orientation_normalization() {
        let cw = Polygon::new(unit_square().vertices().iter().rev().copied().collect()).unwrap();
        assert!(cw.area() < 0.0);
        assert!(cw.counter_clockwise().area() > 0.0);
        assert_eq!(unit_square().area(), 1.0);
    }

    #[test]
    fn rasterize_square() {
        let square = Polygon::new(vec![
            Vertex::new(0.25, 0.25),
            Vertex::new(0.75, 0.25),
            Vertex::new(0.75, 0.75),
            Vertex::new(0.25, 0.75),
        ])
        .unwrap();
        let map = rasterize(&square, (8, 8));
        assert_eq!(map.data.len(), 64);
        assert_eq!(map.occupied(), 16);
        assert_eq!(map.get(0, 0), 0);
        assert_eq!(map.get(3, 3), 1);
        assert_eq!(map.get(2, 5), 1);
        assert_eq!(map.get(6, 3), 0);
    }

    #[test]
    fn rasterize_respects_orientation_of_axes() {
        // lower-left triangle: only pixels with small x + y are covered
        let triangle = Polygon::new(vec![
            Vertex::new(0.0, 0.0),
            Vertex::new(1.0, 0.0),
            Vertex::new(0.0, 1.0),
        ])
        .unwrap();
        let map = rasterize(&triangle, (4, 4));
        assert_eq!(map.get(0, 0), 1);
        assert_eq!(map.get(0, 2), 1);
        assert_eq!(map.get(3, 3), 0);
        assert_eq!(map.get(2, 0), 1);
        assert_eq!(map.get(2, 3), 0);
    }

    #[test]
    fn rasterize_samples_pixel_centres() {
        // covers the corners of four pixels but only one centre
        let corner = Polygon::new(vec![
            Vertex::new(0.0, 0.0),
            Vertex::new(0.3, 0.0),
            Vertex::new(0.3, 0.3),
            Vertex::new(0.0, 0.3),
        ])
        .unwrap();
        let map = rasterize(&corner, (4, 4));
        assert_eq!(map.occupied(), 1);
        assert_eq!(map.get(0, 0), 1);

        // rows and columns are scaled independently
        let map = rasterize(&corner, (2, 8));
        assert_eq!(map.occupied(), 2);
        assert_eq!(map.get(0, 0), 1);
        assert_eq!(map.get(0, 1), 1);
    }

    #[test]
    fn parse_csv_reads_columns_by_header() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id, y, x").unwrap();
        writeln!(file, "0, 0.0, 0.0").unwrap();
        writeln!(file, "1, 0.0, 1.0").unwrap();
        writeln!(file, "2, 1.0, 0.5").unwrap();

        let polygon = parse_csv(file.path().to_str().unwrap()).unwrap();
        assert_eq!(polygon.len(), 3);
        assert_eq!(polygon.vertices()[1], Vertex::new(1.0, 0.0));
        assert_eq!(polygon.vertices()[2], Vertex::new(0.5, 1.0));
    }

    #[test]
    fn parse_csv_rejects_missing_columns() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "a,b").unwrap();
        writeln!(file, "0,0").unwrap();
        assert!(matches!(
            parse_csv(file.path().to_str().unwrap()),
            Err(ResonatorError::Input(_))
        ));
    }
}
