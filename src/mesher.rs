use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
};

use log::{debug, info};
use rand::Rng;
use triangle_rs::Builder;

use crate::{
    datatypes::{orient, Element, Vertex},
    error::{ResonatorError, Result},
    shape::{generate_convex_shape, Polygon},
};

/// Minimum angle Triangle's quality refinement aims for
pub const MIN_QUALITY_ANGLE_DEG: f64 = 20.0;
/// Upper bound on interior Steiner points added by the quality pass
pub const MAX_QUALITY_STEINER_POINTS: usize = 256;
/// Relative tolerance on the triangulated area versus the polygon area
pub const AREA_TOLERANCE: f64 = 1e-9;

/// Content hash of a mesh, stable across identical constructions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshId(pub u64);

/// A linear triangle mesh with a precomputed boundary classification
#[derive(Debug, Clone)]
pub struct Mesh {
    vertices: Vec<Vertex>,
    elements: Vec<Element>,
    boundary: Vec<bool>,
    id: MeshId,
}

impl Mesh {
    /// Builds a mesh from raw parts, checking connectivity and orientation
    ///
    /// # Arguments
    /// * `vertices` - Vertex coordinates
    /// * `elements` - Counter-clockwise triangles referencing `vertices`
    pub fn from_parts(vertices: Vec<Vertex>, elements: Vec<Element>) -> Result<Mesh> {
        if elements.is_empty() {
            return Err(ResonatorError::Triangulation(
                "Mesh has no elements".to_owned(),
            ));
        }

        for (i, element) in elements.iter().enumerate() {
            if let Some(bad) = element.nodes.iter().find(|n| **n >= vertices.len()) {
                return Err(ResonatorError::Triangulation(format!(
                    "Element {i} references vertex {bad}, but the mesh has {} vertices",
                    vertices.len()
                )));
            }
            let [a, b, c] = element.nodes.map(|n| &vertices[n]);
            if orient(a, b, c) <= 0.0 {
                return Err(ResonatorError::Triangulation(format!(
                    "Element {i} is degenerate or clockwise"
                )));
            }
        }

        let boundary = boundary_flags(vertices.len(), &elements);
        let id = compute_id(&vertices, &elements);

        Ok(Mesh {
            vertices,
            elements,
            boundary,
            id,
        })
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn n_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn n_elements(&self) -> usize {
        self.elements.len()
    }

    pub fn id(&self) -> MeshId {
        self.id
    }

    pub fn is_boundary(&self, node: usize) -> bool {
        self.boundary[node]
    }

    /// Indices of vertices on the domain boundary, ascending
    pub fn boundary_nodes(&self) -> Vec<usize> {
        (0..self.vertices.len()).filter(|i| self.boundary[*i]).collect()
    }

    /// Indices of vertices strictly inside the domain, ascending
    pub fn interior_nodes(&self) -> Vec<usize> {
        (0..self.vertices.len()).filter(|i| !self.boundary[*i]).collect()
    }

    /// Sum of the element areas
    pub fn area(&self) -> f64 {
        self.elements
            .iter()
            .map(|e| compute_element_area(e, &self.vertices))
            .sum()
    }

    /// Uniformly scales the coordinates. Connectivity is unchanged.
    pub fn scaled(&self, factor: f64) -> Mesh {
        let vertices: Vec<Vertex> = self
            .vertices
            .iter()
            .map(|v| Vertex::new(v.x * factor, v.y * factor))
            .collect();
        let id = compute_id(&vertices, &self.elements);

        Mesh {
            vertices,
            elements: self.elements.clone(),
            boundary: self.boundary.clone(),
            id,
        }
    }

    /// Splits every triangle into four at its edge midpoints.
    ///
    /// Existing vertices keep their indices; new midpoints are appended.
    pub fn refined(&self) -> Mesh {
        let mut vertices = self.vertices.clone();
        let mut midpoints: HashMap<(usize, usize), usize> = HashMap::new();
        let mut elements: Vec<Element> = Vec::with_capacity(4 * self.elements.len());

        for element in &self.elements {
            let [a, b, c] = element.nodes;
            let ab = midpoint_index(&mut vertices, &mut midpoints, a, b);
            let bc = midpoint_index(&mut vertices, &mut midpoints, b, c);
            let ca = midpoint_index(&mut vertices, &mut midpoints, c, a);

            elements.push(Element { nodes: [a, ab, ca] });
            elements.push(Element { nodes: [ab, b, bc] });
            elements.push(Element { nodes: [ca, bc, c] });
            elements.push(Element { nodes: [ab, bc, ca] });
        }

        let boundary = boundary_flags(vertices.len(), &elements);
        let id = compute_id(&vertices, &elements);

        Mesh {
            vertices,
            elements,
            boundary,
            id,
        }
    }
}

/// Calculates the area of the element
///
/// # Arguments
/// * `element` - The Element to target
/// * `vertices` - A reference to the mesh vertices
///
/// # Returns
/// The signed area of the element, positive when counter-clockwise
pub fn compute_element_area(element: &Element, vertices: &[Vertex]) -> f64 {
    let v0 = &vertices[element.nodes[0]];
    let v1 = &vertices[element.nodes[1]];
    let v2 = &vertices[element.nodes[2]];

    0.5 * (v0.x * (v1.y - v2.y) + v1.x * (v2.y - v0.y) + v2.x * (v0.y - v1.y))
}

fn midpoint_index(
    vertices: &mut Vec<Vertex>,
    midpoints: &mut HashMap<(usize, usize), usize>,
    a: usize,
    b: usize,
) -> usize {
    let key = (a.min(b), a.max(b));
    *midpoints.entry(key).or_insert_with(|| {
        let midpoint = vertices[a].midpoint(&vertices[b]);
        vertices.push(midpoint);
        vertices.len() - 1
    })
}

/// Flags the vertices that touch an edge owned by a single element
fn boundary_flags(n_vertices: usize, elements: &[Element]) -> Vec<bool> {
    let mut edge_counts: HashMap<(usize, usize), usize> = HashMap::new();
    for element in elements {
        for (a, b) in element_edges(&element.nodes) {
            *edge_counts.entry((a.min(b), a.max(b))).or_insert(0) += 1;
        }
    }

    let mut boundary = vec![false; n_vertices];
    for ((a, b), count) in edge_counts {
        if count == 1 {
            boundary[a] = true;
            boundary[b] = true;
        }
    }
    boundary
}

fn element_edges(nodes: &[usize; 3]) -> [(usize, usize); 3] {
    [(nodes[0], nodes[1]), (nodes[1], nodes[2]), (nodes[2], nodes[0])]
}

fn compute_id(vertices: &[Vertex], elements: &[Element]) -> MeshId {
    let mut hasher = DefaultHasher::new();
    vertices.len().hash(&mut hasher);
    for v in vertices {
        v.x.to_bits().hash(&mut hasher);
        v.y.to_bits().hash(&mut hasher);
    }
    for e in elements {
        e.nodes.hash(&mut hasher);
    }
    MeshId(hasher.finish())
}

/// Builds a quality Delaunay triangulation of the polygon's convex hull with
/// Triangle. Only interior Steiner points are allowed.
fn triangulate(polygon: &Polygon) -> Result<(Vec<Vertex>, Vec<Element>)> {
    let nodes: Vec<f64> = polygon.vertices().iter().flat_map(|v| [v.x, v.y]).collect();
    // z: zero based indices, Q: quiet, Y: no Steiner points on the hull
    let switches = format!(
        "zQq{}S{}Y",
        MIN_QUALITY_ANGLE_DEG, MAX_QUALITY_STEINER_POINTS
    );
    let delaunay = Builder::new()
        .add_nodes(&nodes)
        .set_switches(&switches)
        .build();

    let vertices: Vec<Vertex> = delaunay
        .points
        .chunks_exact(2)
        .map(|p| Vertex::new(p[0], p[1]))
        .collect();
    let elements: Vec<Element> = delaunay
        .triangles
        .chunks_exact(3)
        .map(|t| Element {
            nodes: [t[0], t[1], t[2]],
        })
        .collect();

    if vertices.len() < polygon.len()
        || vertices[..polygon.len()] != *polygon.vertices()
    {
        return Err(ResonatorError::Triangulation(
            "Triangulation dropped or moved polygon vertices".to_owned(),
        ));
    }

    Ok((vertices, elements))
}

/// Triangulates a convex polygon and refines it into a finite element mesh
///
/// # Arguments
/// * `polygon` - A convex boundary, in either orientation
/// * `n_refinements` - Number of uniform midpoint subdivision passes
///
/// # Returns
/// A mesh whose first vertices are the polygon vertices
pub fn create_mesh(polygon: &Polygon, n_refinements: usize) -> Result<Mesh> {
    let polygon = polygon.counter_clockwise();
    if !polygon.is_convex() {
        return Err(ResonatorError::Triangulation(
            "Polygon is degenerate, self-intersecting or not convex".to_owned(),
        ));
    }

    let (vertices, elements) = triangulate(&polygon)?;
    debug!(
        "triangulated {} vertices into {} triangles with {} steiner points",
        polygon.len(),
        elements.len(),
        vertices.len() - polygon.len()
    );

    let mut mesh = Mesh::from_parts(vertices, elements)?;
    let area = mesh.area();
    if (area - polygon.area()).abs() > AREA_TOLERANCE * polygon.area().abs() {
        return Err(ResonatorError::Triangulation(format!(
            "Triangulated area {area} does not match polygon area {}",
            polygon.area()
        )));
    }

    for _ in 0..n_refinements {
        mesh = mesh.refined();
    }

    info!(
        "built mesh with {} nodes and {} elements",
        mesh.n_vertices(),
        mesh.n_elements()
    );

    Ok(mesh)
}

/// Random convex plate spanning at most `[-1, 1]²`
///
/// # Arguments
/// * `n_points` - Number of polygon vertices
/// * `n_refinements` - Number of uniform midpoint subdivision passes
/// * `rng` - Source of randomness for the shape
///
/// # Returns
/// The refined mesh and the boundary it was built from
pub fn generate_convex_mesh<R: Rng + ?Sized>(
    n_points: usize,
    n_refinements: usize,
    rng: &mut R,
) -> Result<(Mesh, Polygon)> {
    let polygon = generate_convex_shape(n_points, rng)?.scaled(2.0);
    let mesh = create_mesh(&polygon, n_refinements)?;
    Ok((mesh, polygon))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::generate_convex_shape;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn square(side: f64) -> Polygon {
        Polygon::new(vec![
            Vertex::new(0.0, 0.0),
            Vertex::new(side, 0.0),
            Vertex::new(side, side),
            Vertex::new(0.0, side),
        ])
        .unwrap()
    }

    #[test]
    fn square_triangulation() {
        let mesh = create_mesh(&square(1.0), 0).unwrap();
        assert_eq!(mesh.n_elements(), 2);
        assert_eq!(mesh.n_vertices(), 4);
        assert!(mesh.interior_nodes().is_empty());
        assert_relative_eq!(mesh.area(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn refinement_quadruples_triangles() {
        let coarse = create_mesh(&square(1.0), 0).unwrap();
        let fine = create_mesh(&square(1.0), 2).unwrap();
        assert_eq!(fine.n_elements(), 16 * coarse.n_elements());
        // 5x5 grid of nodes
        assert_eq!(fine.n_vertices(), 25);
        assert_eq!(fine.interior_nodes().len(), 9);
        assert_eq!(fine.boundary_nodes().len(), 16);
        assert_relative_eq!(fine.area(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn refinement_is_monotone_and_keeps_boundary() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            let polygon = generate_convex_shape(10, &mut rng).unwrap();
            let mut previous = create_mesh(&polygon, 0).unwrap();
            let base_boundary: Vec<Vertex> = previous
                .boundary_nodes()
                .iter()
                .map(|i| previous.vertices()[*i])
                .collect();

            for _ in 0..3 {
                let next = previous.refined();
                assert!(next.n_elements() >= previous.n_elements());
                for v in &base_boundary {
                    assert!(next
                        .vertices()
                        .iter()
                        .any(|w| (w.x - v.x).abs() < 1e-12 && (w.y - v.y).abs() < 1e-12));
                }
                assert_relative_eq!(next.area(), polygon.area().abs(), max_relative = 1e-9);
                previous = next;
            }
        }
    }

    #[test]
    fn polygon_vertices_stay_on_the_boundary() {
        let mut rng = StdRng::seed_from_u64(11);
        let polygon = generate_convex_shape(12, &mut rng).unwrap();
        let mesh = create_mesh(&polygon, 1).unwrap();
        let ccw = polygon.counter_clockwise();
        for (i, v) in ccw.vertices().iter().enumerate() {
            assert_eq!(&mesh.vertices()[i], v);
            assert!(mesh.is_boundary(i));
        }
        for i in mesh.interior_nodes() {
            let v = mesh.vertices()[i];
            assert!(ccw.contains(v.x, v.y));
        }
    }

    #[test]
    fn quality_pass_adds_interior_points_only() {
        // every triangulation of a regular 12-gon alone has a 15 degree ear
        let polygon = Polygon::new(
            (0..12)
                .map(|i| {
                    let t = std::f64::consts::PI * i as f64 / 6.0;
                    Vertex::new(t.cos(), t.sin())
                })
                .collect(),
        )
        .unwrap();
        let mesh = create_mesh(&polygon, 0).unwrap();
        assert!(mesh.n_vertices() > 12);
        assert_eq!(mesh.boundary_nodes(), (0..12).collect::<Vec<_>>());
        for i in mesh.interior_nodes() {
            let v = mesh.vertices()[i];
            assert!(polygon.contains(v.x, v.y));
        }
        assert_relative_eq!(mesh.area(), polygon.area().abs(), max_relative = 1e-9);
    }

    #[test]
    fn quality_pass_never_splits_the_boundary() {
        let polygon = Polygon::new(vec![
            Vertex::new(0.0, 0.0),
            Vertex::new(4.0, 0.0),
            Vertex::new(4.0, 1.0),
            Vertex::new(0.0, 1.0),
        ])
        .unwrap();
        let mesh = create_mesh(&polygon, 0).unwrap();
        assert_eq!(mesh.boundary_nodes(), vec![0, 1, 2, 3]);
        assert_relative_eq!(mesh.area(), 4.0, epsilon = 1e-9);
    }

    #[test]
    fn interior_nodes_are_deterministic() {
        let mut rng = StdRng::seed_from_u64(3);
        let polygon = generate_convex_shape(8, &mut rng).unwrap();
        let a = create_mesh(&polygon, 2).unwrap();
        let b = create_mesh(&polygon, 2).unwrap();
        assert_eq!(a.interior_nodes(), b.interior_nodes());
        assert_eq!(a.id(), b.id());
        assert!(a.interior_nodes().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn scaling_keeps_connectivity() {
        let mesh = create_mesh(&square(1.0), 1).unwrap();
        let scaled = mesh.scaled(3.0);
        assert_eq!(mesh.elements(), scaled.elements());
        assert_eq!(mesh.interior_nodes(), scaled.interior_nodes());
        assert_ne!(mesh.id(), scaled.id());
        assert_relative_eq!(scaled.area(), 9.0, epsilon = 1e-12);
        assert_eq!(scaled.vertices()[2], Vertex::new(3.0, 3.0));
    }

    #[test]
    fn rejects_non_convex_and_degenerate_polygons() {
        let dart = Polygon::new(vec![
            Vertex::new(0.0, 0.0),
            Vertex::new(2.0, 1.0),
            Vertex::new(0.0, 2.0),
            Vertex::new(0.5, 1.0),
        ])
        .unwrap();
        assert!(matches!(
            create_mesh(&dart, 0),
            Err(ResonatorError::Triangulation(_))
        ));

        let flat = Polygon::new(vec![
            Vertex::new(0.0, 0.0),
            Vertex::new(1.0, 1.0),
            Vertex::new(2.0, 2.0),
        ])
        .unwrap();
        assert!(matches!(
            create_mesh(&flat, 1),
            Err(ResonatorError::Triangulation(_))
        ));
    }

    #[test]
    fn convex_mesh_spans_the_doubled_shape() {
        let mut rng = StdRng::seed_from_u64(21);
        let (mesh, polygon) = generate_convex_mesh(10, 2, &mut rng).unwrap();

        assert_eq!(polygon.len(), 10);
        let bbox = polygon.bounding_box();
        assert!(bbox.width() <= 2.0 + 1e-12 && bbox.height() <= 2.0 + 1e-12);
        assert!(bbox.width() > 1.0 || bbox.height() > 1.0);
        for v in mesh.vertices() {
            assert!(v.x.abs() <= 1.0 + 1e-12 && v.y.abs() <= 1.0 + 1e-12);
        }

        let again = create_mesh(&polygon, 2).unwrap();
        assert_eq!(mesh.id(), again.id());
        assert_relative_eq!(mesh.area(), polygon.area().abs(), max_relative = 1e-9);

        assert!(matches!(
            generate_convex_mesh(2, 0, &mut rng),
            Err(ResonatorError::Shape(_))
        ));
    }

    #[test]
    fn from_parts_validates_indices() {
        let vertices = vec![Vertex::new(0.0, 0.0), Vertex::new(1.0, 0.0)];
        let elements = vec![Element { nodes: [0, 1, 2] }];
        assert!(matches!(
            Mesh::from_parts(vertices, elements),
            Err(ResonatorError::Triangulation(_))
        ));
    }
}
