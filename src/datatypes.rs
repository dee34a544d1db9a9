#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub x: f64,
    pub y: f64,
}

impl Vertex {
    pub fn new(x: f64, y: f64) -> Vertex {
        Vertex { x, y }
    }

    pub fn distance(&self, other: &Vertex) -> f64 {
        f64::sqrt(f64::powi(self.x - other.x, 2) + f64::powi(self.y - other.y, 2))
    }

    pub fn midpoint(&self, other: &Vertex) -> Vertex {
        Vertex {
            x: 0.5 * (self.x + other.x),
            y: 0.5 * (self.y + other.y),
        }
    }
}

/// A linear triangle referencing three mesh vertices, counter-clockwise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    pub nodes: [usize; 3],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl BoundingBox {
    pub fn center(&self) -> Vertex {
        Vertex {
            x: 0.5 * (self.x_min + self.x_max),
            y: 0.5 * (self.y_min + self.y_max),
        }
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }
}

/// Twice the signed area of the triangle `a, b, c`. Positive when counter-clockwise.
pub fn orient(a: &Vertex, b: &Vertex, c: &Vertex) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}
