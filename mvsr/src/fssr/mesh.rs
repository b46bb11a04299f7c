//! Indexed triangle meshes
use nalgebra::Vector3;

/// An indexed 3D mesh with per-vertex attributes
///
/// Every per-vertex array has the same length as
/// [`self.vertices`](Self::vertices).
#[derive(Clone, Default, Debug)]
pub struct Mesh {
    /// Triangles, as indexes into [`self.vertices`](Self::vertices)
    pub triangles: Vec<Vector3<usize>>,
    /// Vertex positions
    pub vertices: Vec<Vector3<f32>>,
    /// Unit vertex normals, pointing out of the surface
    pub normals: Vec<Vector3<f32>>,
    /// Vertex colors
    pub colors: Vec<Vector3<f32>>,
    /// Interpolated sample scale at each vertex
    pub values: Vec<f32>,
    /// Interpolated confidence at each vertex
    pub confidences: Vec<f32>,
}

impl Mesh {
    /// Builds a new, empty mesh
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the (non-normalized) normal of a triangle
    ///
    /// Its length is twice the triangle's area.
    pub fn face_normal(&self, t: &Vector3<usize>) -> Vector3<f32> {
        let a = self.vertices[t.x];
        let b = self.vertices[t.y];
        let c = self.vertices[t.z];
        (b - a).cross(&(c - a))
    }

    /// Recomputes vertex normals from area-weighted face normals
    pub fn compute_normals(&mut self) {
        let mut normals = vec![Vector3::zeros(); self.vertices.len()];
        for t in &self.triangles {
            let n = self.face_normal(t);
            for v in t {
                normals[*v] += n;
            }
        }
        for n in &mut normals {
            let len = n.norm();
            if len > 0.0 {
                *n /= len;
            }
        }
        self.normals = normals;
    }

    /// Removes triangles touching a vertex with confidence at or below
    /// `min_confidence`, then drops unreferenced vertices
    ///
    /// Returns the number of triangles removed.
    pub fn delete_low_confidence(&mut self, min_confidence: f32) -> usize {
        let keep = |t: &Vector3<usize>| {
            t.iter().all(|v| self.confidences[*v] > min_confidence)
        };
        let before = self.triangles.len();
        let mut builder = MeshBuilder::default();
        for t in self.triangles.iter().filter(|t| keep(t)) {
            let tri = t.map(|v| builder.get(v, self));
            builder.push(tri);
        }
        let removed = before - builder.out.triangles.len();
        *self = builder.take();
        removed
    }
}

/// Container used while compacting a [`Mesh`]
#[derive(Default)]
struct MeshBuilder {
    /// Map from indexes in the source mesh to `out.vertices`
    ///
    /// `usize::MAX` is used a marker for an unmapped vertex
    map: Vec<usize>,
    out: Mesh,
}

impl MeshBuilder {
    /// Looks up the given vertex of `src`, copying it over on first use
    fn get(&mut self, v: usize, src: &Mesh) -> usize {
        if v >= self.map.len() {
            self.map.resize(v + 1, usize::MAX);
        }
        match self.map[v] {
            usize::MAX => {
                let next_vert = self.out.vertices.len();
                self.out.vertices.push(src.vertices[v]);
                if let Some(n) = src.normals.get(v) {
                    self.out.normals.push(*n);
                }
                self.out.colors.push(src.colors[v]);
                self.out.values.push(src.values[v]);
                self.out.confidences.push(src.confidences[v]);
                self.map[v] = next_vert;

                next_vert
            }
            u => u,
        }
    }
    fn push(&mut self, tri: Vector3<usize>) {
        self.out.triangles.push(tri)
    }
    fn take(self) -> Mesh {
        self.out
    }
}
