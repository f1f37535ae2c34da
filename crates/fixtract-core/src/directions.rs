//! The fixed hemispherical direction set and its constant-time assigner.
//!
//! Directions are generated deterministically by icosahedral subdivision:
//! four rounds of midpoint subdivision yield 2562 sphere vertices, which
//! collapse over antipodes to exactly 1281 hemisphere directions. Mesh
//! edges provide the per-direction adjacency consumed by FOD segmentation
//! and by the assigner's hill climb.
//!
//! `assign` resolves the nearest direction (under antipodal symmetry) to an
//! arbitrary unit vector in effectively constant time: a Cartesian lookup
//! grid spanning `[-1, 1]³` caches, for every cell a unit vector can touch,
//! the exhaustively-computed nearest direction to the cell centre; a query
//! then hill-climbs over mesh adjacency from that cached guess. Each climb
//! step strictly increases `|dir · direction|`, so termination is
//! guaranteed and no failure path exists.

use nalgebra::Vector3;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;

/// Index of a direction within a [`DirectionSet`].
pub type DirIndex = u32;

/// Number of Monte-Carlo samples used to estimate solid-angle weights.
const WEIGHT_SAMPLES: usize = 1 << 20;

/// An immutable set of pairwise non-antipodal unit directions with
/// adjacency, solid-angle weights and a fast nearest-direction lookup.
pub struct DirectionSet {
    dirs: Vec<Vector3<f64>>,
    adjacency: Vec<Vec<DirIndex>>,
    weights: Vec<f64>,
    grid_resolution: usize,
    grid: Vec<DirIndex>,
}

impl DirectionSet {
    /// The standard 1281-direction hemisphere set (order-4 icosphere).
    #[must_use]
    pub fn hemisphere_1281() -> Self {
        Self::from_tessellation(4)
    }

    /// Build a direction set from an icosahedral tessellation of the given
    /// subdivision order (order 0 is the bare icosahedron).
    #[must_use]
    pub fn from_tessellation(order: u32) -> Self {
        let (verts, faces) = icosphere(order);
        let (dirs, adjacency) = collapse_hemisphere(&verts, &faces);
        let mut set = Self {
            dirs,
            adjacency,
            weights: Vec::new(),
            grid_resolution: 0,
            grid: Vec::new(),
        };
        set.initialise_grid();
        set.initialise_weights();
        tracing::debug!(
            ndirs = set.len(),
            resolution = set.grid_resolution,
            "direction set initialised"
        );
        set
    }

    /// Number of directions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    /// Whether the set is empty (never true for tessellated sets).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// The unit vector of a direction.
    #[must_use]
    pub fn direction(&self, index: DirIndex) -> &Vector3<f64> {
        &self.dirs[index as usize]
    }

    /// Indices of the directions adjacent to `index` on the mesh.
    #[must_use]
    pub fn adjacent(&self, index: DirIndex) -> &[DirIndex] {
        &self.adjacency[index as usize]
    }

    /// Solid angle represented by a direction (weights sum to 4π).
    #[must_use]
    pub fn weight(&self, index: DirIndex) -> f64 {
        self.weights[index as usize]
    }

    /// Whether any direction adjacent to `index` is set in `mask`.
    #[must_use]
    pub fn mask_adjacent(&self, mask: &[bool], index: DirIndex) -> bool {
        self.adjacent(index).iter().any(|&a| mask[a as usize])
    }

    /// Nearest direction to `dir` under antipodal symmetry.
    #[must_use]
    pub fn assign(&self, dir: &Vector3<f64>) -> DirIndex {
        let r = self.grid_resolution;
        let clamp = |value: f64| -> usize {
            let cell = (0.5 * (value + 1.0) * r as f64).floor();
            (cell as i64).clamp(0, r as i64 - 1) as usize
        };
        let cell = (clamp(dir[2]) * r + clamp(dir[1])) * r + clamp(dir[0]);
        let guess = self.grid[cell];
        if guess as usize == self.len() {
            // A unit-norm query always lands in a populated cell; anything
            // else climbs from an arbitrary start.
            return self.assign_from(dir, 0);
        }
        self.assign_from(dir, guess)
    }

    /// Hill-climb to the nearest direction starting from `guess`.
    #[must_use]
    pub fn assign_from(&self, dir: &Vector3<f64>, guess: DirIndex) -> DirIndex {
        let mut result = guess;
        let mut best = dir.dot(self.direction(result)).abs();
        loop {
            let previous = result;
            for &i in self.adjacent(previous) {
                let dp = dir.dot(self.direction(i)).abs();
                if dp > best {
                    best = dp;
                    result = i;
                }
            }
            if result == previous {
                return result;
            }
        }
    }

    /// Nearest direction by exhaustive scan (reference implementation).
    #[must_use]
    pub fn assign_exhaustive(&self, dir: &Vector3<f64>) -> DirIndex {
        let mut result = 0u32;
        let mut best = dir.dot(&self.dirs[0]).abs();
        for (i, d) in self.dirs.iter().enumerate().skip(1) {
            let dp = dir.dot(d).abs();
            if dp > best {
                best = dp;
                result = i as DirIndex;
            }
        }
        result
    }

    /// Populate the Cartesian lookup grid.
    ///
    /// Only cells whose centre lies within half a cell diagonal of the unit
    /// sphere can contain a unit vector; every such cell caches the nearest
    /// direction to its centre, found by exhaustive scan.
    fn initialise_grid(&mut self) {
        let n = self.len();
        let resolution = (((2 * n) as f64).cbrt() / 2.0).ceil() as usize * 2;
        self.grid_resolution = resolution;
        self.grid = vec![n as DirIndex; resolution * resolution * resolution];

        let half_diagonal = (3.0 * (1.0 / resolution as f64).powi(2)).sqrt();
        let cell_width = 2.0 / resolution as f64;
        let mut index = 0usize;
        for zi in 0..resolution {
            let z = -1.0 + (zi as f64 + 0.5) * cell_width;
            for yi in 0..resolution {
                let y = -1.0 + (yi as f64 + 0.5) * cell_width;
                for xi in 0..resolution {
                    let x = -1.0 + (xi as f64 + 0.5) * cell_width;
                    let centre = Vector3::new(x, y, z);
                    if (centre.norm() - 1.0).abs() < half_diagonal {
                        let unit = centre.normalize();
                        self.grid[index] = self.assign_exhaustive(&unit);
                    }
                    index += 1;
                }
            }
        }
    }

    /// Estimate per-direction solid angles by seeded Monte-Carlo Voronoi
    /// assignment: sample uniform directions, assign each, and scale the
    /// hit counts to a total of 4π.
    fn initialise_weights(&mut self) {
        let mut rng = StdRng::seed_from_u64(self.len() as u64);
        let mut counts = vec![0u64; self.len()];
        for _ in 0..WEIGHT_SAMPLES {
            let dir = random_unit(&mut rng);
            counts[self.assign(&dir) as usize] += 1;
        }
        let scale = 4.0 * std::f64::consts::PI / WEIGHT_SAMPLES as f64;
        self.weights = counts.iter().map(|&c| c as f64 * scale).collect();
    }
}

/// Uniform random unit vector (rejection sampling from the cube).
fn random_unit<R: Rng>(rng: &mut R) -> Vector3<f64> {
    loop {
        let v = Vector3::new(
            2.0 * rng.random::<f64>() - 1.0,
            2.0 * rng.random::<f64>() - 1.0,
            2.0 * rng.random::<f64>() - 1.0,
        );
        let n2 = v.norm_squared();
        if n2 > 1e-8 && n2 <= 1.0 {
            return v / n2.sqrt();
        }
    }
}

/// Subdivided icosahedron: unit vertices plus triangular faces.
fn icosphere(order: u32) -> (Vec<Vector3<f64>>, Vec<[u32; 3]>) {
    let phi = (1.0 + 5.0_f64.sqrt()) / 2.0;
    let mut verts: Vec<Vector3<f64>> = [
        [-1.0, phi, 0.0],
        [1.0, phi, 0.0],
        [-1.0, -phi, 0.0],
        [1.0, -phi, 0.0],
        [0.0, -1.0, phi],
        [0.0, 1.0, phi],
        [0.0, -1.0, -phi],
        [0.0, 1.0, -phi],
        [phi, 0.0, -1.0],
        [phi, 0.0, 1.0],
        [-phi, 0.0, -1.0],
        [-phi, 0.0, 1.0],
    ]
    .iter()
    .map(|v| Vector3::new(v[0], v[1], v[2]).normalize())
    .collect();

    let mut faces: Vec<[u32; 3]> = vec![
        [0, 11, 5],
        [0, 5, 1],
        [0, 1, 7],
        [0, 7, 10],
        [0, 10, 11],
        [1, 5, 9],
        [5, 11, 4],
        [11, 10, 2],
        [10, 7, 6],
        [7, 1, 8],
        [3, 9, 4],
        [3, 4, 2],
        [3, 2, 6],
        [3, 6, 8],
        [3, 8, 9],
        [4, 9, 5],
        [2, 4, 11],
        [6, 2, 10],
        [8, 6, 7],
        [9, 8, 1],
    ];

    for _ in 0..order {
        let mut midpoints: HashMap<(u32, u32), u32> = HashMap::new();
        let mut next_faces = Vec::with_capacity(faces.len() * 4);
        for face in &faces {
            let mut mids = [0u32; 3];
            for e in 0..3 {
                let a = face[e];
                let b = face[(e + 1) % 3];
                let key = (a.min(b), a.max(b));
                mids[e] = *midpoints.entry(key).or_insert_with(|| {
                    let m = ((verts[a as usize] + verts[b as usize]) * 0.5).normalize();
                    verts.push(m);
                    verts.len() as u32 - 1
                });
            }
            next_faces.push([face[0], mids[0], mids[2]]);
            next_faces.push([face[1], mids[1], mids[0]]);
            next_faces.push([face[2], mids[2], mids[1]]);
            next_faces.push([mids[0], mids[1], mids[2]]);
        }
        faces = next_faces;
    }

    (verts, faces)
}

/// Whether a vertex is the canonical member of its antipodal pair
/// (lexicographic on (z, y, x); exact zeros fall through to the next axis).
#[inline]
fn is_canonical(v: &Vector3<f64>) -> bool {
    if v[2] != 0.0 {
        return v[2] > 0.0;
    }
    if v[1] != 0.0 {
        return v[1] > 0.0;
    }
    v[0] > 0.0
}

/// Bit-exact key for antipode matching. Central symmetry of the icosahedron
/// is preserved exactly by midpoint subdivision, so the antipode of every
/// vertex appears with bitwise-negated coordinates (modulo signed zeros,
/// which `+ 0.0` canonicalises).
#[inline]
fn bit_key(v: &Vector3<f64>) -> [u64; 3] {
    [
        (v[0] + 0.0).to_bits(),
        (v[1] + 0.0).to_bits(),
        (v[2] + 0.0).to_bits(),
    ]
}

/// Collapse a centrally-symmetric sphere mesh onto one hemisphere,
/// returning the kept directions and their collapsed adjacency lists.
fn collapse_hemisphere(
    verts: &[Vector3<f64>],
    faces: &[[u32; 3]],
) -> (Vec<Vector3<f64>>, Vec<Vec<DirIndex>>) {
    // Map every vertex to the index of its canonical representative.
    let mut kept: Vec<Vector3<f64>> = Vec::with_capacity(verts.len() / 2);
    let mut kept_lookup: HashMap<[u64; 3], DirIndex> = HashMap::with_capacity(verts.len() / 2);
    for v in verts {
        if is_canonical(v) {
            kept_lookup.insert(bit_key(v), kept.len() as DirIndex);
            kept.push(*v);
        }
    }
    let representative = |v: &Vector3<f64>| -> DirIndex {
        let canonical = if is_canonical(v) { *v } else { -*v };
        kept_lookup[&bit_key(&canonical)]
    };

    let mut adjacency: Vec<Vec<DirIndex>> = vec![Vec::new(); kept.len()];
    let mut push_edge = |a: u32, b: u32| {
        let ra = representative(&verts[a as usize]);
        let rb = representative(&verts[b as usize]);
        if ra != rb && !adjacency[ra as usize].contains(&rb) {
            adjacency[ra as usize].push(rb);
            adjacency[rb as usize].push(ra);
        }
    };
    for face in faces {
        push_edge(face[0], face[1]);
        push_edge(face[1], face[2]);
        push_edge(face[2], face[0]);
    }
    for list in &mut adjacency {
        list.sort_unstable();
    }

    (kept, adjacency)
}
