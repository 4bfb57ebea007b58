//! Host-memory backend.
//!
//! Buffers live as `u32` words and images as `[f32; 4]` texels, so everything the
//! GPU path does can run (and be inspected) without a device. Dispatches are
//! executed by a pluggable [`HostKernel`]; [`CpuTracer`] mirrors the WGSL kernel.

use std::collections::{HashMap, HashSet};

use glam::{Mat3, Mat4, Vec2, Vec3};
use rayon::prelude::*;
use trace_kernel::{blend_weight, KernelUniforms, TILE_SIZE};

use super::backend::{BoundBuffer, BufferId, DispatchJob, GpuBackend, ImageId};
use crate::scene::{MeshDescriptor, SphereDescriptor};
use crate::util::{Error, Result};

/// Counters for every device-side operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub buffer_allocations: u64,
    pub buffer_releases: u64,
    pub buffer_uploads: u64,
    pub image_allocations: u64,
    pub image_releases: u64,
    pub dispatches: u64,
    pub blends: u64,
    pub presents: u64,
}

struct HostBuffer {
    label: String,
    count: usize,
    stride: usize,
    words: Vec<u32>,
}

impl HostBuffer {
    fn byte_len(&self) -> usize {
        self.count * self.stride
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u32, u8>(&self.words)[..self.byte_len()]
    }
}

struct HostImage {
    width: u32,
    height: u32,
    pixels: Vec<[f32; 4]>,
}

/// Read-only view of one dispatch, as the kernel sees its bindings.
///
/// Unbound slots appear as empty slices; mesh arrays are empty unless all
/// three mesh buffers are bound.
#[derive(Clone, Copy, Debug)]
pub struct HostDispatch<'a> {
    pub width: u32,
    pub height: u32,
    pub uniforms: &'a KernelUniforms,
    pub spheres: &'a [SphereDescriptor],
    pub meshes: &'a [MeshDescriptor],
    pub vertices: &'a [Vec3],
    pub indices: &'a [u32],
}

/// Executes a dispatch on the host, writing one texel per pixel of `output`.
pub trait HostKernel {
    fn run(&mut self, dispatch: &HostDispatch<'_>, output: &mut [[f32; 4]]) -> Result<()>;
}

impl<F> HostKernel for F
where
    F: FnMut(&HostDispatch<'_>, &mut [[f32; 4]]) -> Result<()>,
{
    fn run(&mut self, dispatch: &HostDispatch<'_>, output: &mut [[f32; 4]]) -> Result<()> {
        self(dispatch, output)
    }
}

/// Host-memory [`GpuBackend`].
pub struct HeadlessBackend {
    buffers: HashMap<u64, HostBuffer>,
    images: HashMap<u64, HostImage>,
    next_id: u64,
    memory_limit: Option<u64>,
    used_bytes: u64,
    kernel: Box<dyn HostKernel>,
    presented: Option<ImageId>,
    missing_bindings: HashSet<String>,
    stats: HeadlessStats,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HeadlessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessBackend")
            .field("buffers", &self.buffers.len())
            .field("images", &self.images.len())
            .field("used_bytes", &self.used_bytes)
            .field("memory_limit", &self.memory_limit)
            .field("stats", &self.stats)
            .finish()
    }
}

impl HeadlessBackend {
    /// Unlimited memory, [`CpuTracer`] as kernel.
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            images: HashMap::new(),
            next_id: 1,
            memory_limit: None,
            used_bytes: 0,
            kernel: Box::new(CpuTracer::default()),
            presented: None,
            missing_bindings: HashSet::new(),
            stats: HeadlessStats::default(),
        }
    }

    /// Fail allocations once `bytes` would be exceeded.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_kernel<K: HostKernel + 'static>(mut self, kernel: K) -> Self {
        self.kernel = Box::new(kernel);
        self
    }

    pub fn with_kernel_fn<F>(self, kernel: F) -> Self
    where
        F: FnMut(&HostDispatch<'_>, &mut [[f32; 4]]) -> Result<()> + 'static,
    {
        self.with_kernel(kernel)
    }

    /// Pretend the kernel does not declare `name`.
    pub fn with_missing_binding(mut self, name: &str) -> Self {
        self.missing_bindings.insert(name.to_string());
        self
    }

    pub fn set_memory_limit(&mut self, bytes: Option<u64>) {
        self.memory_limit = bytes;
    }

    pub fn stats(&self) -> HeadlessStats {
        self.stats
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    /// Last image handed to `present`.
    pub fn presented(&self) -> Option<ImageId> {
        self.presented
    }

    pub fn buffer_words(&self, id: BufferId) -> Option<&[u32]> {
        self.buffers.get(&id.0).map(|b| b.words.as_slice())
    }

    pub fn image_size(&self, id: ImageId) -> Option<(u32, u32)> {
        self.images.get(&id.0).map(|i| (i.width, i.height))
    }

    pub fn image_pixels(&self, id: ImageId) -> Option<&[[f32; 4]]> {
        self.images.get(&id.0).map(|i| i.pixels.as_slice())
    }

    /// Overwrite an image's texels. `pixels.len()` must be width × height.
    pub fn write_image(&mut self, id: ImageId, pixels: &[[f32; 4]]) -> Result<()> {
        let image = self.images.get_mut(&id.0).ok_or(Error::UnknownResource {
            kind: "image",
            id: id.0,
        })?;
        if pixels.len() != image.pixels.len() {
            return Err(Error::other(format!(
                "{id}: expected {} texels, got {}",
                image.pixels.len(),
                pixels.len()
            )));
        }
        image.pixels.copy_from_slice(pixels);
        Ok(())
    }

    /// Mean RGB over an image.
    pub fn image_mean(&self, id: ImageId) -> Option<Vec3> {
        let pixels = self.image_pixels(id)?;
        if pixels.is_empty() {
            return Some(Vec3::ZERO);
        }
        let sum = pixels
            .par_iter()
            .map(|p| Vec3::new(p[0], p[1], p[2]))
            .reduce(|| Vec3::ZERO, |a, b| a + b);
        Some(sum / pixels.len() as f32)
    }

    fn reserve(&mut self, resource: &str, bytes: u64) -> Result<()> {
        if let Some(limit) = self.memory_limit {
            if self.used_bytes + bytes > limit {
                tracing::warn!(resource, bytes, used = self.used_bytes, limit, "host memory budget exceeded");
                return Err(Error::exhausted(resource, bytes));
            }
        }
        self.used_bytes += bytes;
        Ok(())
    }

    fn issue_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

fn bound_slice<'a, T: bytemuck::Pod>(
    buffers: &'a HashMap<u64, HostBuffer>,
    binding: Option<BoundBuffer>,
) -> Result<&'a [T]> {
    let Some(bound) = binding else {
        return Ok(&[]);
    };
    let buffer = buffers.get(&bound.id.0).ok_or(Error::UnknownResource {
        kind: "buffer",
        id: bound.id.0,
    })?;
    let items: &[T] = bytemuck::try_cast_slice(buffer.bytes()).map_err(|_| Error::StrideMismatch {
        slot: buffer.label.clone(),
        expected: std::mem::size_of::<T>() as u64,
        actual: buffer.stride as u64,
    })?;
    Ok(&items[..items.len().min(bound.count as usize)])
}

impl GpuBackend for HeadlessBackend {
    fn binding_slot(&self, name: &str) -> Result<u32> {
        if self.missing_bindings.contains(name) {
            return Err(Error::MissingBinding(name.to_string()));
        }
        trace_kernel::bindings::slot_of(name).ok_or_else(|| Error::MissingBinding(name.to_string()))
    }

    fn create_buffer(&mut self, label: &str, count: usize, stride: usize) -> Result<BufferId> {
        if count == 0 || stride == 0 {
            return Err(Error::other(format!("{label}: zero-sized buffer")));
        }
        let bytes = count * stride;
        self.reserve(label, bytes as u64)?;
        let id = self.issue_id();
        self.buffers.insert(
            id,
            HostBuffer {
                label: label.to_string(),
                count,
                stride,
                words: vec![0; bytes.div_ceil(4)],
            },
        );
        self.stats.buffer_allocations += 1;
        tracing::debug!(label, count, stride, id, "buffer allocated");
        Ok(BufferId(id))
    }

    fn write_buffer(&mut self, id: BufferId, bytes: &[u8]) -> Result<()> {
        let buffer = self.buffers.get_mut(&id.0).ok_or(Error::UnknownResource {
            kind: "buffer",
            id: id.0,
        })?;
        if bytes.len() != buffer.byte_len() {
            return Err(Error::StrideMismatch {
                slot: buffer.label.clone(),
                expected: buffer.byte_len() as u64,
                actual: bytes.len() as u64,
            });
        }
        bytemuck::cast_slice_mut::<u32, u8>(&mut buffer.words)[..bytes.len()].copy_from_slice(bytes);
        self.stats.buffer_uploads += 1;
        Ok(())
    }

    fn release_buffer(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.remove(&id.0) {
            self.used_bytes -= buffer.byte_len() as u64;
            self.stats.buffer_releases += 1;
        }
    }

    fn create_image(&mut self, label: &str, width: u32, height: u32) -> Result<ImageId> {
        let texels = width as usize * height as usize;
        self.reserve(label, (texels * 16) as u64)?;
        let id = self.issue_id();
        self.images.insert(
            id,
            HostImage {
                width,
                height,
                pixels: vec![[0.0; 4]; texels],
            },
        );
        self.stats.image_allocations += 1;
        Ok(ImageId(id))
    }

    fn release_image(&mut self, id: ImageId) {
        if let Some(image) = self.images.remove(&id.0) {
            self.used_bytes -= (image.pixels.len() * 16) as u64;
            self.stats.image_releases += 1;
            if self.presented == Some(id) {
                self.presented = None;
            }
        }
    }

    fn dispatch(&mut self, job: &DispatchJob<'_>) -> Result<()> {
        let image = self.images.get_mut(&job.output.0).ok_or(Error::UnknownResource {
            kind: "image",
            id: job.output.0,
        })?;
        let (width, height) = (image.width, image.height);
        if job.groups[0] * TILE_SIZE < width || job.groups[1] * TILE_SIZE < height {
            return Err(Error::Dispatch(format!(
                "grid {:?} does not cover {width}x{height}",
                job.groups
            )));
        }

        let mesh_bound = job.bindings.mesh_count() > 0;
        let uniforms = job.uniforms;
        let dispatch = HostDispatch {
            width,
            height,
            uniforms,
            spheres: bound_slice(&self.buffers, job.bindings.spheres)?,
            meshes: if mesh_bound { bound_slice(&self.buffers, job.bindings.mesh_objects)? } else { &[] },
            vertices: if mesh_bound { bound_slice(&self.buffers, job.bindings.vertices)? } else { &[] },
            indices: if mesh_bound { bound_slice(&self.buffers, job.bindings.indices)? } else { &[] },
        };
        let dispatch = HostDispatch {
            spheres: &dispatch.spheres[..dispatch.spheres.len().min(uniforms.sphere_count as usize)],
            meshes: &dispatch.meshes[..dispatch.meshes.len().min(uniforms.mesh_count as usize)],
            ..dispatch
        };

        self.kernel.run(&dispatch, &mut image.pixels)?;
        self.stats.dispatches += 1;
        Ok(())
    }

    fn blend(&mut self, raw: ImageId, converged: ImageId, sample_count: u64) -> Result<()> {
        let dims = self.image_size(raw).ok_or(Error::UnknownResource {
            kind: "image",
            id: raw.0,
        })?;
        let target = self.images.get_mut(&converged.0).ok_or(Error::UnknownResource {
            kind: "image",
            id: converged.0,
        })?;
        if (target.width, target.height) != dims {
            return Err(Error::other(format!("{raw} and {converged} differ in size")));
        }

        // Two entries of the same map: take the target out while reading the source.
        let mut out = std::mem::take(&mut target.pixels);
        let source = self.images.get(&raw.0).map(|i| i.pixels.as_slice()).unwrap_or_default();
        let weight = blend_weight(sample_count);
        out.par_iter_mut().zip(source.par_iter()).for_each(|(c, s)| {
            if sample_count == 0 {
                *c = *s;
            } else {
                for k in 0..4 {
                    c[k] = c[k] * (1.0 - weight) + s[k] * weight;
                }
            }
        });
        if let Some(target) = self.images.get_mut(&converged.0) {
            target.pixels = out;
        }
        tracing::trace!(%raw, %converged, sample_count, weight, "blended");
        self.stats.blends += 1;
        Ok(())
    }

    fn present(&mut self, image: ImageId) -> Result<()> {
        if !self.images.contains_key(&image.0) {
            return Err(Error::UnknownResource {
                kind: "image",
                id: image.0,
            });
        }
        self.presented = Some(image);
        self.stats.presents += 1;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Reference kernel
// ----------------------------------------------------------------------------

const INF: f32 = f32::MAX;
const EPSILON: f32 = 1e-7;

/// Environment seen by rays that miss everything.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SkyModel {
    /// Vertical blend from `horizon` (y = -1) to `zenith` (y = +1).
    Gradient { horizon: Vec3, zenith: Vec3 },
    Constant(Vec3),
}

impl Default for SkyModel {
    fn default() -> Self {
        SkyModel::Gradient {
            horizon: Vec3::ONE,
            zenith: Vec3::new(0.5, 0.7, 1.0),
        }
    }
}

impl SkyModel {
    /// Radiance along `direction`, before sky brightness.
    pub fn sample(&self, direction: Vec3) -> Vec3 {
        match *self {
            SkyModel::Gradient { horizon, zenith } => horizon.lerp(zenith, 0.5 * (direction.y + 1.0)),
            SkyModel::Constant(color) => color,
        }
    }
}

fn pcg(v: u32) -> u32 {
    let state = v.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

struct Pcg(u32);

impl Pcg {
    fn next_f32(&mut self) -> f32 {
        self.0 = pcg(self.0);
        (self.0 >> 8) as f32 / 16_777_216.0
    }
}

struct Ray {
    origin: Vec3,
    direction: Vec3,
    energy: Vec3,
}

struct Hit {
    position: Vec3,
    distance: f32,
    normal: Vec3,
    albedo: Vec3,
    specular: Vec3,
    smoothness: f32,
    emission: Vec3,
}

impl Hit {
    fn none() -> Self {
        Self {
            position: Vec3::ZERO,
            distance: INF,
            normal: Vec3::ZERO,
            albedo: Vec3::ZERO,
            specular: Vec3::ZERO,
            smoothness: 0.0,
            emission: Vec3::ZERO,
        }
    }
}

fn intersect_sphere(ray: &Ray, best: &mut Hit, sphere: &SphereDescriptor) {
    let center = Vec3::from(sphere.position);
    let d = ray.origin - center;
    let p1 = -ray.direction.dot(d);
    let p2sqr = p1 * p1 - d.dot(d) + sphere.radius * sphere.radius;
    if p2sqr < 0.0 {
        return;
    }
    let p2 = p2sqr.sqrt();
    let t = if p1 - p2 > 0.0 { p1 - p2 } else { p1 + p2 };
    if t > 0.0 && t < best.distance {
        best.distance = t;
        best.position = ray.origin + t * ray.direction;
        best.normal = (best.position - center).normalize();
        best.albedo = Vec3::from(sphere.albedo);
        best.specular = Vec3::from(sphere.specular);
        best.emission = Vec3::from(sphere.emission);
        best.smoothness = sphere.smoothness;
    }
}

/// Möller–Trumbore; distance along the ray, or `None` on a miss.
fn intersect_triangle(ray: &Ray, v0: Vec3, v1: Vec3, v2: Vec3) -> Option<f32> {
    let edge1 = v1 - v0;
    let edge2 = v2 - v0;
    let pvec = ray.direction.cross(edge2);
    let det = edge1.dot(pvec);
    if det.abs() < EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;
    let tvec = ray.origin - v0;
    let u = tvec.dot(pvec) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let qvec = tvec.cross(edge1);
    let v = ray.direction.dot(qvec) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    Some(edge2.dot(qvec) * inv_det)
}

fn intersect_mesh(ray: &Ray, best: &mut Hit, mesh: &MeshDescriptor, vertices: &[Vec3], indices: &[u32]) {
    let local_to_world = Mat4::from_cols_array_2d(&mesh.local_to_world);
    let first = mesh.index_offset as usize;
    let count = mesh.index_count as usize;
    let Some(tris) = indices.get(first..first + count - count % 3) else {
        return;
    };
    for tri in tris.chunks_exact(3) {
        let corner = |i: u32| vertices.get(i as usize).map(|v| local_to_world.transform_point3(*v));
        let (Some(v0), Some(v1), Some(v2)) = (corner(tri[0]), corner(tri[1]), corner(tri[2])) else {
            continue;
        };
        let Some(t) = intersect_triangle(ray, v0, v1, v2) else {
            continue;
        };
        if t > 0.0 && t < best.distance {
            best.distance = t;
            best.position = ray.origin + t * ray.direction;
            let n = (v1 - v0).cross(v2 - v0).normalize();
            best.normal = if n.dot(ray.direction) > 0.0 { -n } else { n };
            best.albedo = Vec3::from(mesh.albedo);
            best.specular = Vec3::splat(mesh.specular);
            best.smoothness = mesh.smoothness;
            best.emission = Vec3::from(mesh.emission);
        }
    }
}

fn tangent_space(normal: Vec3) -> Mat3 {
    let helper = if normal.x.abs() > 0.99 { Vec3::Z } else { Vec3::X };
    let tangent = normal.cross(helper).normalize();
    let binormal = normal.cross(tangent).normalize();
    Mat3::from_cols(tangent, binormal, normal)
}

fn sample_hemisphere(rng: &mut Pcg, normal: Vec3, alpha: f32) -> Vec3 {
    let cos_theta = rng.next_f32().powf(1.0 / (alpha + 1.0));
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let phi = std::f32::consts::TAU * rng.next_f32();
    tangent_space(normal) * Vec3::new(phi.cos() * sin_theta, phi.sin() * sin_theta, cos_theta)
}

fn reflect(direction: Vec3, normal: Vec3) -> Vec3 {
    direction - 2.0 * direction.dot(normal) * normal
}

/// Host mirror of the trace kernel, with a procedural sky instead of a texture.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuTracer {
    pub sky: SkyModel,
}

impl CpuTracer {
    pub fn with_sky(sky: SkyModel) -> Self {
        Self { sky }
    }

    fn trace(&self, d: &HostDispatch<'_>, ray: &Ray) -> Hit {
        let mut best = Hit::none();
        for sphere in d.spheres {
            intersect_sphere(ray, &mut best, sphere);
        }
        for mesh in d.meshes {
            intersect_mesh(ray, &mut best, mesh, d.vertices, d.indices);
        }
        best
    }

    fn shade(&self, d: &HostDispatch<'_>, rng: &mut Pcg, ray: &mut Ray, hit: &Hit) -> Vec3 {
        if hit.distance >= INF {
            ray.energy = Vec3::ZERO;
            return self.sky.sample(ray.direction) * d.uniforms.sky_brightness;
        }

        let albedo = (Vec3::ONE - hit.specular).min(hit.albedo);
        let spec = crate::util::energy(hit.specular);
        let diff = crate::util::energy(albedo);
        let sum = spec + diff;
        ray.origin = hit.position + hit.normal * 0.001;
        if sum <= 0.0 {
            ray.energy = Vec3::ZERO;
            return hit.emission;
        }
        let (spec, diff) = (spec / sum, diff / sum);

        if rng.next_f32() < spec {
            let alpha = 1000f32.powf(hit.smoothness * hit.smoothness);
            ray.direction = sample_hemisphere(rng, reflect(ray.direction, hit.normal), alpha);
            let f = (alpha + 2.0) / (alpha + 1.0);
            ray.energy *= (1.0 / spec) * hit.specular * (hit.normal.dot(ray.direction) * f).clamp(0.0, 1.0);
        } else {
            ray.direction = sample_hemisphere(rng, hit.normal, 1.0);
            ray.energy *= (1.0 / diff) * albedo;
        }
        hit.emission
    }

    fn pixel(&self, d: &HostDispatch<'_>, x: u32, y: u32, camera: Mat4, inverse_projection: Mat4) -> Vec3 {
        let frame_seed = pcg(d.uniforms.seed.to_bits());
        let mut rng = Pcg(pcg(x.wrapping_add(y.wrapping_mul(d.width)).wrapping_add(frame_seed)));

        let size = Vec2::new(d.width as f32, d.height as f32);
        let mut uv = ((Vec2::new(x as f32, y as f32) + Vec2::from(d.uniforms.pixel_offset)) / size) * 2.0 - 1.0;
        uv.y = -uv.y;

        let view = (inverse_projection * uv.extend(0.0).extend(1.0)).truncate();
        let mut ray = Ray {
            origin: camera.transform_point3(Vec3::ZERO),
            direction: camera.transform_vector3(view).normalize(),
            energy: Vec3::ONE,
        };

        let mut result = Vec3::ZERO;
        for _ in 0..d.uniforms.bounces {
            let hit = self.trace(d, &ray);
            let energy = ray.energy;
            result += energy * self.shade(d, &mut rng, &mut ray, &hit);
            if !ray.energy.cmpgt(Vec3::ZERO).any() {
                break;
            }
        }
        result
    }
}

impl HostKernel for CpuTracer {
    fn run(&mut self, d: &HostDispatch<'_>, output: &mut [[f32; 4]]) -> Result<()> {
        let width = d.width as usize;
        if width == 0 || output.is_empty() {
            return Ok(());
        }
        let camera = d.uniforms.camera_to_world();
        let inverse_projection = d.uniforms.camera_inverse_projection();
        let tracer = &*self;
        output.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            for (x, texel) in row.iter_mut().enumerate() {
                let c = tracer.pixel(d, x as u32, y as u32, camera, inverse_projection);
                *texel = [c.x, c.y, c.z, 1.0];
            }
        });
        Ok(())
    }
}
