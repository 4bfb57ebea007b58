//! Progressive path tracing kernel for wgpu
//!
//! WGSL compute kernels and the host-side layouts they consume:
//! - [`TRACE_KERNEL_SOURCE`] writes one noisy sample per pixel into `Result`
//! - [`BLEND_SHADER_SOURCE`] folds that sample into the converged running mean
//!
//! Structured buffers are declared as flat scalar arrays so their element strides
//! are exactly the host strides below (WGSL would pad `vec3` to 16 bytes).
//!
//! ## Usage
//!
//! ```ignore
//! use trace_kernel::{dispatch_groups, KernelUniforms};
//!
//! let uniforms = KernelUniforms::default().with_camera(camera_to_world, inv_proj);
//! queue.write_buffer(&uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
//! let [x, y, z] = dispatch_groups(width, height);
//! pass.dispatch_workgroups(x, y, z);
//! ```

mod params;

pub use params::{blend_weight, BlendUniforms, KernelUniforms};

/// Square workgroup edge (must match @workgroup_size in both kernels).
pub const TILE_SIZE: u32 = 8;

/// Bytes per vertex record in `_Vertices` (3 × f32).
pub const VERTEX_STRIDE: usize = 12;
/// Bytes per index record in `_Indices` (u32).
pub const INDEX_STRIDE: usize = 4;
/// Bytes per mesh record in `_MeshObjects`.
pub const MESH_OBJECT_STRIDE: usize = 104;
/// Bytes per sphere record in `_Spheres`.
pub const SPHERE_STRIDE: usize = 56;

const _: () = assert!(std::mem::size_of::<KernelUniforms>() == 160);
const _: () = assert!(std::mem::size_of::<BlendUniforms>() == 16);

/// Resource names the trace kernel binds.
pub mod bindings {
    /// Writable raw-sample image.
    pub const RESULT: &str = "Result";
    /// Read-only environment image.
    pub const SKYBOX_TEXTURE: &str = "_SkyboxTexture";
    pub const SPHERES: &str = "_Spheres";
    pub const MESH_OBJECTS: &str = "_MeshObjects";
    pub const VERTICES: &str = "_Vertices";
    pub const INDICES: &str = "_Indices";

    pub const CAMERA_TO_WORLD: &str = "_CameraToWorld";
    pub const CAMERA_INVERSE_PROJECTION: &str = "_CameraInverseProjection";
    pub const PIXEL_OFFSET: &str = "_PixelOffset";
    pub const SEED: &str = "_Seed";
    pub const SKY_BRIGHTNESS: &str = "_SkyBrightness";
    pub const BOUNCES: &str = "_Bounces";

    /// Binding slots in group 0 of the trace kernel.
    pub const RESULT_BINDING: u32 = 0;
    pub const SKYBOX_BINDING: u32 = 1;
    pub const SPHERES_BINDING: u32 = 2;
    pub const MESH_OBJECTS_BINDING: u32 = 3;
    pub const VERTICES_BINDING: u32 = 4;
    pub const INDICES_BINDING: u32 = 5;
    pub const UNIFORMS_BINDING: u32 = 6;

    /// Binding slot of a named kernel resource.
    pub fn slot_of(name: &str) -> Option<u32> {
        match name {
            RESULT => Some(RESULT_BINDING),
            SKYBOX_TEXTURE => Some(SKYBOX_BINDING),
            SPHERES => Some(SPHERES_BINDING),
            MESH_OBJECTS => Some(MESH_OBJECTS_BINDING),
            VERTICES => Some(VERTICES_BINDING),
            INDICES => Some(INDICES_BINDING),
            _ => None,
        }
    }
}

/// Workgroup grid covering a `width` × `height` image, rounding up.
#[inline]
pub fn dispatch_groups(width: u32, height: u32) -> [u32; 3] {
    [width.div_ceil(TILE_SIZE), height.div_ceil(TILE_SIZE), 1]
}

/// Trace kernel: one sample per pixel, spheres + triangle meshes + equirect sky.
pub const TRACE_KERNEL_SOURCE: &str = r#"
const PI: f32 = 3.14159265359;
const INF: f32 = 3.4e38;
const EPSILON: f32 = 1e-7;
const SPHERE_FLOATS: u32 = 14u;
const MESH_WORDS: u32 = 26u;

struct KernelUniforms {
    _CameraToWorld: mat4x4<f32>,
    _CameraInverseProjection: mat4x4<f32>,
    _PixelOffset: vec2<f32>,
    _Seed: f32,
    _SkyBrightness: f32,
    _Bounces: u32,
    sphere_count: u32,
    mesh_count: u32,
    _pad: u32,
}

@group(0) @binding(0) var Result: texture_storage_2d<rgba32float, write>;
@group(0) @binding(1) var _SkyboxTexture: texture_2d<f32>;
@group(0) @binding(2) var<storage, read> _Spheres: array<f32>;
@group(0) @binding(3) var<storage, read> _MeshObjects: array<u32>;
@group(0) @binding(4) var<storage, read> _Vertices: array<f32>;
@group(0) @binding(5) var<storage, read> _Indices: array<u32>;
@group(0) @binding(6) var<uniform> params: KernelUniforms;

var<private> rng_state: u32;

fn pcg(v: u32) -> u32 {
    let state = v * 747796405u + 2891336453u;
    let word = ((state >> ((state >> 28u) + 4u)) ^ state) * 277803737u;
    return (word >> 22u) ^ word;
}

fn rand() -> f32 {
    rng_state = pcg(rng_state);
    return f32(rng_state >> 8u) / 16777216.0;
}

struct Ray {
    origin: vec3<f32>,
    direction: vec3<f32>,
    energy: vec3<f32>,
}

struct Hit {
    position: vec3<f32>,
    distance: f32,
    normal: vec3<f32>,
    albedo: vec3<f32>,
    specular: vec3<f32>,
    smoothness: f32,
    emission: vec3<f32>,
}

fn no_hit() -> Hit {
    return Hit(vec3<f32>(0.0), INF, vec3<f32>(0.0), vec3<f32>(0.0), vec3<f32>(0.0), 0.0, vec3<f32>(0.0));
}

fn camera_ray(uv: vec2<f32>) -> Ray {
    let origin = (params._CameraToWorld * vec4<f32>(0.0, 0.0, 0.0, 1.0)).xyz;
    var direction = (params._CameraInverseProjection * vec4<f32>(uv, 0.0, 1.0)).xyz;
    direction = normalize((params._CameraToWorld * vec4<f32>(direction, 0.0)).xyz);
    return Ray(origin, direction, vec3<f32>(1.0));
}

fn sphere_vec3(base: u32) -> vec3<f32> {
    return vec3<f32>(_Spheres[base], _Spheres[base + 1u], _Spheres[base + 2u]);
}

fn intersect_sphere(ray: Ray, best: ptr<function, Hit>, index: u32) {
    let base = index * SPHERE_FLOATS;
    let center = sphere_vec3(base);
    let radius = _Spheres[base + 3u];
    let d = ray.origin - center;
    let p1 = -dot(ray.direction, d);
    let p2sqr = p1 * p1 - dot(d, d) + radius * radius;
    if (p2sqr < 0.0) {
        return;
    }
    let p2 = sqrt(p2sqr);
    var t = p1 - p2;
    if (t <= 0.0) {
        t = p1 + p2;
    }
    if (t > 0.0 && t < (*best).distance) {
        (*best).distance = t;
        (*best).position = ray.origin + t * ray.direction;
        (*best).normal = normalize((*best).position - center);
        (*best).albedo = sphere_vec3(base + 4u);
        (*best).specular = sphere_vec3(base + 7u);
        (*best).emission = sphere_vec3(base + 10u);
        (*best).smoothness = _Spheres[base + 13u];
    }
}

fn mesh_f32(base: u32, offset: u32) -> f32 {
    return bitcast<f32>(_MeshObjects[base + offset]);
}

fn mesh_vec3(base: u32, offset: u32) -> vec3<f32> {
    return vec3<f32>(mesh_f32(base, offset), mesh_f32(base, offset + 1u), mesh_f32(base, offset + 2u));
}

fn mesh_column(base: u32, column: u32) -> vec4<f32> {
    let o = column * 4u;
    return vec4<f32>(mesh_f32(base, o), mesh_f32(base, o + 1u), mesh_f32(base, o + 2u), mesh_f32(base, o + 3u));
}

fn vertex(index: u32) -> vec3<f32> {
    let v = _Indices[index] * 3u;
    return vec3<f32>(_Vertices[v], _Vertices[v + 1u], _Vertices[v + 2u]);
}

// Moller-Trumbore; returns (t, u, v) or t = INF on miss.
fn intersect_triangle(ray: Ray, v0: vec3<f32>, v1: vec3<f32>, v2: vec3<f32>) -> vec3<f32> {
    let edge1 = v1 - v0;
    let edge2 = v2 - v0;
    let pvec = cross(ray.direction, edge2);
    let det = dot(edge1, pvec);
    if (abs(det) < EPSILON) {
        return vec3<f32>(INF, 0.0, 0.0);
    }
    let inv_det = 1.0 / det;
    let tvec = ray.origin - v0;
    let u = dot(tvec, pvec) * inv_det;
    if (u < 0.0 || u > 1.0) {
        return vec3<f32>(INF, 0.0, 0.0);
    }
    let qvec = cross(tvec, edge1);
    let v = dot(ray.direction, qvec) * inv_det;
    if (v < 0.0 || u + v > 1.0) {
        return vec3<f32>(INF, 0.0, 0.0);
    }
    return vec3<f32>(dot(edge2, qvec) * inv_det, u, v);
}

fn intersect_mesh(ray: Ray, best: ptr<function, Hit>, index: u32) {
    let base = index * MESH_WORDS;
    let local_to_world = mat4x4<f32>(
        mesh_column(base, 0u), mesh_column(base, 1u), mesh_column(base, 2u), mesh_column(base, 3u),
    );
    let first = _MeshObjects[base + 16u];
    let count = _MeshObjects[base + 17u];
    let end = first + count - count % 3u;
    for (var i = first; i < end; i += 3u) {
        let v0 = (local_to_world * vec4<f32>(vertex(i), 1.0)).xyz;
        let v1 = (local_to_world * vec4<f32>(vertex(i + 1u), 1.0)).xyz;
        let v2 = (local_to_world * vec4<f32>(vertex(i + 2u), 1.0)).xyz;
        let tuv = intersect_triangle(ray, v0, v1, v2);
        if (tuv.x > 0.0 && tuv.x < (*best).distance) {
            (*best).distance = tuv.x;
            (*best).position = ray.origin + tuv.x * ray.direction;
            var n = normalize(cross(v1 - v0, v2 - v0));
            if (dot(n, ray.direction) > 0.0) {
                n = -n;
            }
            (*best).normal = n;
            (*best).albedo = mesh_vec3(base, 18u);
            (*best).specular = vec3<f32>(mesh_f32(base, 21u));
            (*best).smoothness = mesh_f32(base, 22u);
            (*best).emission = mesh_vec3(base, 23u);
        }
    }
}

fn trace(ray: Ray) -> Hit {
    var best = no_hit();
    for (var i = 0u; i < params.sphere_count; i++) {
        intersect_sphere(ray, &best, i);
    }
    for (var i = 0u; i < params.mesh_count; i++) {
        intersect_mesh(ray, &best, i);
    }
    return best;
}

fn tangent_space(normal: vec3<f32>) -> mat3x3<f32> {
    var helper = vec3<f32>(1.0, 0.0, 0.0);
    if (abs(normal.x) > 0.99) {
        helper = vec3<f32>(0.0, 0.0, 1.0);
    }
    let tangent = normalize(cross(normal, helper));
    let binormal = normalize(cross(normal, tangent));
    return mat3x3<f32>(tangent, binormal, normal);
}

fn sample_hemisphere(normal: vec3<f32>, alpha: f32) -> vec3<f32> {
    let cos_theta = pow(rand(), 1.0 / (alpha + 1.0));
    let sin_theta = sqrt(max(0.0, 1.0 - cos_theta * cos_theta));
    let phi = 2.0 * PI * rand();
    let local = vec3<f32>(cos(phi) * sin_theta, sin(phi) * sin_theta, cos_theta);
    return tangent_space(normal) * local;
}

fn energy(color: vec3<f32>) -> f32 {
    return dot(color, vec3<f32>(1.0 / 3.0));
}

fn sky(direction: vec3<f32>) -> vec3<f32> {
    let dims = textureDimensions(_SkyboxTexture);
    let theta = acos(clamp(direction.y, -1.0, 1.0)) / PI;
    let phi = atan2(direction.x, -direction.z) / (-2.0 * PI) + 0.5;
    let x = min(u32(fract(phi) * f32(dims.x)), dims.x - 1u);
    let y = min(u32(theta * f32(dims.y)), dims.y - 1u);
    return textureLoad(_SkyboxTexture, vec2<u32>(x, y), 0).rgb * params._SkyBrightness;
}

fn shade(ray: ptr<function, Ray>, hit: Hit) -> vec3<f32> {
    if (hit.distance >= INF) {
        let color = sky((*ray).direction);
        (*ray).energy = vec3<f32>(0.0);
        return color;
    }

    let albedo = min(vec3<f32>(1.0) - hit.specular, hit.albedo);
    var spec_chance = energy(hit.specular);
    var diff_chance = energy(albedo);
    let sum = spec_chance + diff_chance;
    (*ray).origin = hit.position + hit.normal * 0.001;
    if (sum <= 0.0) {
        (*ray).energy = vec3<f32>(0.0);
        return hit.emission;
    }
    spec_chance /= sum;
    diff_chance /= sum;

    if (rand() < spec_chance) {
        let alpha = pow(1000.0, hit.smoothness * hit.smoothness);
        (*ray).direction = sample_hemisphere(reflect((*ray).direction, hit.normal), alpha);
        let f = (alpha + 2.0) / (alpha + 1.0);
        (*ray).energy *= (1.0 / spec_chance) * hit.specular * clamp(dot(hit.normal, (*ray).direction) * f, 0.0, 1.0);
    } else {
        (*ray).direction = sample_hemisphere(hit.normal, 1.0);
        (*ray).energy *= (1.0 / diff_chance) * albedo;
    }
    return hit.emission;
}

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let dims = textureDimensions(Result);
    if (id.x >= dims.x || id.y >= dims.y) {
        return;
    }
    rng_state = pcg(id.x + id.y * dims.x + pcg(bitcast<u32>(params._Seed)));

    var uv = ((vec2<f32>(id.xy) + params._PixelOffset) / vec2<f32>(dims)) * 2.0 - 1.0;
    uv.y = -uv.y;
    var ray = camera_ray(uv);

    var result = vec3<f32>(0.0);
    for (var i = 0u; i < params._Bounces; i++) {
        let hit = trace(ray);
        result += ray.energy * shade(&ray, hit);
        if (!any(ray.energy > vec3<f32>(0.0))) {
            break;
        }
    }
    textureStore(Result, vec2<i32>(id.xy), vec4<f32>(result, 1.0));
}
"#;

/// Accumulation blend: running mean of raw samples plus an 8-bit display copy.
pub const BLEND_SHADER_SOURCE: &str = r#"
struct BlendUniforms {
    weight: f32,
    sample_count: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var raw_sample: texture_2d<f32>;
@group(0) @binding(1) var converged: texture_storage_2d<rgba32float, read_write>;
@group(0) @binding(2) var display: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(3) var<uniform> blend: BlendUniforms;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let dims = textureDimensions(converged);
    if (id.x >= dims.x || id.y >= dims.y) {
        return;
    }
    let p = vec2<i32>(id.xy);
    let sample = textureLoad(raw_sample, p, 0);
    var result = sample;
    if (blend.sample_count > 0u) {
        result = mix(textureLoad(converged, p), sample, blend.weight);
    }
    textureStore(converged, p, result);
    let mapped = pow(clamp(result.rgb, vec3<f32>(0.0), vec3<f32>(1.0)), vec3<f32>(1.0 / 2.2));
    textureStore(display, p, vec4<f32>(mapped, 1.0));
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_groups_round_up() {
        assert_eq!(dispatch_groups(8, 8), [1, 1, 1]);
        assert_eq!(dispatch_groups(9, 16), [2, 2, 1]);
        assert_eq!(dispatch_groups(1920, 1080), [240, 135, 1]);
        assert_eq!(dispatch_groups(1, 1), [1, 1, 1]);
        assert_eq!(dispatch_groups(0, 0), [0, 0, 1]);
    }

    #[test]
    fn test_blend_weight_is_running_mean() {
        assert_eq!(blend_weight(0), 1.0);
        assert_eq!(blend_weight(1), 0.5);
        assert_eq!(blend_weight(3), 0.25);
        assert_eq!(BlendUniforms::new(u64::MAX).sample_count, u32::MAX);
    }

    #[test]
    fn test_kernel_declares_named_bindings() {
        for name in [
            bindings::RESULT,
            bindings::SKYBOX_TEXTURE,
            bindings::SPHERES,
            bindings::MESH_OBJECTS,
            bindings::VERTICES,
            bindings::INDICES,
            bindings::CAMERA_TO_WORLD,
            bindings::CAMERA_INVERSE_PROJECTION,
            bindings::PIXEL_OFFSET,
            bindings::SEED,
            bindings::SKY_BRIGHTNESS,
            bindings::BOUNCES,
        ] {
            assert!(TRACE_KERNEL_SOURCE.contains(name), "kernel is missing {name}");
        }
        assert!(TRACE_KERNEL_SOURCE.contains("@workgroup_size(8, 8, 1)"));
        assert_eq!(bindings::slot_of(bindings::INDICES), Some(bindings::INDICES_BINDING));
        assert_eq!(bindings::slot_of("_Normals"), None);
        assert!(BLEND_SHADER_SOURCE.contains("@workgroup_size(8, 8, 1)"));
    }

    #[test]
    fn test_uniform_layout() {
        let u = KernelUniforms::default().with_jitter(glam::Vec2::new(0.25, 0.75), 0.5);
        let bytes = bytemuck::bytes_of(&u);
        assert_eq!(bytes.len(), 160);
        // _PixelOffset sits right after the two matrices.
        let offset: [f32; 2] = bytemuck::pod_read_unaligned(&bytes[128..136]);
        assert_eq!(offset, [0.25, 0.75]);
    }
}
