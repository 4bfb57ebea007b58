//! Main viewer application

use std::path::PathBuf;

use egui::{CentralPanel, RichText, Sense, SidePanel};
use glam::Vec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::camera::OrbitCamera;
use crate::camera::CameraTracker;
use crate::gpu::WgpuBackend;
use crate::render_loop::{FrameInput, FrameOutcome, RenderLoop};
use crate::scene::generate::{cuboid, default_light, demo_scene};
use crate::scene::{MeshMaterial, SceneObject, SceneObjectHandle, SphereLight};
use crate::settings::{Settings, MAX_BOUNCES};
use crate::TracingGuard;

/// Display texture registered with egui, tagged with the backend generation it came from.
struct DisplayTexture {
    id: egui::TextureId,
    generation: u64,
}

pub struct TracerApp {
    settings: Settings,
    tracer: Option<RenderLoop<WgpuBackend>>,
    camera: OrbitCamera,
    camera_tracker: CameraTracker,
    scene_rng: StdRng,
    /// Objects from the last generated scene; `light` is among them.
    scene_objects: Vec<SceneObjectHandle>,
    light: Option<SceneObjectHandle>,
    boxes: Vec<SceneObjectHandle>,
    display: Option<DisplayTexture>,
    last_outcome: Option<FrameOutcome>,
    status_message: String,
    _trace_guard: TracingGuard,
}

impl TracerApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        settings: Settings,
        skybox: Option<PathBuf>,
        trace_guard: TracingGuard,
    ) -> Self {
        let scene_rng = match settings.render.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let camera = OrbitCamera::new(
            Vec3::ZERO,
            settings.camera_distance,
            settings.camera_yaw,
            settings.camera_pitch,
        );

        let mut status_message = "Ready".to_string();
        let tracer = match &cc.wgpu_render_state {
            Some(render_state) => {
                let mut backend = WgpuBackend::new(render_state.device.clone(), render_state.queue.clone());
                if let Some(path) = &skybox {
                    match super::skybox::load(path) {
                        Ok((w, h, texels)) => {
                            if let Err(err) = backend.set_skybox(w, h, &texels) {
                                status_message = format!("Skybox rejected: {err}");
                            }
                        }
                        Err(err) => status_message = format!("Failed to load {}: {err}", path.display()),
                    }
                }
                Some(RenderLoop::new(backend, settings.render.clone()))
            }
            None => {
                status_message = "No wgpu render state; the tracer needs the wgpu renderer".to_string();
                None
            }
        };
        if status_message != "Ready" {
            tracing::warn!("{status_message}");
        }

        let mut app = Self {
            settings,
            tracer,
            camera,
            camera_tracker: CameraTracker::default(),
            scene_rng,
            scene_objects: Vec::new(),
            light: None,
            boxes: Vec::new(),
            display: None,
            last_outcome: None,
            status_message,
            _trace_guard: trace_guard,
        };
        app.regenerate_scene();
        app
    }

    /// Replace the generated objects with a fresh random layout. Boxes stay.
    fn regenerate_scene(&mut self) {
        let Some(tracer) = &mut self.tracer else {
            return;
        };
        let registry = tracer.registry_mut();
        for handle in self.scene_objects.drain(..) {
            registry.unregister(&handle);
        }
        self.scene_objects = demo_scene(&mut self.scene_rng, &self.settings.scene);
        for handle in &self.scene_objects {
            registry.register(handle.clone());
        }
        self.light = self.scene_objects.iter().find(|h| h.is_light()).cloned();
        tracing::info!(objects = registry.len(), "scene generated");
    }

    fn add_box(&mut self) {
        let Some(tracer) = &mut self.tracer else {
            return;
        };
        let spread = self.settings.scene.placement_radius.max(1.0);
        let half = Vec3::splat(self.scene_rng.gen_range(2.0..6.0));
        let center = Vec3::new(
            self.scene_rng.gen_range(-spread..spread),
            half.y,
            self.scene_rng.gen_range(-spread..spread),
        );
        let albedo = Vec3::new(self.scene_rng.gen(), self.scene_rng.gen(), self.scene_rng.gen());
        let handle = SceneObjectHandle::new(cuboid(center, half, MeshMaterial::diffuse(albedo)));
        tracer.registry_mut().register(handle.clone());
        self.boxes.push(handle);
    }

    fn remove_box(&mut self) {
        if let (Some(tracer), Some(handle)) = (&mut self.tracer, self.boxes.pop()) {
            tracer.registry_mut().unregister(&handle);
        }
    }

    /// Move the light by swapping its registration for a moved copy.
    fn move_light(&mut self, position: Vec3) {
        let (Some(tracer), Some(old)) = (&mut self.tracer, self.light.clone()) else {
            return;
        };
        let SceneObject::Light(light) = old.object() else {
            return;
        };
        let moved = SceneObjectHandle::new(SphereLight { position, ..*light });
        let registry = tracer.registry_mut();
        registry.unregister(&old);
        registry.register(moved.clone());
        if let Some(slot) = self.scene_objects.iter_mut().find(|h| **h == old) {
            *slot = moved.clone();
        }
        self.light = Some(moved);
    }

    fn light_position(&self) -> Option<Vec3> {
        match self.light.as_deref() {
            Some(SceneObject::Light(light)) => Some(light.position),
            _ => None,
        }
    }

    fn side_panel(&mut self, ui: &mut egui::Ui) {
        ui.heading("Progressive Tracer");
        ui.separator();

        let Some(tracer) = &self.tracer else {
            ui.label(RichText::new(&self.status_message).color(egui::Color32::LIGHT_RED));
            return;
        };
        ui.label(format!("Samples: {}", tracer.sample_count()));
        let flat = tracer.snapshot();
        ui.label(format!(
            "Meshes: {}  Spheres: {}  Triangles: {}",
            flat.mesh_descriptors.len(),
            flat.sphere_descriptors.len(),
            flat.indices.len() / 3
        ));
        if let Some(FrameOutcome::Skipped(reason)) = self.last_outcome {
            ui.label(RichText::new(format!("Last frame skipped: {reason:?}")).color(egui::Color32::YELLOW));
        }
        ui.label(&self.status_message);
        ui.separator();

        let mut render = tracer.render_settings().clone();
        ui.add(egui::Slider::new(&mut render.sky_brightness, 0.0..=4.0).text("Sky brightness"));
        ui.add(egui::Slider::new(&mut render.bounces, 1..=MAX_BOUNCES).text("Bounces"));
        if render != *tracer.render_settings() {
            self.settings.render = render.clone();
            if let Some(tracer) = &mut self.tracer {
                tracer.set_render_settings(render);
            }
        }
        ui.separator();

        ui.add(egui::Slider::new(&mut self.settings.scene.num_spheres, 0..=500).text("Spheres"));
        if ui.button("Regenerate scene").clicked() {
            self.regenerate_scene();
        }
        ui.horizontal(|ui| {
            if ui.button("Add box").clicked() {
                self.add_box();
            }
            if ui.add_enabled(!self.boxes.is_empty(), egui::Button::new("Remove box")).clicked() {
                self.remove_box();
            }
        });

        if let Some(mut position) = self.light_position() {
            ui.label("Light position");
            let mut changed = false;
            ui.horizontal(|ui| {
                for axis in 0..3 {
                    changed |= ui.add(egui::DragValue::new(&mut position[axis]).speed(0.5)).changed();
                }
            });
            if ui.button("Reset light").clicked() {
                position = default_light(&self.settings.scene).position;
                changed = true;
            }
            if changed {
                self.move_light(position);
            }
        }
    }

    fn handle_input(&mut self, ui: &egui::Ui, response: &egui::Response) {
        if response.dragged_by(egui::PointerButton::Primary) {
            let delta = response.drag_delta();
            self.camera.orbit(delta.x, delta.y);
        }
        if response.dragged_by(egui::PointerButton::Middle) {
            let delta = response.drag_delta();
            self.camera.pan(delta.x, delta.y);
        }
        if response.dragged_by(egui::PointerButton::Secondary) {
            self.camera.zoom(response.drag_delta().y * 0.1);
        }
        if response.hovered() {
            let scroll = ui.input(|i| i.raw_scroll_delta.y);
            if scroll != 0.0 {
                self.camera.zoom(scroll);
            }
        }
    }

    fn viewport(&mut self, ui: &mut egui::Ui, frame: &eframe::Frame) {
        let _span = tracing::info_span!("viewport_show").entered();
        let size = ui.available_size();
        let (rect, response) = ui.allocate_exact_size(size, Sense::click_and_drag());

        self.handle_input(ui, &response);
        self.camera.update(ui.input(|i| i.stable_dt));

        let (Some(tracer), Some(render_state)) = (&mut self.tracer, frame.wgpu_render_state()) else {
            ui.painter().rect_filled(rect, 0.0, egui::Color32::from_rgb(30, 30, 35));
            return;
        };

        let ppp = ui.ctx().pixels_per_point();
        let width = (rect.width() * ppp) as u32;
        let height = (rect.height() * ppp) as u32;
        let state = self.camera.state(rect.width() / rect.height().max(1.0));
        let moved = self.camera_tracker.update(&state);
        let input = FrameInput::new(width, height, state).with_camera_changed(moved);
        self.last_outcome = Some(tracer.run_frame(&input));

        let backend = tracer.backend();
        let generation = backend.display_generation();
        if self.display.as_ref().map(|d| d.generation) != Some(generation) {
            if let Some(view) = backend.display_view() {
                let mut renderer = render_state.renderer.write();
                if let Some(old) = self.display.take() {
                    renderer.free_texture(&old.id);
                }
                let id = renderer.register_native_texture(&render_state.device, view, wgpu::FilterMode::Linear);
                self.display = Some(DisplayTexture { id, generation });
            }
        }

        if let Some(display) = &self.display {
            ui.painter().image(
                display.id,
                rect,
                egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
                egui::Color32::WHITE,
            );
        }
    }
}

impl eframe::App for TracerApp {
    fn on_exit(&mut self) {
        if let Some(tracer) = &mut self.tracer {
            tracer.release();
        }
        self.settings.camera_distance = self.camera.distance();
        let (yaw, pitch) = self.camera.angles();
        self.settings.camera_yaw = yaw;
        self.settings.camera_pitch = pitch;
        self.settings.save();
    }

    fn update(&mut self, ctx: &egui::Context, frame: &mut eframe::Frame) {
        let _span = tracing::info_span!("viewer_update").entered();

        if let Some(rect) = ctx.input(|i| i.viewport().inner_rect) {
            self.settings.window_width = rect.width();
            self.settings.window_height = rect.height();
        }

        SidePanel::right("side_panel")
            .resizable(true)
            .default_width(260.0)
            .show(ctx, |ui| self.side_panel(ui));

        CentralPanel::default()
            .frame(egui::Frame::NONE)
            .show(ctx, |ui| self.viewport(ui, frame));

        // Progressive: keep sampling while the window is open.
        ctx.request_repaint();
    }
}
