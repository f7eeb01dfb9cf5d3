// vkr - a minimal real-time Vulkan renderer
//
// main.rs owns the window and input; everything GPU-side lives behind
// renderer::Renderer. The event loop requests a redraw every iteration,
// and each redraw drives exactly one frame: update the camera from input,
// then hand it to the renderer.

mod backend;
mod camera;
mod config;
mod model;
mod renderer;

use std::collections::HashSet;
use std::time::Instant;

use anyhow::Result;
use glam::Vec3;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, ElementState, MouseButton, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{CursorGrabMode, Fullscreen, Window, WindowAttributes, WindowId};

use camera::Camera;
use config::Config;
use model::Model;
use renderer::Renderer;

const CAMERA_SPEED: f32 = 5.0;
const LOOK_SPEED: f32 = 0.25;

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = Config::load();
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen {
            "fullscreen"
        } else {
            "windowed"
        }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

struct App {
    config: Config,

    // The renderer borrows the window's surface at creation, so it is
    // declared first and dropped first
    renderer: Option<Renderer>,
    window: Option<Window>,

    camera: Camera,
    yaw: f32,
    pitch: f32,
    pressed: HashSet<KeyCode>,
    mouse_focus: bool,

    is_minimized: bool,

    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let camera = Camera {
            pos: Vec3::new(-5.0, -10.0, 0.0),
            dir: (Vec3::ZERO - Vec3::new(-5.0, -10.0, 0.0)).normalize(),
            up: Vec3::new(0.0, 0.0, -1.0),
            fov: 45.0,
            aspect: config.window.width as f32 / config.window.height as f32,
        };
        let yaw = camera.dir.y.atan2(camera.dir.x).to_degrees();
        let pitch = (-camera.dir.z).asin().to_degrees();

        let now = Instant::now();
        Self {
            config,
            renderer: None,
            window: None,
            camera,
            yaw,
            pitch,
            pressed: HashSet::new(),
            mouse_focus: false,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let mut attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = event_loop.create_window(attributes)?;

        let mut renderer = Renderer::new(&window, &self.config)?;

        let model = Model::from_obj(&self.config.assets.model)?;
        log::info!(
            "Loaded model {:?}: {} vertices",
            self.config.assets.model,
            model.vertices.len()
        );
        renderer.add_model(model)?;

        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    fn tick(&mut self, event_loop: &ActiveEventLoop) {
        let now = Instant::now();
        let delta = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;

        if self.is_minimized {
            return;
        }

        self.update_camera(delta);

        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        match renderer.draw_frame(&self.camera) {
            Ok(true) => self.update_fps(now),
            Ok(false) => {}
            Err(e) => {
                log::error!("fatal frame error: {:#}", e);
                event_loop.exit();
            }
        }
    }

    fn update_camera(&mut self, delta: f32) {
        let dir = self.camera.dir;
        let right = dir.cross(self.camera.up).normalize();
        let step = CAMERA_SPEED * delta;

        if self.pressed.contains(&KeyCode::KeyW) {
            self.camera.pos += step * dir;
        }
        if self.pressed.contains(&KeyCode::KeyS) {
            self.camera.pos -= step * dir;
        }
        if self.pressed.contains(&KeyCode::KeyD) {
            self.camera.pos += step * right;
        }
        if self.pressed.contains(&KeyCode::KeyA) {
            self.camera.pos -= step * right;
        }
    }

    fn look(&mut self, dx: f64, dy: f64) {
        self.yaw = (self.yaw + LOOK_SPEED * dx as f32) % 360.0;
        self.pitch = (self.pitch - LOOK_SPEED * dy as f32).clamp(-89.0, 89.0);

        let (yaw, pitch) = (self.yaw.to_radians(), self.pitch.to_radians());
        self.camera.dir = Vec3::new(
            yaw.cos() * pitch.cos(),
            yaw.sin() * pitch.cos(),
            -pitch.sin(),
        )
        .normalize();
    }

    fn set_mouse_focus(&mut self, focus: bool) {
        let Some(window) = &self.window else { return };

        if focus {
            if let Err(e) = window
                .set_cursor_grab(CursorGrabMode::Confined)
                .or_else(|_| window.set_cursor_grab(CursorGrabMode::Locked))
            {
                log::warn!("Cannot grab cursor: {}", e);
                return;
            }
            window.set_cursor_visible(false);
        } else {
            let _ = window.set_cursor_grab(CursorGrabMode::None);
            window.set_cursor_visible(true);
        }

        self.mouse_focus = focus;
    }

    fn update_fps(&mut self, now: Instant) {
        if !self.config.debug.show_fps {
            return;
        }

        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(window) = &self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    1000.0 / fps.max(1.0)
                ));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        if let Err(e) = self.init(event_loop) {
            log::error!("fatal error: {:#}", e);
            event_loop.exit();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    if let Some(renderer) = self.renderer.as_mut() {
                        renderer.invalidate_swapchain();
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                self.tick(event_loop);
            }

            WindowEvent::KeyboardInput { event, .. } => {
                let PhysicalKey::Code(key) = event.physical_key else {
                    return;
                };

                match event.state {
                    ElementState::Pressed => {
                        self.pressed.insert(key);
                        match key {
                            KeyCode::Escape => event_loop.exit(),
                            KeyCode::Digit1 => self.set_mouse_focus(false),
                            KeyCode::KeyI => {
                                log::info!(
                                    "camera pos {:.2} {:.2} {:.2}, dir {:.2} {:.2} {:.2}",
                                    self.camera.pos.x,
                                    self.camera.pos.y,
                                    self.camera.pos.z,
                                    self.camera.dir.x,
                                    self.camera.dir.y,
                                    self.camera.dir.z,
                                );
                            }
                            _ => {}
                        }
                    }
                    ElementState::Released => {
                        self.pressed.remove(&key);
                    }
                }
            }

            WindowEvent::MouseInput {
                state: ElementState::Pressed,
                button: MouseButton::Left,
                ..
            } => {
                self.set_mouse_focus(true);
            }

            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        _device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            if self.mouse_focus {
                self.look(dx, dy);
            }
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}
