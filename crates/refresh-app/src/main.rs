// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use refresh_core::{init_tracing, load_config, RenderConfig};
use refresh_render::{CharFlags, Color, Draw2D, ImageFlags, ImageHandle, ImageType, RenderSize, Renderer};
use refresh_render_vk::VkRenderer;
use tracing::{error, info, warn};

use refresh_platform::winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

mod assets;
mod scene;

use assets::ProceduralAssets;
use scene::DemoModels;

/// Frame rate while the window is unfocused.
const UNFOCUSED_FPS: u32 = 30;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Renderer settings file (defaults to refresh.toml in the working directory)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 1280)]
    width: u32,
    #[arg(long, default_value_t = 720)]
    height: u32,
    /// Overrides `shader_dir` from the settings file
    #[arg(long)]
    shader_dir: Option<PathBuf>,
    /// Overrides `swap_interval` from the settings file
    #[arg(long)]
    swap_interval: Option<i32>,
    /// Exit after this many rendered frames
    #[arg(long)]
    frames: Option<u64>,
}

impl Args {
    fn load(&self) -> Result<RenderConfig> {
        let mut cfg = load_config(self.config.as_deref())?;
        if let Some(dir) = &self.shader_dir {
            cfg.shader_dir = dir.clone();
        }
        if let Some(interval) = self.swap_interval {
            cfg.swap_interval = interval;
        }
        Ok(cfg)
    }
}

#[derive(Default)]
struct Hud {
    font: ImageHandle,
    checker: ImageHandle,
    backtile: ImageHandle,
}

struct App {
    args: Args,
    cfg: RenderConfig,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    render_size: RenderSize,
    models: DemoModels,
    hud: Hud,

    started: Instant,
    exiting: bool,
    frames: u32,
    total_frames: u64,
    fps: u32,
    last_fps_instant: Instant,

    paused: bool,
    focused: bool,
    next_frame_deadline: Option<Instant>,
}

impl App {
    fn new(args: Args, cfg: RenderConfig) -> Self {
        let render_size = RenderSize { width: args.width.max(1), height: args.height.max(1) };
        App {
            args,
            cfg,
            window: None,
            renderer: None,
            render_size,
            models: DemoModels::default(),
            hud: Hud::default(),
            started: Instant::now(),
            exiting: false,
            frames: 0,
            total_frames: 0,
            fps: 0,
            last_fps_instant: Instant::now(),
            paused: false,
            focused: true,
            next_frame_deadline: None,
        }
    }

    fn vsync(&self) -> bool {
        self.cfg.swap_interval() > 0
    }

    fn exit(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        if let Some(mut renderer) = self.renderer.take() {
            info!("last frame: {:?}", renderer.stats());
            renderer.shutdown();
        }
        self.window = None;
        event_loop.exit();
    }

    fn create_renderer(&mut self, window: &Window) -> Result<VkRenderer> {
        let mut renderer = VkRenderer::new(
            window,
            window,
            self.render_size,
            self.cfg.clone(),
            Box::new(ProceduralAssets),
        )?;

        renderer.begin_registration("demo");
        self.models = DemoModels {
            cube: renderer.register_model(assets::CUBE),
            flare: renderer.register_model(assets::FLARE),
            skin: renderer.register_image(assets::CUBE_SKIN, ImageType::Skin, ImageFlags::empty()),
        };
        self.hud = Hud {
            font: renderer.register_image(assets::CONCHARS, ImageType::Font, ImageFlags::PERMANENT),
            checker: renderer.register_image(assets::CHECKER, ImageType::Pic, ImageFlags::empty()),
            backtile: renderer.register_image(assets::BACKTILE, ImageType::Pic, ImageFlags::empty()),
        };
        renderer.end_registration();

        if self.models.cube.is_null() || self.hud.font.is_null() {
            warn!("demo assets failed to register; the scene will be incomplete");
        }
        Ok(renderer)
    }

    fn reload_config(&mut self) {
        match self.args.load() {
            Ok(cfg) => {
                info!("config reloaded");
                self.cfg = cfg.clone();
                if let Some(renderer) = &mut self.renderer {
                    renderer.set_config(cfg);
                }
                self.next_frame_deadline = None;
            }
            Err(e) => error!("config reload failed: {e:#}"),
        }
    }

    fn draw_hud(&self, renderer: &mut VkRenderer) {
        let scale = renderer.auto_scale().max(1);
        renderer.set_scale(scale as f32);
        let w = self.render_size.width as i32 / scale;
        let h = self.render_size.height as i32 / scale;

        renderer.tile_clear(0, h - 24, w, 24, self.hud.backtile);
        renderer.draw_fill32(4, 4, 132, 28, Color::rgba(0, 0, 0, 160));
        let text = format!("fps {}", self.fps);
        renderer.draw_string(8, 8, CharFlags::DROPSHADOW, text.len(), &text, Color::WHITE, self.hud.font);
        let stats = renderer.stats();
        let text = format!("draws {}", stats.draw_calls);
        renderer.draw_string(8, 18, CharFlags::ALTCOLOR, text.len(), &text, Color::WHITE, self.hud.font);
        renderer.draw_stretch_pic(w - 36, 4, 32, 32, Color::rgba(255, 255, 255, 200), self.hud.checker);
        renderer.draw_string(8, h - 16, CharFlags::empty(), 64, "F5 reload settings", Color::WHITE, self.hud.font);
        renderer.set_scale(1.0);
    }

    fn redraw(&mut self) {
        let Some(mut renderer) = self.renderer.take() else {
            return;
        };
        if !self.vsync() && !renderer.video_sync() {
            self.renderer = Some(renderer);
            return;
        }

        let t = self.started.elapsed().as_secs_f32();
        let fd = scene::build(&self.models, t, self.render_size.width, self.render_size.height);
        let res = renderer.begin_frame().and_then(|ready| {
            if ready {
                renderer.render_frame(&fd);
                self.draw_hud(&mut renderer);
                renderer.end_frame()?;
            }
            Ok(ready)
        });
        match res {
            Ok(true) => {
                // count only frames that were actually rendered
                self.frames = self.frames.saturating_add(1);
                self.total_frames += 1;
            }
            Ok(false) => {}
            Err(e) => error!("render error: {e:#}"),
        }
        self.renderer = Some(renderer);
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            let window = match refresh_platform::open_window(
                event_loop,
                "refresh",
                self.render_size.width,
                self.render_size.height,
            ) {
                Ok(w) => w,
                Err(e) => {
                    error!("{e:#}");
                    self.exit(event_loop);
                    return;
                }
            };

            let size = window.inner_size();
            self.render_size = RenderSize { width: size.width, height: size.height };

            match self.create_renderer(&window) {
                Ok(renderer) => self.renderer = Some(renderer),
                Err(e) => {
                    error!("renderer init failed: {e:#}");
                    self.exit(event_loop);
                    return;
                }
            }
            info!("swap interval = {}", self.cfg.swap_interval());
            self.window = Some(window);
        }

        event_loop.set_control_flow(if self.vsync() { ControlFlow::Wait } else { ControlFlow::Poll });

        self.paused = self.render_size.width == 0 || self.render_size.height == 0;
        info!("resumed → paused={}", self.paused);

        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.exit(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize { width: new_size.width, height: new_size.height };
                let now_paused = new_size.width == 0 || new_size.height == 0;
                if self.paused != now_paused {
                    self.paused = now_paused;
                }
                info!("Resized → {}x{} (paused={})", new_size.width, new_size.height, self.paused);

                if !self.paused {
                    if let Some(renderer) = &mut self.renderer {
                        if let Err(e) = renderer.resize(self.render_size) {
                            error!("resize failed: {e:#}");
                        }
                    }
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::Occluded(occluded) => {
                let now_paused = occluded || self.render_size.width == 0 || self.render_size.height == 0;
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!("Occluded={} → paused={}", occluded, self.paused);
                }
            }

            WindowEvent::Focused(focused) => {
                if self.focused != focused {
                    self.focused = focused;
                    info!("Focused({})", focused);
                    if focused {
                        self.next_frame_deadline = None;
                    }
                }
            }

            WindowEvent::KeyboardInput {
                event: KeyEvent { physical_key: PhysicalKey::Code(code), state: ElementState::Pressed, repeat: false, .. },
                ..
            } => match code {
                KeyCode::F5 => self.reload_config(),
                KeyCode::Escape => self.exit(event_loop),
                _ => {}
            },

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                self.redraw();
                if self.args.frames.is_some_and(|n| self.total_frames >= n) {
                    info!("rendered {} frames, exiting", self.total_frames);
                    self.exit(event_loop);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }

        if self.paused {
            // window-size=0 or occluded → sleep
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }

        if self.focused {
            event_loop.set_control_flow(if self.vsync() { ControlFlow::Wait } else { ControlFlow::Poll });
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        } else {
            let now = Instant::now();
            let frame_dt = Duration::from_nanos(1_000_000_000 / UNFOCUSED_FPS as u64);
            match self.next_frame_deadline {
                Some(t) if now < t => {
                    // not time yet: sleep until the stored deadline
                    event_loop.set_control_flow(ControlFlow::WaitUntil(t));
                }
                _ => {
                    let next = now + frame_dt;
                    self.next_frame_deadline = Some(next);
                    event_loop.set_control_flow(ControlFlow::WaitUntil(next));
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.fps = self.frames;
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = args.load()?;
    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(args, cfg);
    event_loop.run_app(&mut app)?;
    Ok(())
}
