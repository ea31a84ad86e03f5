// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use anyhow::{Context, Result};
use winit::{dpi::PhysicalSize, event_loop::ActiveEventLoop, window::Window};

/// Opens the main window at `width` x `height` physical pixels.
pub fn open_window(event_loop: &ActiveEventLoop, title: &str, width: u32, height: u32) -> Result<Window> {
    let attrs = Window::default_attributes()
        .with_title(title)
        .with_inner_size(PhysicalSize::new(width.max(1), height.max(1)));
    let window = event_loop.create_window(attrs).context("create_window")?;
    tracing::info!("window opened ({}x{})", width, height);
    Ok(window)
}
