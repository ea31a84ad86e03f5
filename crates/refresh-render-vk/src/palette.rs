// SPDX-License-Identifier: CEPL-1.0
use refresh_render::Color;

/// 8-bit colour lookup used by palette fills and indexed particles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Palette([Color; 256]);

impl Default for Palette {
    /// Grey ramp; index 255 is fully transparent.
    fn default() -> Self {
        let mut colors = [Color::TRANSPARENT; 256];
        for (i, c) in colors.iter_mut().enumerate().take(255) {
            let v = i as u8;
            *c = Color::rgba(v, v, v, 255);
        }
        Palette(colors)
    }
}

impl Palette {
    /// From 768 bytes of packed RGB. Index 255 stays transparent.
    pub fn from_rgb(rgb: &[u8]) -> Option<Self> {
        if rgb.len() != 768 {
            return None;
        }
        let mut colors = [Color::TRANSPARENT; 256];
        for (c, px) in colors.iter_mut().zip(rgb.chunks_exact(3)).take(255) {
            *c = Color::rgba(px[0], px[1], px[2], 255);
        }
        Some(Palette(colors))
    }

    pub fn get(&self, index: u8) -> Color {
        self.0[index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_entry_is_transparent() {
        let pal = Palette::from_rgb(&[200u8; 768]).unwrap();
        assert_eq!(pal.get(0), Color::rgba(200, 200, 200, 255));
        assert_eq!(pal.get(255).alpha(), 0);
        assert!(Palette::from_rgb(&[0u8; 12]).is_none());
        assert_eq!(Palette::default().get(16), Color::rgba(16, 16, 16, 255));
    }
}
