//! Render collaborator interface.
//!
//! The server never paints pixels itself. Workers hand each request to a
//! [`TileRenderer`] and ship back whatever bytes (or error) it returns.

use std::fmt::Write as _;

use thiserror::Error;

use crate::config::Config;
use crate::protocol::{MessageType, Tile};

/// Largest width or height [`PlaceholderRenderer`] will produce.
pub const MAX_PLACEHOLDER_EDGE: i32 = 4096;

/// Failure reported back to the client in place of a tile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("render failed: {0}")]
    Failed(String),
    #[error("invalid tile dimensions {w}x{h}")]
    InvalidDimensions { w: i32, h: i32 },
    #[error("renderer panicked: {0}")]
    Panicked(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

pub trait TileRenderer: Send + Sync + 'static {
    /// Called once before the server accepts connections. Plugin and font
    /// registration belongs here, driven by [`Config::assets`].
    fn initialize(&mut self, config: &Config) -> Result<(), RenderError> {
        let _ = config;
        Ok(())
    }

    /// Renders one tile. `kind` is [`MessageType::Prerender`] for prerender
    /// requests, whose interpretation is up to the implementation.
    fn render(&self, kind: MessageType, tile: &Tile) -> Result<Vec<u8>, RenderError>;
}

/// Adapts a closure into a [`TileRenderer`].
pub struct RenderFn<F>(pub F);

impl<F> TileRenderer for RenderFn<F>
where
    F: Fn(MessageType, &Tile) -> Result<Vec<u8>, RenderError> + Send + Sync + 'static,
{
    fn render(&self, kind: MessageType, tile: &Tile) -> Result<Vec<u8>, RenderError> {
        (self.0)(kind, tile)
    }
}

/// Stand-in renderer producing a binary PPM checkerboard of the requested
/// size, tinted by the tile coordinates.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderRenderer {
    tile_db: Option<String>,
}

impl PlaceholderRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tile_db(&self) -> Option<&str> {
        self.tile_db.as_deref()
    }
}

impl TileRenderer for PlaceholderRenderer {
    fn initialize(&mut self, config: &Config) -> Result<(), RenderError> {
        let assets = config.assets();
        if assets.plugins.is_some() || assets.fonts.is_some() {
            tracing::info!(
                plugins = ?assets.plugins,
                fonts = ?assets.fonts,
                "placeholder renderer ignores plugins and fonts"
            );
        }
        self.tile_db = Some(config.tile_db().to_string());
        Ok(())
    }

    fn render(&self, _kind: MessageType, tile: &Tile) -> Result<Vec<u8>, RenderError> {
        let (w, h) = (tile.w, tile.h);
        if !(1..=MAX_PLACEHOLDER_EDGE).contains(&w) || !(1..=MAX_PLACEHOLDER_EDGE).contains(&h) {
            return Err(RenderError::InvalidDimensions { w, h });
        }

        let mut header = String::new();
        let _ = write!(header, "P6\n{w} {h}\n255\n");

        let tint = [
            (tile.x.wrapping_mul(37) & 0x7f) as u8,
            (tile.y.wrapping_mul(59) & 0x7f) as u8,
            (tile.z.wrapping_mul(83) & 0x7f) as u8,
        ];
        let (w, h) = (w as usize, h as usize);
        let mut image = Vec::with_capacity(header.len() + w * h * 3);
        image.extend_from_slice(header.as_bytes());
        for row in 0..h {
            for col in 0..w {
                let light = ((row / 16) + (col / 16)) % 2 == 0;
                let base = if light { 0x80 } else { 0x00 };
                image.extend(tint.iter().map(|t| base | t));
            }
        }
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(w: i32, h: i32) -> Tile {
        Tile {
            x: 1,
            y: 2,
            z: 3,
            w,
            h,
        }
    }

    #[test]
    fn test_placeholder_ppm_size() {
        let image = PlaceholderRenderer::new()
            .render(MessageType::TileRequest, &tile(32, 16))
            .unwrap();
        let header = b"P6\n32 16\n255\n";
        assert!(image.starts_with(header));
        assert_eq!(image.len(), header.len() + 32 * 16 * 3);
    }

    #[test]
    fn test_placeholder_rejects_bad_dimensions() {
        let renderer = PlaceholderRenderer::new();
        for (w, h) in [(0, 256), (256, -1), (MAX_PLACEHOLDER_EDGE + 1, 1)] {
            assert_eq!(
                renderer.render(MessageType::TileRequest, &tile(w, h)),
                Err(RenderError::InvalidDimensions { w, h })
            );
        }
    }

    #[test]
    fn test_placeholder_is_deterministic() {
        let renderer = PlaceholderRenderer::new();
        let a = renderer.render(MessageType::TileRequest, &tile(8, 8)).unwrap();
        let b = renderer.render(MessageType::TileRequest, &tile(8, 8)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_initialize_reads_tile_db() {
        let config = Config::from_pairs([("tile_db", "/var/cache/tiles.db")]).unwrap();
        let mut renderer = PlaceholderRenderer::new();
        renderer.initialize(&config).unwrap();
        assert_eq!(renderer.tile_db(), Some("/var/cache/tiles.db"));
    }

    #[test]
    fn test_render_fn_adapter() {
        let renderer = RenderFn(
            |kind: MessageType, tile: &Tile| -> Result<Vec<u8>, RenderError> {
                Ok(vec![kind.as_wire() as u8, tile.z as u8])
            },
        );
        assert_eq!(
            renderer.render(MessageType::Prerender, &tile(1, 1)),
            Ok(vec![2, 3])
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            RenderError::InvalidDimensions { w: 0, h: 5 }.to_string(),
            "invalid tile dimensions 0x5"
        );
        assert_eq!(
            RenderError::Rejected("server busy".into()).to_string(),
            "request rejected: server busy"
        );
    }
}
