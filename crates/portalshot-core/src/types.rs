use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::CaptureError;

// MARK: - PixelFormat

/// Pixel layout of a delivered frame. Only packed 24-bit RGB is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 3 bytes per pixel: Red, Green, Blue, rows tightly packed.
    Rgb,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb => 3,
        }
    }
}

// MARK: - FrameBuffer

/// One decoded still frame, owned by whoever received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    pub width:  u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Exactly `width * height * 3` bytes.
    pub data:   Bytes,
}

impl FrameBuffer {
    /// Byte length of a tightly packed RGB frame, or `None` on overflow.
    pub fn packed_len(width: u32, height: u32) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(PixelFormat::Rgb.bytes_per_pixel())
    }

    pub fn row_len(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Pixel at `(x, y)` as `[r, g, b]`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = y as usize * self.row_len() + x as usize * 3;
        let px = self.data.get(at..at + 3)?;
        Some([px[0], px[1], px[2]])
    }
}

impl std::fmt::Display for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{} RGB ({} bytes)", self.width, self.height, self.data.len())
    }
}

// MARK: - CaptureEvent

/// Terminal notification for one capture attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Succeeded(FrameBuffer),
    Failed(CaptureError),
}

impl CaptureEvent {
    /// Failure text as shown to the user, `None` on success.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Succeeded(_) => None,
            Self::Failed(e) => Some(e.to_string()),
        }
    }
}

// MARK: - CaptureStep

/// The three broker requests of a capture negotiation, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureStep {
    CreateSession,
    SelectSources,
    Start,
}

impl std::fmt::Display for CaptureStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateSession => write!(f, "CreateSession"),
            Self::SelectSources => write!(f, "SelectSources"),
            Self::Start => write!(f, "Start"),
        }
    }
}

// MARK: - SourceKind

/// Kind of content the broker may offer the user to share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Monitor,
    Window,
    Virtual,
}

impl SourceKind {
    /// Bit in the portal's `types` option.
    pub const fn bit(self) -> u32 {
        match self {
            Self::Monitor => 1,
            Self::Window => 2,
            Self::Virtual => 4,
        }
    }

    /// Combined `types` bitmask for a set of kinds.
    pub fn mask(kinds: &[SourceKind]) -> u32 {
        kinds.iter().fold(0, |mask, kind| mask | kind.bit())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "monitor" | "screen" => Ok(Self::Monitor),
            "window" => Ok(Self::Window),
            "virtual" => Ok(Self::Virtual),
            other => Err(format!("unknown source kind '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_len_is_three_bytes_per_pixel() {
        assert_eq!(FrameBuffer::packed_len(100, 50), Some(15_000));
        assert_eq!(FrameBuffer::packed_len(0, 50), Some(0));
        assert_eq!(FrameBuffer::packed_len(u32::MAX, u32::MAX), None);
    }

    #[test]
    fn pixel_lookup_uses_packed_rows() {
        let mut data = vec![0u8; 2 * 2 * 3];
        data[9..12].copy_from_slice(&[7, 8, 9]);
        let frame = FrameBuffer { width: 2, height: 2, format: PixelFormat::Rgb, data: data.into() };
        assert_eq!(frame.pixel(1, 1), Some([7, 8, 9]));
        assert_eq!(frame.pixel(2, 0), None);
    }

    #[test]
    fn screen_plus_window_mask() {
        assert_eq!(SourceKind::mask(&[SourceKind::Monitor, SourceKind::Window]), 3);
        assert_eq!(SourceKind::mask(&[]), 0);
        assert_eq!("screen".parse::<SourceKind>(), Ok(SourceKind::Monitor));
        assert!("tab".parse::<SourceKind>().is_err());
    }
}
