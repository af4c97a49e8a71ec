use std::fmt;
use std::str::FromStr;

use crate::error::ManifestError;

/// A video resolution in pixels, as advertised by `RESOLUTION=WxH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count, used for closest-match comparisons.
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| ManifestError::InvalidResolution(s.to_string()))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| ManifestError::InvalidResolution(s.to_string()))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| ManifestError::InvalidResolution(s.to_string()))?;
        Ok(Self { width, height })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Resolution::new(1920, 1080).to_string(), "1920x1080");
    }

    #[test]
    fn test_parse() {
        let res: Resolution = "1280x720".parse().unwrap();
        assert_eq!(res, Resolution::new(1280, 720));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("1920".parse::<Resolution>().is_err());
        assert!("ax b".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_pixels() {
        assert_eq!(Resolution::new(1920, 1080).pixels(), 2_073_600);
    }
}
